use diesel::prelude::*;

use crate::database::{DbPool, schema::checkpoints, utils::now_rfc3339};

use super::{CheckpointError, CheckpointSnapshot};

// ─── Row type ─────────────────────────────────────────────────────────────────

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = checkpoints)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct CheckpointRow {
    run_id: String,
    agent_id: String,
    step_id: i32,
    snapshot: String,
    created_at: String,
}

// ─── CheckpointStore ──────────────────────────────────────────────────────────

/// Persists agent working-state snapshots keyed by (run, agent, step).
///
/// Only the latest snapshot per (run, agent) is needed for resume; history is
/// retained for replay checks.  Re-saving the same key overwrites.
pub struct CheckpointStore {
    pool: DbPool,
}

impl CheckpointStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn save(
        &self,
        run_id: &str,
        agent_id: &str,
        step_id: i32,
        snapshot: &CheckpointSnapshot,
    ) -> Result<(), CheckpointError> {
        let row = CheckpointRow {
            run_id: run_id.to_string(),
            agent_id: agent_id.to_string(),
            step_id,
            snapshot: serde_json::to_string(snapshot)
                .map_err(|e| CheckpointError::Codec(e.to_string()))?,
            created_at: now_rfc3339(),
        };
        let mut conn = self
            .pool
            .get()
            .map_err(|e| CheckpointError::Pool(e.to_string()))?;
        diesel::replace_into(checkpoints::table)
            .values(&row)
            .execute(&mut conn)?;
        Ok(())
    }

    /// The most recent snapshot for (run, agent), with its step id.
    pub fn latest(
        &self,
        run_id: &str,
        agent_id: &str,
    ) -> Result<Option<(i32, CheckpointSnapshot)>, CheckpointError> {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| CheckpointError::Pool(e.to_string()))?;
        let row: Option<CheckpointRow> = checkpoints::table
            .filter(checkpoints::run_id.eq(run_id))
            .filter(checkpoints::agent_id.eq(agent_id))
            .order(checkpoints::step_id.desc())
            .select(CheckpointRow::as_select())
            .first(&mut conn)
            .optional()?;
        match row {
            None => Ok(None),
            Some(row) => {
                let snapshot = serde_json::from_str(&row.snapshot)
                    .map_err(|e| CheckpointError::Codec(e.to_string()))?;
                Ok(Some((row.step_id, snapshot)))
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
