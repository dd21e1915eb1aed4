//! `DependencyTracker` — parent↔child run linkage.
//!
//! A parent run escalating work to a child records one dependency row per
//! (parent, child) pair; the parent then sits in `waiting`.  When the child
//! reaches a terminal state, the tracker writes the result onto the row and
//! re-enqueues the parent, which consumes it on resume via
//! [`DependencyTracker::take_completed`].

use std::sync::Arc;

use diesel::prelude::*;

use crate::database::{DbPool, schema::run_dependencies, utils::now_rfc3339};
use crate::runs::{QueueError, RunQueue, RunStatus};

#[derive(Debug, thiserror::Error)]
pub enum EscalationError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("storage error: {0}")]
    Storage(#[from] diesel::result::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

const STATUS_PENDING: &str = "pending";
const STATUS_COMPLETED: &str = "completed";
const STATUS_FAILED: &str = "failed";

// ─── Row type ─────────────────────────────────────────────────────────────────

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = run_dependencies)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct DependencyRow {
    parent_run_id: String,
    child_run_id: String,
    tool_call_id: String,
    goal: String,
    status: String,
    result: Option<String>,
    error: Option<String>,
    applied: i32,
    created_at: String,
    completed_at: Option<String>,
}

/// A settled dependency handed to the resuming parent.
#[derive(Debug, Clone)]
pub struct SettledDependency {
    pub parent_run_id: String,
    pub child_run_id: String,
    pub tool_call_id: String,
    pub goal: String,
    /// `completed` or `failed` (a cancelled child settles as failed).
    pub status: String,
    pub result: Option<String>,
    pub error: Option<String>,
}

// ─── DependencyTracker ────────────────────────────────────────────────────────

pub struct DependencyTracker {
    pool: DbPool,
    queue: Arc<dyn RunQueue>,
}

impl DependencyTracker {
    pub fn new(pool: DbPool, queue: Arc<dyn RunQueue>) -> Self {
        Self { pool, queue }
    }

    fn conn(&self) -> Result<crate::database::DbConnection, EscalationError> {
        self.pool
            .get()
            .map_err(|e| EscalationError::Pool(e.to_string()))
    }

    /// Record a parent→child dependency.  The unique (parent, child) key
    /// makes duplicate records impossible.
    pub fn create(
        &self,
        parent_run_id: &str,
        child_run_id: &str,
        tool_call_id: &str,
        goal: &str,
    ) -> Result<(), EscalationError> {
        let row = DependencyRow {
            parent_run_id: parent_run_id.to_string(),
            child_run_id: child_run_id.to_string(),
            tool_call_id: tool_call_id.to_string(),
            goal: goal.to_string(),
            status: STATUS_PENDING.to_string(),
            result: None,
            error: None,
            applied: 0,
            created_at: now_rfc3339(),
            completed_at: None,
        };
        let mut conn = self.conn()?;
        diesel::insert_or_ignore_into(run_dependencies::table)
            .values(&row)
            .execute(&mut conn)?;
        Ok(())
    }

    /// Settle every pending dependency on `child_run_id` and re-enqueue the
    /// affected parents.  Idempotent: already-settled rows are skipped.
    pub fn on_child_terminal(
        &self,
        child_run_id: &str,
        child_status: RunStatus,
        output: Option<&str>,
        error: Option<&str>,
    ) -> Result<Vec<String>, EscalationError> {
        let (status, error) = match child_status {
            RunStatus::Completed => (STATUS_COMPLETED, error.map(str::to_string)),
            RunStatus::Failed => (
                STATUS_FAILED,
                Some(error.unwrap_or("child run failed").to_string()),
            ),
            RunStatus::Cancelled => (STATUS_FAILED, Some("child run cancelled".to_string())),
            other => {
                log::warn!("on_child_terminal called with non-terminal status {other}");
                return Ok(Vec::new());
            }
        };

        let mut conn = self.conn()?;
        let parents: Vec<String> = run_dependencies::table
            .filter(run_dependencies::child_run_id.eq(child_run_id))
            .filter(run_dependencies::status.eq(STATUS_PENDING))
            .select(run_dependencies::parent_run_id)
            .load(&mut conn)?;
        if parents.is_empty() {
            return Ok(Vec::new());
        }

        diesel::update(
            run_dependencies::table
                .filter(run_dependencies::child_run_id.eq(child_run_id))
                .filter(run_dependencies::status.eq(STATUS_PENDING)),
        )
        .set((
            run_dependencies::status.eq(status),
            run_dependencies::result.eq(output),
            run_dependencies::error.eq(error),
            run_dependencies::completed_at.eq(now_rfc3339()),
        ))
        .execute(&mut conn)?;
        drop(conn);

        for parent in &parents {
            log::info!(
                "child run {child_run_id} settled ({status}); re-enqueueing parent {parent}"
            );
            self.queue.re_enqueue(parent)?;
        }
        Ok(parents)
    }

    /// Consume the settled-but-unapplied dependency for a resuming parent.
    pub fn take_completed(
        &self,
        parent_run_id: &str,
    ) -> Result<Option<SettledDependency>, EscalationError> {
        let mut conn = self.conn()?;
        let row: Option<DependencyRow> = run_dependencies::table
            .filter(run_dependencies::parent_run_id.eq(parent_run_id))
            .filter(run_dependencies::status.eq_any([STATUS_COMPLETED, STATUS_FAILED]))
            .filter(run_dependencies::applied.eq(0))
            .order(run_dependencies::completed_at.asc())
            .select(DependencyRow::as_select())
            .first(&mut conn)
            .optional()?;
        let Some(row) = row else {
            return Ok(None);
        };

        diesel::update(
            run_dependencies::table
                .filter(run_dependencies::parent_run_id.eq(&row.parent_run_id))
                .filter(run_dependencies::child_run_id.eq(&row.child_run_id)),
        )
        .set(run_dependencies::applied.eq(1))
        .execute(&mut conn)?;

        Ok(Some(SettledDependency {
            parent_run_id: row.parent_run_id,
            child_run_id: row.child_run_id,
            tool_call_id: row.tool_call_id,
            goal: row.goal,
            status: row.status,
            result: row.result,
            error: row.error,
        }))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
