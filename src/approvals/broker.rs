//! `ApprovalBroker` — pending approval requests and their resolution.
//!
//! A request is created when a run suspends on an `ask` decision.  The first
//! approve/reject wins; later decisions for the same (run, tool_call) are
//! no-ops.  A decision re-enqueues the suspended run; the scheduler consumes
//! the decision exactly once on resume via [`ApprovalBroker::take_decided`].

use std::sync::Arc;

use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::database::{
    DbPool,
    schema::{approvals, runs},
    utils::now_rfc3339,
};
use crate::runs::{QueueError, RunQueue};
use crate::security::RiskLevel;

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("approval for run '{run_id}' call '{tool_call_id}' not found")]
    NotFound {
        run_id: String,
        tool_call_id: String,
    },

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("storage error: {0}")]
    Storage(#[from] diesel::result::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Operator decision for a pending request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum ApprovalOutcome {
    Approve,
    Reject { reason: Option<String> },
}

/// A pending request as shown to an operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub run_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub args: Value,
    pub risk_level: RiskLevel,
    pub reason: String,
    pub created_at: String,
}

/// A resolved decision handed to the scheduler on resume.
#[derive(Debug, Clone)]
pub struct DecidedApproval {
    pub run_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub args: Value,
    pub approved: bool,
    pub decision_reason: Option<String>,
}

// ─── Row type ─────────────────────────────────────────────────────────────────

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = approvals)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct ApprovalRow {
    run_id: String,
    tool_call_id: String,
    tool_name: String,
    args: String,
    risk_level: String,
    reason: String,
    status: String,
    decision_reason: Option<String>,
    applied: i32,
    created_at: String,
    decided_at: Option<String>,
}

impl ApprovalRow {
    fn into_request(self) -> Result<ApprovalRequest, ApprovalError> {
        Ok(ApprovalRequest {
            run_id: self.run_id,
            tool_call_id: self.tool_call_id,
            tool_name: self.tool_name,
            args: serde_json::from_str(&self.args)
                .map_err(|e| ApprovalError::Codec(e.to_string()))?,
            risk_level: RiskLevel::parse(&self.risk_level).unwrap_or(RiskLevel::High),
            reason: self.reason,
            created_at: self.created_at,
        })
    }
}

const STATUS_PENDING: &str = "pending";
const STATUS_APPROVED: &str = "approved";
const STATUS_REJECTED: &str = "rejected";

// ─── ApprovalBroker ───────────────────────────────────────────────────────────

pub struct ApprovalBroker {
    pool: DbPool,
    queue: Arc<dyn RunQueue>,
}

impl ApprovalBroker {
    pub fn new(pool: DbPool, queue: Arc<dyn RunQueue>) -> Self {
        Self { pool, queue }
    }

    fn conn(&self) -> Result<crate::database::DbConnection, ApprovalError> {
        self.pool.get().map_err(|e| ApprovalError::Pool(e.to_string()))
    }

    /// Insert a pending request.  Idempotent per (run, tool_call).
    pub fn create(
        &self,
        run_id: &str,
        tool_call_id: &str,
        tool_name: &str,
        args: &Value,
        risk_level: RiskLevel,
        reason: &str,
    ) -> Result<(), ApprovalError> {
        let row = ApprovalRow {
            run_id: run_id.to_string(),
            tool_call_id: tool_call_id.to_string(),
            tool_name: tool_name.to_string(),
            args: args.to_string(),
            risk_level: risk_level.to_string(),
            reason: reason.to_string(),
            status: STATUS_PENDING.to_string(),
            decision_reason: None,
            applied: 0,
            created_at: now_rfc3339(),
            decided_at: None,
        };
        let mut conn = self.conn()?;
        diesel::insert_or_ignore_into(approvals::table)
            .values(&row)
            .execute(&mut conn)?;
        Ok(())
    }

    /// Apply an operator decision.  The first decision marks the request
    /// terminal and re-enqueues the run; returns `false` when the request
    /// was already decided.
    pub fn decide(
        &self,
        run_id: &str,
        tool_call_id: &str,
        outcome: ApprovalOutcome,
    ) -> Result<bool, ApprovalError> {
        let (status, decision_reason) = match outcome {
            ApprovalOutcome::Approve => (STATUS_APPROVED, None),
            ApprovalOutcome::Reject { reason } => (STATUS_REJECTED, reason),
        };
        let mut conn = self.conn()?;
        let updated = diesel::update(
            approvals::table
                .filter(approvals::run_id.eq(run_id))
                .filter(approvals::tool_call_id.eq(tool_call_id))
                .filter(approvals::status.eq(STATUS_PENDING)),
        )
        .set((
            approvals::status.eq(status),
            approvals::decision_reason.eq(decision_reason),
            approvals::decided_at.eq(now_rfc3339()),
        ))
        .execute(&mut conn)?;

        if updated == 0 {
            let exists: i64 = approvals::table
                .filter(approvals::run_id.eq(run_id))
                .filter(approvals::tool_call_id.eq(tool_call_id))
                .count()
                .get_result(&mut conn)?;
            if exists == 0 {
                return Err(ApprovalError::NotFound {
                    run_id: run_id.to_string(),
                    tool_call_id: tool_call_id.to_string(),
                });
            }
            return Ok(false);
        }

        drop(conn);
        log::info!("approval decided for run {run_id} call {tool_call_id}: {status}");
        self.queue.re_enqueue(run_id)?;
        Ok(true)
    }

    /// Pending requests for an operator UI, optionally filtered by org.
    pub fn list_pending(
        &self,
        org_filter: Option<&str>,
    ) -> Result<Vec<ApprovalRequest>, ApprovalError> {
        let mut conn = self.conn()?;
        let rows: Vec<ApprovalRow> = approvals::table
            .filter(approvals::status.eq(STATUS_PENDING))
            .order(approvals::created_at.asc())
            .select(ApprovalRow::as_select())
            .load(&mut conn)?;

        let requests = rows
            .into_iter()
            .map(ApprovalRow::into_request)
            .collect::<Result<Vec<_>, _>>()?;

        let Some(org) = org_filter else {
            return Ok(requests);
        };
        let run_ids: Vec<String> = requests.iter().map(|r| r.run_id.clone()).collect();
        let in_org: Vec<String> = runs::table
            .filter(runs::id.eq_any(&run_ids))
            .filter(runs::org_id.eq(org))
            .select(runs::id)
            .load(&mut conn)?;
        Ok(requests
            .into_iter()
            .filter(|r| in_org.contains(&r.run_id))
            .collect())
    }

    /// Consume the decided-but-unapplied request for a resuming run.
    pub fn take_decided(&self, run_id: &str) -> Result<Option<DecidedApproval>, ApprovalError> {
        let mut conn = self.conn()?;
        let row: Option<ApprovalRow> = approvals::table
            .filter(approvals::run_id.eq(run_id))
            .filter(approvals::status.eq_any([STATUS_APPROVED, STATUS_REJECTED]))
            .filter(approvals::applied.eq(0))
            .order(approvals::decided_at.asc())
            .select(ApprovalRow::as_select())
            .first(&mut conn)
            .optional()?;
        let Some(row) = row else {
            return Ok(None);
        };

        diesel::update(
            approvals::table
                .filter(approvals::run_id.eq(&row.run_id))
                .filter(approvals::tool_call_id.eq(&row.tool_call_id)),
        )
        .set(approvals::applied.eq(1))
        .execute(&mut conn)?;

        let approved = row.status == STATUS_APPROVED;
        debug_assert_eq!(row.applied, 0);
        Ok(Some(DecidedApproval {
            run_id: row.run_id,
            tool_call_id: row.tool_call_id,
            tool_name: row.tool_name,
            args: serde_json::from_str(&row.args)
                .map_err(|e| ApprovalError::Codec(e.to_string()))?,
            approved,
            decision_reason: row.decision_reason,
        }))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
