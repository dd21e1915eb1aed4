//! `RunRepository` — owns the run record state machine.
//!
//! Transitions are guarded UPDATEs (`... WHERE status IN (<allowed-from>)`);
//! an update that matches zero rows is an illegal transition, not a silent
//! no-op.  Terminal transitions append their terminal event in the same
//! transaction so the log and the record cannot disagree.

use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use crate::database::{DbPool, schema::runs, utils::now_rfc3339};
use crate::event_bus::{ErrorInfo, RunEvent, sqlite_bus::insert_event};

use super::types::{QueuedRun, RunRecord, RunStatus, Scope, SuspendReason};

#[derive(Debug, thiserror::Error)]
pub enum RunStoreError {
    #[error("run '{0}' not found")]
    NotFound(String),

    #[error("illegal transition for run '{run_id}': {from} → {to}")]
    IllegalTransition {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("parent run '{0}' not found in the same scope")]
    ParentNotFound(String),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("storage error: {0}")]
    Storage(#[from] diesel::result::Error),

    #[error("codec error: {0}")]
    Codec(String),
}

// ─── Row type ─────────────────────────────────────────────────────────────────

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = runs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct RunRow {
    id: String,
    org_id: String,
    user_id: String,
    project_id: Option<String>,
    session_key: String,
    input: String,
    status: String,
    agent_id: String,
    group_id: Option<String>,
    parent_run_id: Option<String>,
    delegated_permissions: Option<String>,
    llm_config: Option<String>,
    suspend_reason: Option<String>,
    output: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    created_at: String,
    started_at: Option<String>,
    ended_at: Option<String>,
    cancelled_at: Option<String>,
    suspended_at: Option<String>,
}

impl RunRow {
    fn from_queued(run: &QueuedRun) -> Result<Self, RunStoreError> {
        let delegated = run
            .delegated_permissions
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RunStoreError::Codec(e.to_string()))?;
        let llm = run
            .llm_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RunStoreError::Codec(e.to_string()))?;
        Ok(Self {
            id: run.run_id.clone(),
            org_id: run.scope.org_id.clone(),
            user_id: run.scope.user_id.clone(),
            project_id: run.scope.project_id.clone(),
            session_key: run.session_key.clone(),
            input: run.input.clone(),
            status: RunStatus::Pending.as_str().to_string(),
            agent_id: run.agent_id.clone(),
            group_id: run.group_id.clone(),
            parent_run_id: run.parent_run_id.clone(),
            delegated_permissions: delegated,
            llm_config: llm,
            suspend_reason: None,
            output: None,
            error_code: None,
            error_message: None,
            created_at: now_rfc3339(),
            started_at: None,
            ended_at: None,
            cancelled_at: None,
            suspended_at: None,
        })
    }

    fn into_record(self) -> Result<RunRecord, RunStoreError> {
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| RunStoreError::Codec(format!("unknown status '{}'", self.status)))?;
        let delegated = self
            .delegated_permissions
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| RunStoreError::Codec(e.to_string()))?;
        let llm = self
            .llm_config
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| RunStoreError::Codec(e.to_string()))?;
        let error = match (self.error_code, self.error_message) {
            (Some(code), message) => Some(ErrorInfo::new(code, message.unwrap_or_default())),
            _ => None,
        };
        Ok(RunRecord {
            id: self.id,
            scope: Scope {
                org_id: self.org_id,
                user_id: self.user_id,
                project_id: self.project_id,
            },
            session_key: self.session_key,
            input: self.input,
            status,
            agent_id: self.agent_id,
            group_id: self.group_id,
            parent_run_id: self.parent_run_id,
            delegated_permissions: delegated,
            llm_config: llm,
            suspend_reason: self.suspend_reason.as_deref().and_then(SuspendReason::parse),
            output: self.output,
            error,
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            cancelled_at: self.cancelled_at,
            suspended_at: self.suspended_at,
        })
    }
}

// ─── RunRepository ────────────────────────────────────────────────────────────

pub struct RunRepository {
    pool: DbPool,
}

impl RunRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<crate::database::DbConnection, RunStoreError> {
        self.pool.get().map_err(|e| RunStoreError::Pool(e.to_string()))
    }

    /// Insert a new pending run.  Idempotent: an existing record with the
    /// same id is left untouched.
    pub fn create_pending(&self, run: &QueuedRun) -> Result<(), RunStoreError> {
        let mut conn = self.conn()?;

        let exists: i64 = runs::table
            .filter(runs::id.eq(&run.run_id))
            .count()
            .get_result(&mut conn)?;
        if exists > 0 {
            return Ok(());
        }

        // A parent reference must resolve within the same scope.
        if let Some(parent_id) = &run.parent_run_id {
            let parent_org: Option<String> = runs::table
                .filter(runs::id.eq(parent_id))
                .select(runs::org_id)
                .first(&mut conn)
                .optional()?;
            match parent_org {
                Some(org) if org == run.scope.org_id => {}
                _ => return Err(RunStoreError::ParentNotFound(parent_id.clone())),
            }
        }

        let row = RunRow::from_queued(run)?;
        diesel::insert_into(runs::table)
            .values(&row)
            .execute(&mut conn)?;
        Ok(())
    }

    pub fn get(&self, run_id: &str) -> Result<Option<RunRecord>, RunStoreError> {
        let mut conn = self.conn()?;
        let row: Option<RunRow> = runs::table
            .filter(runs::id.eq(run_id))
            .select(RunRow::as_select())
            .first(&mut conn)
            .optional()?;
        row.map(RunRow::into_record).transpose()
    }

    /// Reconstruct the queued form of an existing run (for re-enqueue).
    pub fn load_queued(&self, run_id: &str) -> Result<QueuedRun, RunStoreError> {
        let record = self
            .get(run_id)?
            .ok_or_else(|| RunStoreError::NotFound(run_id.to_string()))?;
        Ok(QueuedRun {
            run_id: record.id,
            scope: record.scope,
            session_key: record.session_key,
            input: record.input,
            agent_id: record.agent_id,
            group_id: record.group_id,
            parent_run_id: record.parent_run_id,
            delegated_permissions: record.delegated_permissions,
            llm_config: record.llm_config,
        })
    }

    pub fn list_by_session(&self, session_key: &str) -> Result<Vec<RunRecord>, RunStoreError> {
        let mut conn = self.conn()?;
        let rows: Vec<RunRow> = runs::table
            .filter(runs::session_key.eq(session_key))
            .order(runs::created_at.asc())
            .select(RunRow::as_select())
            .load(&mut conn)?;
        rows.into_iter().map(RunRow::into_record).collect()
    }

    /// All runs in a scope, oldest first.  A scope with a project id only
    /// matches runs created under that project.
    pub fn list_by_scope(&self, scope: &Scope) -> Result<Vec<RunRecord>, RunStoreError> {
        let mut conn = self.conn()?;
        let mut query = runs::table
            .select(RunRow::as_select())
            .filter(runs::org_id.eq(&scope.org_id))
            .filter(runs::user_id.eq(&scope.user_id))
            .into_boxed();
        if let Some(project_id) = &scope.project_id {
            query = query.filter(runs::project_id.eq(project_id));
        }
        let rows: Vec<RunRow> = query.order(runs::created_at.asc()).load(&mut conn)?;
        rows.into_iter().map(RunRow::into_record).collect()
    }

    // ── Transitions ──────────────────────────────────────────────────────

    /// `pending|suspended|waiting → running`; stamps `started_at` on first
    /// entry and clears any suspension marker.
    pub fn mark_running(&self, run_id: &str) -> Result<(), RunStoreError> {
        let mut conn = self.conn()?;
        conn.transaction::<_, RunStoreError, _>(|conn| {
            let from = [
                RunStatus::Pending.as_str(),
                RunStatus::Suspended.as_str(),
                RunStatus::Waiting.as_str(),
            ];
            let updated = diesel::update(
                runs::table
                    .filter(runs::id.eq(run_id))
                    .filter(runs::status.eq_any(from)),
            )
            .set((
                runs::status.eq(RunStatus::Running.as_str()),
                runs::suspend_reason.eq(None::<String>),
            ))
            .execute(conn)?;
            if updated == 0 {
                return Err(self.illegal(conn, run_id, RunStatus::Running));
            }
            diesel::update(
                runs::table
                    .filter(runs::id.eq(run_id))
                    .filter(runs::started_at.is_null()),
            )
            .set(runs::started_at.eq(now_rfc3339()))
            .execute(conn)?;
            Ok(())
        })
    }

    /// `running → suspended` (awaiting a human approval decision).
    pub fn suspend(&self, run_id: &str) -> Result<(), RunStoreError> {
        self.leave_running(
            run_id,
            RunStatus::Suspended,
            SuspendReason::AwaitingApproval,
        )
    }

    /// `running → waiting` (awaiting a child run's terminal state).
    pub fn mark_waiting(&self, run_id: &str) -> Result<(), RunStoreError> {
        self.leave_running(run_id, RunStatus::Waiting, SuspendReason::AwaitingChild)
    }

    fn leave_running(
        &self,
        run_id: &str,
        to: RunStatus,
        reason: SuspendReason,
    ) -> Result<(), RunStoreError> {
        let mut conn = self.conn()?;
        let updated = diesel::update(
            runs::table
                .filter(runs::id.eq(run_id))
                .filter(runs::status.eq(RunStatus::Running.as_str())),
        )
        .set((
            runs::status.eq(to.as_str()),
            runs::suspend_reason.eq(reason.as_str()),
            runs::suspended_at.eq(now_rfc3339()),
        ))
        .execute(&mut conn)?;
        if updated == 0 {
            return Err(self.illegal(&mut conn, run_id, to));
        }
        Ok(())
    }

    /// `running → completed`, atomically appending the terminal event.
    pub fn complete(
        &self,
        run_id: &str,
        output: &str,
        terminal_event: &RunEvent,
    ) -> Result<(), RunStoreError> {
        let mut conn = self.conn()?;
        conn.transaction::<_, RunStoreError, _>(|conn| {
            let updated = diesel::update(
                runs::table
                    .filter(runs::id.eq(run_id))
                    .filter(runs::status.eq(RunStatus::Running.as_str())),
            )
            .set((
                runs::status.eq(RunStatus::Completed.as_str()),
                runs::output.eq(output),
                runs::ended_at.eq(now_rfc3339()),
            ))
            .execute(conn)?;
            if updated == 0 {
                return Err(self.illegal(conn, run_id, RunStatus::Completed));
            }
            insert_event(conn, terminal_event).map_err(|e| RunStoreError::Codec(e.to_string()))
        })
    }

    /// `running → failed`, atomically appending the terminal event.
    pub fn fail(
        &self,
        run_id: &str,
        error: &ErrorInfo,
        terminal_event: &RunEvent,
    ) -> Result<(), RunStoreError> {
        let mut conn = self.conn()?;
        conn.transaction::<_, RunStoreError, _>(|conn| {
            let updated = diesel::update(
                runs::table
                    .filter(runs::id.eq(run_id))
                    .filter(runs::status.eq(RunStatus::Running.as_str())),
            )
            .set((
                runs::status.eq(RunStatus::Failed.as_str()),
                runs::error_code.eq(&error.code),
                runs::error_message.eq(&error.message),
                runs::ended_at.eq(now_rfc3339()),
            ))
            .execute(conn)?;
            if updated == 0 {
                return Err(self.illegal(conn, run_id, RunStatus::Failed));
            }
            insert_event(conn, terminal_event).map_err(|e| RunStoreError::Codec(e.to_string()))
        })
    }

    /// Cancel from any non-terminal state.  Idempotent: cancelling a run
    /// that already reached a terminal state is a no-op returning `false`.
    pub fn cancel(&self, run_id: &str) -> Result<bool, RunStoreError> {
        let mut conn = self.conn()?;
        let from = [
            RunStatus::Pending.as_str(),
            RunStatus::Running.as_str(),
            RunStatus::Waiting.as_str(),
            RunStatus::Suspended.as_str(),
        ];
        let now = now_rfc3339();
        let updated = diesel::update(
            runs::table
                .filter(runs::id.eq(run_id))
                .filter(runs::status.eq_any(from)),
        )
        .set((
            runs::status.eq(RunStatus::Cancelled.as_str()),
            runs::cancelled_at.eq(&now),
            runs::ended_at.eq(&now),
        ))
        .execute(&mut conn)?;
        if updated == 0 {
            // Either unknown or already terminal; unknown is an error.
            let exists: i64 = runs::table
                .filter(runs::id.eq(run_id))
                .count()
                .get_result(&mut conn)?;
            if exists == 0 {
                return Err(RunStoreError::NotFound(run_id.to_string()));
            }
            return Ok(false);
        }
        Ok(true)
    }

    fn illegal(
        &self,
        conn: &mut SqliteConnection,
        run_id: &str,
        to: RunStatus,
    ) -> RunStoreError {
        let current: Option<String> = runs::table
            .filter(runs::id.eq(run_id))
            .select(runs::status)
            .first(conn)
            .optional()
            .ok()
            .flatten();
        match current.and_then(|s| RunStatus::parse(&s)) {
            None => RunStoreError::NotFound(run_id.to_string()),
            Some(from) => RunStoreError::IllegalTransition {
                run_id: run_id.to_string(),
                from,
                to,
            },
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::event_bus::{EventPayload, RunEvent};

    use super::*;

    fn repo() -> (RunRepository, TempDir) {
        let dir = TempDir::new().unwrap();
        let pool = crate::database::init_at(&dir.path().join("runs.db")).unwrap();
        (RunRepository::new(pool), dir)
    }

    fn queued(id: &str) -> QueuedRun {
        let mut run = QueuedRun::new(Scope::new("org-1", "user-1"), "sess-1", "do the thing");
        run.run_id = id.to_string();
        run
    }

    fn terminal_event(run_id: &str) -> RunEvent {
        RunEvent::new(
            run_id,
            "main",
            1,
            EventPayload::RunCompleted {
                output: "done".to_string(),
                duration_ms: 10,
            },
        )
    }

    #[test]
    fn create_then_get() {
        let (repo, _dir) = repo();
        repo.create_pending(&queued("r-1")).unwrap();
        let record = repo.get("r-1").unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Pending);
        assert_eq!(record.agent_id, "main");
        assert!(record.started_at.is_none());
    }

    #[test]
    fn create_is_idempotent() {
        let (repo, _dir) = repo();
        repo.create_pending(&queued("r-1")).unwrap();
        repo.create_pending(&queued("r-1")).unwrap();
        assert_eq!(repo.list_by_session("sess-1").unwrap().len(), 1);
    }

    #[test]
    fn parent_must_exist_in_scope() {
        let (repo, _dir) = repo();
        let child = queued("r-child").with_parent("r-missing");
        assert!(matches!(
            repo.create_pending(&child),
            Err(RunStoreError::ParentNotFound(_))
        ));

        repo.create_pending(&queued("r-parent")).unwrap();
        let child = queued("r-child").with_parent("r-parent");
        repo.create_pending(&child).unwrap();
    }

    #[test]
    fn happy_path_transitions() {
        let (repo, _dir) = repo();
        repo.create_pending(&queued("r-1")).unwrap();
        repo.mark_running("r-1").unwrap();
        let record = repo.get("r-1").unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Running);
        assert!(record.started_at.is_some());

        repo.complete("r-1", "done", &terminal_event("r-1")).unwrap();
        let record = repo.get("r-1").unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.output.as_deref(), Some("done"));
        assert!(record.ended_at.is_some());
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let (repo, _dir) = repo();
        repo.create_pending(&queued("r-1")).unwrap();
        // pending → completed skips running.
        let err = repo
            .complete("r-1", "x", &terminal_event("r-1"))
            .unwrap_err();
        assert!(matches!(
            err,
            RunStoreError::IllegalTransition {
                from: RunStatus::Pending,
                to: RunStatus::Completed,
                ..
            }
        ));
    }

    #[test]
    fn no_cycle_back_to_pending_after_terminal() {
        let (repo, _dir) = repo();
        repo.create_pending(&queued("r-1")).unwrap();
        repo.mark_running("r-1").unwrap();
        repo.complete("r-1", "done", &terminal_event("r-1")).unwrap();
        assert!(repo.mark_running("r-1").is_err());
    }

    #[test]
    fn suspend_and_resume_cycle() {
        let (repo, _dir) = repo();
        repo.create_pending(&queued("r-1")).unwrap();
        repo.mark_running("r-1").unwrap();
        repo.suspend("r-1").unwrap();

        let record = repo.get("r-1").unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Suspended);
        assert_eq!(record.suspend_reason, Some(SuspendReason::AwaitingApproval));
        assert!(record.suspended_at.is_some());

        repo.mark_running("r-1").unwrap();
        let record = repo.get("r-1").unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Running);
        assert!(record.suspend_reason.is_none());
    }

    #[test]
    fn waiting_cycle() {
        let (repo, _dir) = repo();
        repo.create_pending(&queued("r-1")).unwrap();
        repo.mark_running("r-1").unwrap();
        repo.mark_waiting("r-1").unwrap();
        let record = repo.get("r-1").unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Waiting);
        assert_eq!(record.suspend_reason, Some(SuspendReason::AwaitingChild));
        repo.mark_running("r-1").unwrap();
    }

    #[test]
    fn fail_records_error() {
        let (repo, _dir) = repo();
        repo.create_pending(&queued("r-1")).unwrap();
        repo.mark_running("r-1").unwrap();
        let error = ErrorInfo::new("MAX_STEPS", "did not converge");
        let event = RunEvent::new(
            "r-1",
            "main",
            3,
            EventPayload::RunFailed {
                error: error.clone(),
            },
        );
        repo.fail("r-1", &error, &event).unwrap();
        let record = repo.get("r-1").unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.error.unwrap().code, "MAX_STEPS");
    }

    #[test]
    fn cancel_is_idempotent() {
        let (repo, _dir) = repo();
        repo.create_pending(&queued("r-1")).unwrap();
        repo.mark_running("r-1").unwrap();
        assert!(repo.cancel("r-1").unwrap());
        let record = repo.get("r-1").unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Cancelled);
        assert!(record.cancelled_at.is_some());

        // Cancelling a terminal run is a no-op.
        assert!(!repo.cancel("r-1").unwrap());
        assert_eq!(
            repo.get("r-1").unwrap().unwrap().status,
            RunStatus::Cancelled
        );
    }

    #[test]
    fn cancel_pending_run_never_started() {
        let (repo, _dir) = repo();
        repo.create_pending(&queued("r-1")).unwrap();
        assert!(repo.cancel("r-1").unwrap());
        let record = repo.get("r-1").unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Cancelled);
        assert!(record.started_at.is_none());
    }

    #[test]
    fn list_by_scope_isolates_tenants() {
        let (repo, _dir) = repo();
        repo.create_pending(&queued("r-1")).unwrap();
        repo.create_pending(&queued("r-2")).unwrap();

        let mut other = QueuedRun::new(Scope::new("org-2", "user-9"), "sess-9", "other tenant");
        other.run_id = "r-other".to_string();
        repo.create_pending(&other).unwrap();

        let mine = repo.list_by_scope(&Scope::new("org-1", "user-1")).unwrap();
        let ids: Vec<&str> = mine.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r-1", "r-2"]);

        assert!(repo.list_by_scope(&Scope::new("org-3", "user-1")).unwrap().is_empty());
    }

    #[test]
    fn list_by_scope_respects_project() {
        let (repo, _dir) = repo();
        let scope = Scope::new("org-1", "user-1").with_project("proj-a");
        let mut scoped = QueuedRun::new(scope.clone(), "sess-1", "in the project");
        scoped.run_id = "r-proj".to_string();
        repo.create_pending(&scoped).unwrap();
        repo.create_pending(&queued("r-bare")).unwrap();

        let in_project = repo.list_by_scope(&scope).unwrap();
        assert_eq!(in_project.len(), 1);
        assert_eq!(in_project[0].id, "r-proj");

        // A project-less scope sees every run for the (org, user) pair.
        let all = repo.list_by_scope(&Scope::new("org-1", "user-1")).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn load_queued_round_trips() {
        let (repo, _dir) = repo();
        let mut run = queued("r-1");
        run.delegated_permissions = Some(crate::security::DelegatedPermissions {
            allowed_tools: Some(vec!["memory_search".to_string()]),
            denied_tools: None,
        });
        repo.create_pending(&run).unwrap();
        let loaded = repo.load_queued("r-1").unwrap();
        assert_eq!(loaded.input, run.input);
        assert_eq!(loaded.delegated_permissions, run.delegated_permissions);
    }

    #[test]
    fn terminal_event_is_appended_atomically() {
        let (repo, dir) = repo();
        let pool = crate::database::init_at(&dir.path().join("runs.db")).unwrap();
        let bus = crate::event_bus::SqliteEventBus::new(pool);
        repo.create_pending(&queued("r-1")).unwrap();
        repo.mark_running("r-1").unwrap();
        repo.complete("r-1", "done", &terminal_event("r-1")).unwrap();

        use crate::event_bus::EventBus;
        let page = bus.list("r-1", None, 10).unwrap();
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].event.event_type(), "run.completed");
    }
}
