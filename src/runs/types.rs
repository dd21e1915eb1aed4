use serde::{Deserialize, Serialize};

use crate::ai::types::LlmConfig;
use crate::event_bus::ErrorInfo;
use crate::security::DelegatedPermissions;

// ─── Scope ────────────────────────────────────────────────────────────────────

/// Multi-tenant isolation tuple carried by every run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub org_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

impl Scope {
    pub fn new(org_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            user_id: user_id.into(),
            project_id: None,
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Stable partition key for scope-isolated stores.
    pub fn partition_key(&self) -> String {
        match &self.project_id {
            Some(p) => format!("{}:{}:{}", self.org_id, self.user_id, p),
            None => format!("{}:{}", self.org_id, self.user_id),
        }
    }
}

// ─── RunStatus ────────────────────────────────────────────────────────────────

/// Lifecycle states of a run.
///
/// `pending → running → {completed | failed | cancelled}` plus the two
/// non-terminal excursions `running → waiting → running` (child dependency)
/// and `running → suspended → running` (human approval).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Waiting,
    Suspended,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Waiting => "waiting",
            RunStatus::Suspended => "suspended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            "waiting" => Some(RunStatus::Waiting),
            "suspended" => Some(RunStatus::Suspended),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── SuspendReason ────────────────────────────────────────────────────────────

/// Why a run left `running` without reaching a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendReason {
    AwaitingApproval,
    AwaitingChild,
}

impl SuspendReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuspendReason::AwaitingApproval => "awaiting_approval",
            SuspendReason::AwaitingChild => "awaiting_child",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "awaiting_approval" => Some(SuspendReason::AwaitingApproval),
            "awaiting_child" => Some(SuspendReason::AwaitingChild),
            _ => None,
        }
    }
}

// ─── QueuedRun ────────────────────────────────────────────────────────────────

fn default_agent_id() -> String {
    "main".to_string()
}

/// A run handed to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRun {
    pub run_id: String,
    #[serde(flatten)]
    pub scope: Scope,
    pub session_key: String,
    pub input: String,
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegated_permissions: Option<DelegatedPermissions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_config: Option<LlmConfig>,
}

impl QueuedRun {
    pub fn new(
        scope: Scope,
        session_key: impl Into<String>,
        input: impl Into<String>,
    ) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            scope,
            session_key: session_key.into(),
            input: input.into(),
            agent_id: default_agent_id(),
            group_id: None,
            parent_run_id: None,
            delegated_permissions: None,
            llm_config: None,
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_parent(mut self, parent_run_id: impl Into<String>) -> Self {
        self.parent_run_id = Some(parent_run_id.into());
        self
    }

    pub fn with_delegated(mut self, delegated: DelegatedPermissions) -> Self {
        self.delegated_permissions = Some(delegated);
        self
    }

    pub fn with_llm_config(mut self, config: LlmConfig) -> Self {
        self.llm_config = Some(config);
        self
    }
}

// ─── RunRecord ────────────────────────────────────────────────────────────────

/// A run as read back from the repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    #[serde(flatten)]
    pub scope: Scope,
    pub session_key: String,
    pub input: String,
    pub status: RunStatus,
    pub agent_id: String,
    pub group_id: Option<String>,
    pub parent_run_id: Option<String>,
    pub delegated_permissions: Option<DelegatedPermissions>,
    pub llm_config: Option<LlmConfig>,
    pub suspend_reason: Option<SuspendReason>,
    pub output: Option<String>,
    pub error: Option<ErrorInfo>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub cancelled_at: Option<String>,
    pub suspended_at: Option<String>,
}
