//! The event model: every observable moment of a run, in one tagged union.
//!
//! Events are append-only and totally ordered per run by their insertion id
//! in the `run_events` table.  Timestamps are informational; the insertion id
//! is the order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::security::RiskLevel;

/// Wire/schema version stamped on every event.
pub const EVENT_VERSION: i32 = 1;

// ─── ErrorInfo ────────────────────────────────────────────────────────────────

/// Structured error carried by `tool.result` and `run.failed` payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorInfo {
    /// Stable machine code, e.g. `"TOOL_TIMEOUT"`, `"MAX_STEPS"`.
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

// ─── StepResultType ───────────────────────────────────────────────────────────

/// How a step concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepResultType {
    ToolCall,
    FinalAnswer,
}

// ─── EventPayload ─────────────────────────────────────────────────────────────

/// Type-specific payload of a run event.
///
/// The serialized form is `{"type": "<tag>", "payload": {...}}`; flattened
/// into the [`RunEvent`] envelope this yields the public wire shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum EventPayload {
    #[serde(rename = "run.started")]
    RunStarted { input: String },

    #[serde(rename = "step.started")]
    StepStarted { step_number: u32 },

    #[serde(rename = "llm.called")]
    LlmCalled {
        model: String,
        prompt_tokens: u32,
        completion_tokens: u32,
        total_tokens: u32,
        duration_ms: i64,
    },

    /// Live-only by default; persisted in batches by the scheduler.
    #[serde(rename = "llm.token")]
    LlmToken { token: String, token_index: u32 },

    #[serde(rename = "tool.called")]
    ToolCalled { tool_name: String, args: Value },

    #[serde(rename = "tool.result")]
    ToolResult {
        tool_name: String,
        result: Value,
        is_error: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorInfo>,
    },

    #[serde(rename = "tool.blocked")]
    ToolBlocked {
        tool_name: String,
        args: Value,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role_id: Option<String>,
    },

    #[serde(rename = "tool.requires_approval")]
    ToolRequiresApproval {
        tool_name: String,
        tool_call_id: String,
        args: Value,
        reason: String,
        risk_level: RiskLevel,
    },

    #[serde(rename = "step.completed")]
    StepCompleted {
        step_number: u32,
        result_type: StepResultType,
        duration_ms: i64,
    },

    #[serde(rename = "run.completed")]
    RunCompleted { output: String, duration_ms: i64 },

    #[serde(rename = "run.failed")]
    RunFailed { error: ErrorInfo },
}

impl EventPayload {
    /// The wire tag, also stored in the `event_type` column.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::RunStarted { .. } => "run.started",
            EventPayload::StepStarted { .. } => "step.started",
            EventPayload::LlmCalled { .. } => "llm.called",
            EventPayload::LlmToken { .. } => "llm.token",
            EventPayload::ToolCalled { .. } => "tool.called",
            EventPayload::ToolResult { .. } => "tool.result",
            EventPayload::ToolBlocked { .. } => "tool.blocked",
            EventPayload::ToolRequiresApproval { .. } => "tool.requires_approval",
            EventPayload::StepCompleted { .. } => "step.completed",
            EventPayload::RunCompleted { .. } => "run.completed",
            EventPayload::RunFailed { .. } => "run.failed",
        }
    }

    pub fn is_token(&self) -> bool {
        matches!(self, EventPayload::LlmToken { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventPayload::RunCompleted { .. } | EventPayload::RunFailed { .. }
        )
    }
}

// ─── Redaction ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Redaction {
    pub contains_secrets: bool,
}

// ─── RunEvent ─────────────────────────────────────────────────────────────────

/// The envelope every event shares.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunEvent {
    pub v: i32,
    pub ts: DateTime<Utc>,
    pub run_id: String,
    pub agent_id: String,
    pub step_id: i32,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    #[serde(flatten)]
    pub payload: EventPayload,
    #[serde(default)]
    pub redaction: Redaction,
}

impl RunEvent {
    pub fn new(
        run_id: impl Into<String>,
        agent_id: impl Into<String>,
        step_id: i32,
        payload: EventPayload,
    ) -> Self {
        Self {
            v: EVENT_VERSION,
            ts: Utc::now(),
            run_id: run_id.into(),
            agent_id: agent_id.into(),
            step_id,
            span_id: uuid::Uuid::new_v4().to_string(),
            parent_span_id: None,
            payload,
            redaction: Redaction::default(),
        }
    }

    pub fn with_span(mut self, span_id: impl Into<String>) -> Self {
        self.span_id = span_id.into();
        self
    }

    pub fn with_parent_span(mut self, parent: impl Into<String>) -> Self {
        self.parent_span_id = Some(parent.into());
        self
    }

    pub fn with_secrets(mut self) -> Self {
        self.redaction.contains_secrets = true;
        self
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    pub fn is_token(&self) -> bool {
        self.payload.is_token()
    }
}

/// An event as read back from the log, with its position in the total order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEvent {
    pub seq: i64,
    #[serde(flatten)]
    pub event: RunEvent,
}

/// One page of a replay listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<PersistedEvent>,
    /// Cursor to pass to the next `list` call, or `None` when drained.
    pub next_cursor: Option<i64>,
}

// ─── Tests ────────────────────────────────────────────────────────────────────
