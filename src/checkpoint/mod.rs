//! Durable snapshots of agent working state, for suspension/resume and replay.

pub mod store;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::AgentMessage;
use crate::memory::MemoryHit;

pub use store::CheckpointStore;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("storage error: {0}")]
    Storage(#[from] diesel::result::Error),

    #[error("snapshot codec error: {0}")]
    Codec(String),
}

/// Transient working state captured alongside the message history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkingState {
    #[serde(default)]
    pub memory_hits: Vec<MemoryHit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tool_result: Option<Value>,
    /// Free-form resume marker (the orchestrator stores round/member here).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_tag: Option<String>,
}

/// Everything needed to resume an agent at a step boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    pub working_state: WorkingState,
    pub messages: Vec<AgentMessage>,
}

impl CheckpointSnapshot {
    pub fn new(working_state: WorkingState, messages: Vec<AgentMessage>) -> Self {
        Self {
            working_state,
            messages,
        }
    }
}
