//! conductor — a multi-agent run execution engine.
//!
//! Accepts a textual task as a [`runs::QueuedRun`], drives one or more
//! language-model agents through a stepwise reason-act loop with tool
//! invocation, persists every observable event for replay, and streams those
//! events live to subscribers.  Tool calls are gated by a precedence policy
//! with human approval for high-risk actions; runs can suspend on approval
//! or escalate sub-tasks to child runs and resume when those settle.
//!
//! The HTTP surface, model wire protocols and retrieval back ends live
//! outside this crate, behind [`ai::LlmProvider`], [`ai::ProviderFactory`]
//! and [`memory::MemoryService`].

pub mod agent;
pub mod agents;
pub mod ai;
pub mod approvals;
pub mod checkpoint;
pub mod config;
pub mod database;
pub mod escalation;
pub mod event_bus;
pub mod logging;
pub mod memory;
pub mod runs;
pub mod scheduler;
pub mod security;
pub mod skills;
pub mod tools;

/// Convenience re-exports for the most commonly used traits and types.
///
/// ```rust
/// use conductor::prelude::*;
/// ```
pub mod prelude {
    // Model seam
    pub use crate::ai::{
        ChatMessage, CompletionRequest, CompletionResponse, LlmConfig, LlmProvider,
        ProviderFactory, ToolCallRequest,
    };

    // Tool system
    pub use crate::tools::{
        ParamKind, ParamSpec, ToolCallContext, ToolDispatch, ToolHandler, ToolMeta, ToolRegistry,
        ToolRouter, ToolSpec,
    };

    // Policy
    pub use crate::security::{AgentContext, Decision, DelegatedPermissions, RiskLevel, ToolPolicy};

    // Events
    pub use crate::event_bus::{EventBus, EventPayload, RunEvent, SqliteEventBus};

    // Runs and scheduling
    pub use crate::runs::{QueuedRun, RunQueue, RunRepository, RunStatus, Scope};
    pub use crate::scheduler::{Engine, SchedulerConfig};

    // Memory
    pub use crate::memory::{InMemoryStore, MemoryHit, MemoryService};

    // Groups
    pub use crate::agents::{GroupMember, GroupRegistry, GroupSpec, RoleSpec};

    // Approvals
    pub use crate::approvals::{ApprovalBroker, ApprovalOutcome};

    // Configuration
    pub use crate::config::{RuntimeConfig, load_default_config};
}
