//! Tool policy: who may call what, and when a human must decide.

pub mod policy;

pub use policy::{
    AgentContext, AuditEntry, Decision, DelegatedPermissions, PolicyDecision, RiskLevel,
    ToolPolicy, glob_match,
};
