//! Escalation: child runs and the parent↔child dependency tracker.

pub mod tool;
pub mod tracker;

pub use tool::DelegateRunTool;
pub use tracker::{DependencyTracker, EscalationError, SettledDependency};
