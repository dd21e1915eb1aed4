//! Human approval gate for high-risk tool invocations.

pub mod broker;

pub use broker::{ApprovalBroker, ApprovalError, ApprovalOutcome, ApprovalRequest, DecidedApproval};
