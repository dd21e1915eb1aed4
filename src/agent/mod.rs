//! The single-agent reason-act loop.

pub mod loop_;
pub mod messages;

pub use loop_::{
    AgentRunner, EventSink, ResumeOutcome, ResumeState, RunOutcome, RunnerConfig, Suspension,
};
pub use messages::AgentMessage;
