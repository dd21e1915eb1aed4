//! Multi-agent groups: role definitions and the serial orchestrator.

pub mod orchestrator;
pub mod roles;

pub use orchestrator::{
    FINAL_MARKER, GROUP_AGENT, GroupResume, SerialOrchestrator, parse_progress_tag, progress_tag,
};
pub use roles::{GroupMember, GroupRegistry, GroupSpec, RoleSpec};
