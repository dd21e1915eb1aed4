//! Run records: queued form, repository state machine, and the queue seam.

pub mod queue;
pub mod repository;
pub mod types;

pub use queue::{QueueError, RunQueue};
pub use repository::{RunRepository, RunStoreError};
pub use types::{QueuedRun, RunRecord, RunStatus, Scope, SuspendReason};
