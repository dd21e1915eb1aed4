use super::repository::RunStoreError;
use super::types::QueuedRun;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("run queue is closed")]
    Closed,

    #[error(transparent)]
    Store(#[from] RunStoreError),
}

/// Entry point for new and resumed runs.
///
/// `enqueue` records the run as pending and hands it to the engine;
/// `re_enqueue` pushes an already-persisted run (suspended or waiting) back
/// into the worker queue.  Both are idempotent enough for the broker and the
/// dependency tracker to call on every decision.
pub trait RunQueue: Send + Sync {
    fn enqueue(&self, run: QueuedRun) -> Result<(), QueueError>;
    fn re_enqueue(&self, run_id: &str) -> Result<(), QueueError>;
}
