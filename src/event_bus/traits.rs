use tokio::sync::broadcast;

use super::types::{EventPage, RunEvent};

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("storage error: {0}")]
    Storage(#[from] diesel::result::Error),

    #[error("event codec error: {0}")]
    Codec(String),
}

/// Durable, ordered event log with live fan-out per run.
///
/// `append`/`append_batch` guarantee that subsequent readers observe events
/// in append order.  `broadcast_to_run` is live-only and never persists —
/// it carries transient `llm.token` events to subscribers ahead of the
/// batched durable write.  Persisted events are never mutated.
pub trait EventBus: Send + Sync {
    /// Durably store one event. Fails only on storage error.
    fn append(&self, event: &RunEvent) -> Result<(), EventBusError>;

    /// Durably store a batch in order (used to flush token bursts).
    fn append_batch(&self, events: &[RunEvent]) -> Result<(), EventBusError>;

    /// Replay up to `limit` events after `cursor` (exclusive).
    fn list(&self, run_id: &str, cursor: Option<i64>, limit: i64)
    -> Result<EventPage, EventBusError>;

    /// Live stream of events broadcast after subscription time; no history.
    fn subscribe(&self, run_id: &str) -> broadcast::Receiver<RunEvent>;

    /// Push to live subscribers of `run_id` without persisting.
    fn broadcast_to_run(&self, run_id: &str, event: &RunEvent);
}
