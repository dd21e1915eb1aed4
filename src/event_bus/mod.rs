//! Durable event log and live event fan-out.

pub mod sqlite_bus;
pub mod traits;
pub mod types;

pub use sqlite_bus::SqliteEventBus;
pub use traits::{EventBus, EventBusError};
pub use types::{
    ErrorInfo, EVENT_VERSION, EventPage, EventPayload, PersistedEvent, Redaction, RunEvent,
    StepResultType,
};
