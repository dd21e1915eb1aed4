//! [`EventBus`] implementation backed by the `run_events` table for
//! durability and per-run `tokio::sync::broadcast` channels for live fan-out.
//!
//! Live delivery is best-effort: a subscriber that lags past the channel
//! capacity sees `RecvError::Lagged` and must catch up through [`EventBus::list`].
//! The persisted copy is authoritative.

use std::collections::HashMap;
use std::sync::RwLock;

use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use tokio::sync::broadcast;

use crate::database::{DbPool, schema::run_events};

use super::traits::{EventBus, EventBusError};
use super::types::{EventPage, PersistedEvent, Redaction, RunEvent};

/// Capacity of each per-run live channel.
const CHANNEL_CAPACITY: usize = 1024;

// ─── Row types ────────────────────────────────────────────────────────────────

#[derive(Queryable, Selectable)]
#[diesel(table_name = run_events)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct EventRow {
    id: i64,
    version: i32,
    run_id: String,
    agent_id: String,
    step_id: i32,
    span_id: String,
    parent_span_id: Option<String>,
    event_type: String,
    payload: String,
    contains_secrets: i32,
    ts: String,
}

#[derive(Insertable)]
#[diesel(table_name = run_events)]
struct NewEventRow {
    version: i32,
    run_id: String,
    agent_id: String,
    step_id: i32,
    span_id: String,
    parent_span_id: Option<String>,
    event_type: String,
    payload: String,
    contains_secrets: i32,
    ts: String,
}

impl NewEventRow {
    fn from_event(event: &RunEvent) -> Result<Self, EventBusError> {
        // The payload column holds only the type-specific object; the tag
        // lives in event_type.
        let tagged = serde_json::to_value(&event.payload)
            .map_err(|e| EventBusError::Codec(e.to_string()))?;
        let payload = tagged
            .get("payload")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        Ok(Self {
            version: event.v,
            run_id: event.run_id.clone(),
            agent_id: event.agent_id.clone(),
            step_id: event.step_id,
            span_id: event.span_id.clone(),
            parent_span_id: event.parent_span_id.clone(),
            event_type: event.payload.event_type().to_string(),
            payload: serde_json::to_string(&payload)
                .map_err(|e| EventBusError::Codec(e.to_string()))?,
            contains_secrets: i32::from(event.redaction.contains_secrets),
            ts: event.ts.to_rfc3339(),
        })
    }
}

impl EventRow {
    fn into_persisted(self) -> Result<PersistedEvent, EventBusError> {
        let payload_value: serde_json::Value = serde_json::from_str(&self.payload)
            .map_err(|e| EventBusError::Codec(e.to_string()))?;
        let payload = serde_json::from_value(serde_json::json!({
            "type": self.event_type,
            "payload": payload_value,
        }))
        .map_err(|e| EventBusError::Codec(e.to_string()))?;
        let ts = crate::database::utils::parse_rfc3339(&self.ts)
            .ok_or_else(|| EventBusError::Codec(format!("bad timestamp: {}", self.ts)))?;
        Ok(PersistedEvent {
            seq: self.id,
            event: RunEvent {
                v: self.version,
                ts,
                run_id: self.run_id,
                agent_id: self.agent_id,
                step_id: self.step_id,
                span_id: self.span_id,
                parent_span_id: self.parent_span_id,
                payload,
                redaction: Redaction {
                    contains_secrets: self.contains_secrets != 0,
                },
            },
        })
    }
}

/// Insert a single event on an existing connection.
///
/// Exposed to the run repository so a terminal status transition and its
/// terminal event can share one transaction.
pub(crate) fn insert_event(
    conn: &mut SqliteConnection,
    event: &RunEvent,
) -> Result<(), EventBusError> {
    let row = NewEventRow::from_event(event)?;
    diesel::insert_into(run_events::table)
        .values(&row)
        .execute(conn)?;
    Ok(())
}

// ─── SqliteEventBus ───────────────────────────────────────────────────────────

/// Durable log + live fan-out.
pub struct SqliteEventBus {
    pool: DbPool,
    channels: RwLock<HashMap<String, broadcast::Sender<RunEvent>>>,
}

impl SqliteEventBus {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            channels: RwLock::new(HashMap::new()),
        }
    }

    fn sender_for(&self, run_id: &str) -> broadcast::Sender<RunEvent> {
        if let Ok(map) = self.channels.read()
            && let Some(sender) = map.get(run_id)
        {
            return sender.clone();
        }
        let mut map = match self.channels.write() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.entry(run_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Drop channels that no longer have live subscribers.
    fn prune(&self, run_id: &str) {
        let mut map = match self.channels.write() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(sender) = map.get(run_id)
            && sender.receiver_count() == 0
        {
            map.remove(run_id);
        }
    }
}

impl EventBus for SqliteEventBus {
    fn append(&self, event: &RunEvent) -> Result<(), EventBusError> {
        let mut conn = self.pool.get().map_err(|e| EventBusError::Pool(e.to_string()))?;
        insert_event(&mut conn, event)
    }

    fn append_batch(&self, events: &[RunEvent]) -> Result<(), EventBusError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get().map_err(|e| EventBusError::Pool(e.to_string()))?;
        conn.transaction::<_, EventBusError, _>(|conn| {
            for event in events {
                insert_event(conn, event)?;
            }
            Ok(())
        })
    }

    fn list(
        &self,
        run_id: &str,
        cursor: Option<i64>,
        limit: i64,
    ) -> Result<EventPage, EventBusError> {
        let mut conn = self.pool.get().map_err(|e| EventBusError::Pool(e.to_string()))?;
        let after = cursor.unwrap_or(0);
        let rows: Vec<EventRow> = run_events::table
            .filter(run_events::run_id.eq(run_id))
            .filter(run_events::id.gt(after))
            .order(run_events::id.asc())
            .limit(limit)
            .select(EventRow::as_select())
            .load(&mut conn)?;

        let full_page = rows.len() as i64 == limit;
        let events = rows
            .into_iter()
            .map(EventRow::into_persisted)
            .collect::<Result<Vec<_>, _>>()?;
        let next_cursor = if full_page {
            events.last().map(|e| e.seq)
        } else {
            None
        };
        Ok(EventPage { events, next_cursor })
    }

    fn subscribe(&self, run_id: &str) -> broadcast::Receiver<RunEvent> {
        self.sender_for(run_id).subscribe()
    }

    fn broadcast_to_run(&self, run_id: &str, event: &RunEvent) {
        let delivered = {
            let map = match self.channels.read() {
                Ok(m) => m,
                Err(poisoned) => poisoned.into_inner(),
            };
            match map.get(run_id) {
                // send() errs only when there are no receivers — that is fine.
                Some(sender) => sender.send(event.clone()).is_ok(),
                None => return,
            }
        };
        if !delivered {
            self.prune(run_id);
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::types::EventPayload;
    use tempfile::TempDir;

    fn bus() -> (SqliteEventBus, TempDir) {
        let dir = TempDir::new().unwrap();
        let pool = crate::database::init_at(&dir.path().join("events.db")).unwrap();
        (SqliteEventBus::new(pool), dir)
    }

    fn step_event(run_id: &str, n: u32) -> RunEvent {
        RunEvent::new(run_id, "main", n as i32, EventPayload::StepStarted { step_number: n })
    }

    #[test]
    fn append_then_list_in_order() {
        let (bus, _dir) = bus();
        for n in 1..=3 {
            bus.append(&step_event("run-1", n)).unwrap();
        }
        bus.append(&step_event("run-2", 1)).unwrap();

        let page = bus.list("run-1", None, 10).unwrap();
        assert_eq!(page.events.len(), 3);
        assert!(page.next_cursor.is_none());
        let steps: Vec<i32> = page.events.iter().map(|e| e.event.step_id).collect();
        assert_eq!(steps, vec![1, 2, 3]);
    }

    #[test]
    fn list_pages_with_cursor() {
        let (bus, _dir) = bus();
        for n in 1..=5 {
            bus.append(&step_event("run-1", n)).unwrap();
        }
        let first = bus.list("run-1", None, 2).unwrap();
        assert_eq!(first.events.len(), 2);
        let cursor = first.next_cursor.unwrap();

        let second = bus.list("run-1", Some(cursor), 10).unwrap();
        assert_eq!(second.events.len(), 3);
        assert!(second.next_cursor.is_none());
        assert_eq!(second.events[0].event.step_id, 3);
    }

    #[test]
    fn append_batch_preserves_order() {
        let (bus, _dir) = bus();
        let batch: Vec<RunEvent> = (0..4)
            .map(|i| {
                RunEvent::new(
                    "run-1",
                    "main",
                    1,
                    EventPayload::LlmToken {
                        token: format!("t{i}"),
                        token_index: i,
                    },
                )
            })
            .collect();
        bus.append_batch(&batch).unwrap();

        let page = bus.list("run-1", None, 10).unwrap();
        let tokens: Vec<String> = page
            .events
            .iter()
            .filter_map(|e| match &e.event.payload {
                EventPayload::LlmToken { token, .. } => Some(token.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(tokens, vec!["t0", "t1", "t2", "t3"]);
    }

    #[tokio::test]
    async fn subscribe_receives_broadcast_not_history() {
        let (bus, _dir) = bus();
        bus.append(&step_event("run-1", 1)).unwrap();

        let mut rx = bus.subscribe("run-1");
        // History is not replayed.
        assert!(rx.try_recv().is_err());

        let live = step_event("run-1", 2);
        bus.broadcast_to_run("run-1", &live);
        let got = rx.recv().await.unwrap();
        assert_eq!(got.step_id, 2);
    }

    #[tokio::test]
    async fn broadcast_is_scoped_per_run() {
        let (bus, _dir) = bus();
        let mut rx1 = bus.subscribe("run-1");
        let mut rx2 = bus.subscribe("run-2");

        bus.broadcast_to_run("run-1", &step_event("run-1", 1));
        assert!(rx1.recv().await.is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn broadcast_without_subscribers_is_noop() {
        let (bus, _dir) = bus();
        bus.broadcast_to_run("run-1", &step_event("run-1", 1));
        // Nothing persisted either: broadcast is live-only.
        let page = bus.list("run-1", None, 10).unwrap();
        assert!(page.events.is_empty());
    }

    #[test]
    fn redaction_flag_survives_the_row_round_trip() {
        let (bus, _dir) = bus();
        bus.append(&step_event("run-1", 1).with_secrets()).unwrap();
        bus.append(&step_event("run-1", 2)).unwrap();

        let page = bus.list("run-1", None, 10).unwrap();
        assert!(page.events[0].event.redaction.contains_secrets);
        assert!(!page.events[1].event.redaction.contains_secrets);
    }

    #[test]
    fn persisted_payload_round_trips() {
        let (bus, _dir) = bus();
        let event = RunEvent::new(
            "run-1",
            "main",
            1,
            EventPayload::ToolResult {
                tool_name: "memory_search".to_string(),
                result: serde_json::json!({"hits": []}),
                is_error: false,
                error: None,
            },
        );
        bus.append(&event).unwrap();
        let page = bus.list("run-1", None, 1).unwrap();
        assert_eq!(page.events[0].event.payload, event.payload);
    }
}
