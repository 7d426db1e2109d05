//! Per-run in-memory event log with replay and live tail.
//!
//! One process-wide map of `run_id → append-only record list` plus a done
//! set, guarded by a plain mutex with notify-all wakeups. A single buffer
//! serves every subscriber: late joiners replay from the start, live
//! subscribers park on the notifier, and records survive the run's terminal
//! event until the consumer reaps them — a fast run must not race its own
//! subscriber and lose output.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use machine::{ControlEvent, EventSink, is_terminal};
use serde_json::{Value, json};
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub event_type: String,
    pub payload: Value,
}

#[derive(Default)]
struct BufferState {
    runs: HashMap<String, Vec<EventRecord>>,
    done: HashSet<String>,
}

pub struct EventBuffer {
    state: Mutex<BufferState>,
    notify: Notify,
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBuffer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append one record to a run's log and wake every waiting subscriber.
    pub fn append(&self, run_id: &str, event_type: &str, payload: Value) {
        {
            let mut state = self.lock();
            state
                .runs
                .entry(run_id.to_string())
                .or_default()
                .push(EventRecord {
                    event_type: event_type.to_string(),
                    payload,
                });
        }
        self.notify.notify_waiters();
    }

    /// Publish a core-emitted event, stamped with the run id and a timestamp.
    pub fn publish_typed(&self, run_id: &str, event: ControlEvent) {
        let event_type = event.event_type();
        let mut payload = serde_json::to_value(&event).unwrap_or_else(|_| json!({}));
        if let Some(object) = payload.as_object_mut() {
            object.remove("type");
            object.insert("run_id".to_string(), json!(run_id));
            object.insert("timestamp".to_string(), json!(epoch_seconds()));
        }
        self.append(run_id, event_type, payload);
    }

    /// Whether the buffer still holds (or has finished) this run.
    pub fn known(&self, run_id: &str) -> bool {
        let state = self.lock();
        state.runs.contains_key(run_id) || state.done.contains(run_id)
    }

    #[cfg(test)]
    pub(crate) fn is_done(&self, run_id: &str) -> bool {
        self.lock().done.contains(run_id)
    }

    /// Mark a run finished so streams can terminate after draining. Records
    /// stay available until [`EventBuffer::reap`]. Unknown runs are ignored.
    pub fn mark_done(&self, run_id: &str) {
        {
            let mut state = self.lock();
            if !state.runs.contains_key(run_id) {
                debug!(run_id, "mark_done for unknown run, ignoring");
                return;
            }
            state.done.insert(run_id.to_string());
        }
        self.notify.notify_waiters();
    }

    /// Free a finished run's records. The next append under the same id
    /// starts an independent log.
    pub fn reap(&self, run_id: &str) {
        let mut state = self.lock();
        state.runs.remove(run_id);
        state.done.remove(run_id);
    }

    /// Records from `cursor` onward, replay first, then live tail. Ends once
    /// the run is marked done and the log is drained.
    pub fn stream(
        self: Arc<Self>,
        run_id: String,
        cursor: usize,
    ) -> impl Stream<Item = EventRecord> {
        async_stream::stream! {
            let mut cursor = cursor;
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                // Register before reading state, or an append landing between
                // the read and the await would be lost.
                notified.as_mut().enable();

                let (batch, done) = {
                    let state = self.lock();
                    let batch: Vec<EventRecord> = state
                        .runs
                        .get(&run_id)
                        .map(|records| records.iter().skip(cursor).cloned().collect())
                        .unwrap_or_default();
                    (batch, state.done.contains(&run_id))
                };

                if !batch.is_empty() {
                    cursor += batch.len();
                    for record in batch {
                        yield record;
                    }
                    continue;
                }
                if done {
                    return;
                }
                notified.await;
            }
        }
    }

    /// [`EventBuffer::stream`] shaped for SSE: `(event name, data)` pairs,
    /// additionally ending right after the first terminal event even when
    /// more records follow it.
    pub fn stream_sse(self: Arc<Self>, run_id: String) -> impl Stream<Item = (String, String)> {
        async_stream::stream! {
            let records = self.stream(run_id, 0);
            futures_util::pin_mut!(records);
            while let Some(record) = records.next().await {
                let terminal = is_terminal(&record.event_type);
                let data = sse_data(&record);
                yield (record.event_type, data);
                if terminal {
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl EventSink for EventBuffer {
    async fn publish(&self, run_id: &str, event_type: &str, payload: Value) {
        self.append(run_id, event_type, payload);
    }
}

/// The on-wire `data` field: the payload with its type folded back in.
fn sse_data(record: &EventRecord) -> String {
    let value = match &record.payload {
        Value::Object(fields) => {
            let mut fields = fields.clone();
            fields.insert("type".to_string(), json!(record.event_type));
            Value::Object(fields)
        }
        other => json!({"type": record.event_type, "data": other}),
    };
    value.to_string()
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
