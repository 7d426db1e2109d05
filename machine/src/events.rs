//! The `nightshift.*` event protocol shared by the guest agent and the core.
//!
//! Guests emit arbitrary event types over their SSE stream; the core forwards
//! them verbatim and only interprets the types below. A stream is over once
//! one of the terminal types has been seen.

use serde::Serialize;

pub const EVENT_STARTED: &str = "nightshift.started";
pub const EVENT_COMPLETED: &str = "nightshift.completed";
pub const EVENT_ERROR: &str = "nightshift.error";
pub const EVENT_INTERRUPTED: &str = "nightshift.interrupted";

/// Whether an event type ends the run's stream.
pub fn is_terminal(event_type: &str) -> bool {
    matches!(
        event_type,
        EVENT_COMPLETED | EVENT_ERROR | EVENT_INTERRUPTED
    )
}

/// Events the core itself emits into a run's buffer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ControlEvent {
    #[serde(rename = "nightshift.started")]
    Started { workspace: String },
    #[serde(rename = "nightshift.completed")]
    Completed,
    #[serde(rename = "nightshift.error")]
    Error { error: String },
    #[serde(rename = "nightshift.interrupted")]
    Interrupted { reason: String },
}

impl ControlEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Started { .. } => EVENT_STARTED,
            Self::Completed => EVENT_COMPLETED,
            Self::Error { .. } => EVENT_ERROR,
            Self::Interrupted { .. } => EVENT_INTERRUPTED,
        }
    }
}
