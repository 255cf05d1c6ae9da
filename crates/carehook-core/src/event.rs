use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::{HookError, Result};
use crate::id::EventId;

/// Upper bound on event type length.
pub const MAX_EVENT_TYPE_LEN: usize = 128;

/// An event tuple as submitted by a producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    #[serde(rename = "type")]
    pub event_type: String,

    pub payload: Value,

    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, payload: Value, occurred_at: OffsetDateTime) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            occurred_at,
        }
    }

    /// Validate the tuple and return the serialized payload size in bytes.
    pub fn validate(&self, max_payload_bytes: usize) -> Result<usize> {
        validate_event_type(&self.event_type)?;

        if !self.payload.is_object() {
            return Err(HookError::validation("payload must be a JSON object"));
        }

        let size = serde_json::to_vec(&self.payload)?.len();
        if size > max_payload_bytes {
            return Err(HookError::validation(format!(
                "payload is {size} bytes, limit is {max_payload_bytes}"
            )));
        }

        Ok(size)
    }

    /// Accept the event: assign an identifier and intake timestamp.
    pub fn into_event(self) -> Event {
        Event {
            id: EventId::new(),
            event_type: self.event_type,
            payload: self.payload,
            occurred_at: self.occurred_at,
            recorded_at: OffsetDateTime::now_utc(),
        }
    }
}

/// An accepted event. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,

    #[serde(rename = "type")]
    pub event_type: String,

    pub payload: Value,

    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,

    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl Event {
    /// Raw body bytes sent to receivers: the payload verbatim.
    pub fn body(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.payload)?)
    }
}

/// Check an event type tag such as `appointment.created`.
///
/// Allowed characters are ASCII letters, digits, `.`, `_` and `-`. Segments
/// separated by `.` must be non-empty. Wildcards belong to filters only.
pub fn validate_event_type(event_type: &str) -> Result<()> {
    if event_type.trim().is_empty() {
        return Err(HookError::validation("event type must not be empty"));
    }
    if event_type.len() > MAX_EVENT_TYPE_LEN {
        return Err(HookError::validation(format!(
            "event type exceeds {MAX_EVENT_TYPE_LEN} characters"
        )));
    }
    if let Some(c) = event_type
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(HookError::validation(format!(
            "event type contains invalid character '{c}'"
        )));
    }
    if event_type.split('.').any(str::is_empty) {
        return Err(HookError::validation(
            "event type segments must not be empty",
        ));
    }
    Ok(())
}
