//! Telemetry events
//!
//! An [`Event`] is built for every inbound message and never outlives its
//! processing. Decoding is the only fallible step: bytes that are not a JSON
//! object are rejected with [`EventError::MalformedPayload`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::payload::Payload;
use crate::{DEVICE_ID_FIELD, SENSOR_ID_FIELD};

/// Event errors
#[derive(Debug, Error)]
pub enum EventError {
    #[error("malformed payload on '{topic}': {reason}")]
    MalformedPayload { topic: String, reason: String },
}

/// Result type for event decoding
pub type EventResult<T> = Result<T, EventError>;

/// Kind of publisher an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Sensor,
    Device,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Sensor => "sensor",
            SourceType::Device => "device",
        }
    }

    /// Payload field carrying the id for this kind of source
    pub fn id_field(&self) -> &'static str {
        match self {
            SourceType::Sensor => SENSOR_ID_FIELD,
            SourceType::Device => DEVICE_ID_FIELD,
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publisher of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventSource {
    pub kind: SourceType,
    pub id: i64,
}

/// A telemetry or status message received from the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Publisher, if the payload names one
    pub source: Option<EventSource>,

    /// Topic the message arrived on
    pub topic: String,

    /// Scalar members of the message
    pub payload: Payload,

    /// When the message was received
    pub received_at: DateTime<Utc>,
}

impl Event {
    /// Create an event, deriving its source from the payload
    ///
    /// A coercible `sensor_id` makes a sensor event; otherwise a coercible
    /// `device_id` makes a device event.
    pub fn new(topic: impl Into<String>, payload: Payload, received_at: DateTime<Utc>) -> Self {
        let source = [SourceType::Sensor, SourceType::Device]
            .into_iter()
            .find_map(|kind| {
                payload
                    .get(kind.id_field())
                    .and_then(|v| v.as_i64())
                    .map(|id| EventSource { kind, id })
            });

        Self {
            source,
            topic: topic.into(),
            payload,
            received_at,
        }
    }

    /// Decode raw message bytes
    pub fn decode(topic: &str, bytes: &[u8], received_at: DateTime<Utc>) -> EventResult<Self> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| EventError::MalformedPayload {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        let object = value
            .as_object()
            .ok_or_else(|| EventError::MalformedPayload {
                topic: topic.to_string(),
                reason: "payload is not a JSON object".to_string(),
            })?;

        Ok(Self::new(
            topic,
            Payload::from_json_object(object),
            received_at,
        ))
    }

    /// Id of the publishing sensor, if this is a sensor event
    pub fn sensor_id(&self) -> Option<i64> {
        self.source
            .filter(|s| s.kind == SourceType::Sensor)
            .map(|s| s.id)
    }
}
