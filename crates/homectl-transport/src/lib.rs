//! Publish/subscribe transport for homectl
//!
//! The rule engine never sees a transport callback. Every adapter hands its
//! inbound traffic over a bounded channel of [`InboundMessage`]s, so the
//! engine consumes messages in delivery order on its own task regardless of
//! how the adapter is threaded.
//!
//! Adapters:
//! - [`MqttTransport`] - MQTT broker client built on rumqttc
//! - [`MemoryBroker`] - in-process broker for tests and local wiring

mod memory;
mod mqtt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::{MemoryBroker, MemoryTransport, Publication};
pub use mqtt::{MqttEndpoint, MqttTransport};

/// Default capacity of the inbound message channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("subscribe to '{filter}' failed: {reason}")]
    Subscribe { filter: String, reason: String },

    #[error("invalid QoS level {0}")]
    InvalidQos(u8),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Delivery guarantee
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for Qos {
    type Error = TransportError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(TransportError::InvalidQos(other)),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

impl std::fmt::Display for Qos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

impl From<Qos> for rumqttc::QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            Qos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// A message delivered by the transport
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

/// Receiving side of a transport connection
pub type Inbound = mpsc::Receiver<InboundMessage>;

/// Outbound side of a pub/sub client
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start receiving messages matching `filter` on the inbound channel
    async fn subscribe(&self, filter: &str, qos: Qos) -> TransportResult<()>;

    /// Hand a message to the transport; delivery follows `qos`
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> TransportResult<()>;
}

/// MQTT topic filter matching
///
/// - `+` matches exactly one level
/// - `#` matches all remaining levels (last position only)
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if !filter.contains(['+', '#']) {
        return filter == topic;
    }

    let filter: Vec<&str> = filter.split('/').collect();
    let topic: Vec<&str> = topic.split('/').collect();
    matches_levels(&filter, &topic)
}

fn matches_levels(filter: &[&str], topic: &[&str]) -> bool {
    match (filter.first(), topic.first()) {
        (None, None) => true,
        (Some(&"#"), _) => true,
        (Some(&"+"), Some(_)) => matches_levels(&filter[1..], &topic[1..]),
        (Some(f), Some(t)) if f == t => matches_levels(&filter[1..], &topic[1..]),
        _ => false,
    }
}
