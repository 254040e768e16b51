//! Traffic monitor
//!
//! Records every telemetry and command message in the store's event log and
//! keeps the last payload of each sensor and device. Console output is
//! throttled per source by [`ConsolePolicy`].

use anyhow::Result;
use chrono::{DateTime, Utc};
use homectl_core::topic::{ALL_COMMANDS, ALL_TELEMETRY};
use homectl_core::{EventSource, SourceType};
use homectl_store::EventRecorder;
use homectl_transport::{Inbound, InboundMessage, Qos, Transport};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Temperature delta that counts as a change worth printing
const TEMPERATURE_DELTA: f64 = 0.5;

/// Why a message was echoed to the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogReason {
    FirstMessage,
    StateChanged,
    Periodic,
}

impl fmt::Display for LogReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogReason::FirstMessage => "first_message",
            LogReason::StateChanged => "state_changed",
            LogReason::Periodic => "periodic",
        })
    }
}

struct LastLogged {
    at: DateTime<Utc>,
    payload: Map<String, Value>,
}

/// Decides which messages are worth printing
///
/// A source is printed on its first message, whenever its `state` or
/// `action` changes or its temperature moves by at least 0.5, and otherwise
/// at most once per `min_interval`. Sources silent for longer than
/// `min_interval` are forgotten.
pub struct ConsolePolicy {
    min_interval: Duration,
    last: HashMap<Option<EventSource>, LastLogged>,
}

impl ConsolePolicy {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: HashMap::new(),
        }
    }

    pub fn decide(
        &mut self,
        source: Option<EventSource>,
        payload: &Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Option<LogReason> {
        let reason = match self.last.get(&source) {
            None => LogReason::FirstMessage,
            Some(last) if significant_change(&last.payload, payload) => LogReason::StateChanged,
            Some(last) if elapsed_beyond(last.at, now, self.min_interval) => LogReason::Periodic,
            Some(_) => return None,
        };

        // Sources quiet for longer than the interval would log anyway
        let interval = self.min_interval;
        self.last.retain(|_, last| !elapsed_beyond(last.at, now, interval));
        self.last.insert(
            source,
            LastLogged {
                at: now,
                payload: payload.clone(),
            },
        );
        Some(reason)
    }
}

fn elapsed_beyond(last: DateTime<Utc>, now: DateTime<Utc>, interval: Duration) -> bool {
    (now - last)
        .to_std()
        .map(|elapsed| elapsed > interval)
        .unwrap_or(false)
}

fn significant_change(old: &Map<String, Value>, new: &Map<String, Value>) -> bool {
    if old.get("state") != new.get("state") || old.get("action") != new.get("action") {
        return true;
    }
    (temperature(old) - temperature(new)).abs() >= TEMPERATURE_DELTA
}

fn temperature(payload: &Map<String, Value>) -> f64 {
    payload
        .get("temperature")
        .or_else(|| payload.get("current_temp"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

/// Logs bus traffic through an [`EventRecorder`]
pub struct Monitor {
    recorder: Arc<dyn EventRecorder>,
    policy: ConsolePolicy,
}

impl Monitor {
    pub fn new(recorder: Arc<dyn EventRecorder>, min_log_interval: Duration) -> Self {
        Self {
            recorder,
            policy: ConsolePolicy::new(min_log_interval),
        }
    }

    /// Subscribe `transport` to all telemetry and command topics
    pub async fn subscribe(transport: &dyn Transport) -> Result<()> {
        transport.subscribe(ALL_TELEMETRY, Qos::AtLeastOnce).await?;
        transport.subscribe(ALL_COMMANDS, Qos::AtLeastOnce).await?;
        info!("Monitor subscribed to all topics");
        Ok(())
    }

    /// Process messages until the channel closes
    pub async fn run(mut self, mut inbound: Inbound) {
        info!("Monitor started");
        while let Some(message) = inbound.recv().await {
            self.handle(&message).await;
        }
        info!("Monitor stopped");
    }

    /// Record one message; returns the console decision
    pub async fn handle(&mut self, message: &InboundMessage) -> Option<LogReason> {
        let text = String::from_utf8_lossy(&message.payload);
        let payload = match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(payload)) => payload,
            Ok(_) | Err(_) => {
                warn!(topic = %message.topic, payload = %text, "Invalid JSON message");
                return None;
            }
        };

        let source = source_of(&payload);
        match source {
            Some(source) => {
                if let Err(e) = self.recorder.update_status(source, &text, message.received_at).await {
                    warn!(kind = %source.kind, id = source.id, error = %e, "Failed to update status");
                }
            }
            None => warn!(topic = %message.topic, "Message with no sensor_id or device_id"),
        }

        if let Err(e) = self.recorder.log_event(source, &text, message.received_at).await {
            warn!(topic = %message.topic, error = %e, "Failed to log event");
        }

        let reason = self.policy.decide(source, &payload, message.received_at);
        match (reason, source) {
            (Some(reason), Some(source)) => print_message(source, &payload, reason),
            (None, _) => debug!(topic = %message.topic, "Unchanged message"),
            (Some(_), None) => {}
        }
        reason
    }
}

fn source_of(payload: &Map<String, Value>) -> Option<EventSource> {
    [SourceType::Sensor, SourceType::Device]
        .into_iter()
        .find_map(|kind| {
            let id = match payload.get(kind.id_field())? {
                Value::Number(n) => n.as_i64()?,
                Value::String(s) => s.trim().parse().ok()?,
                _ => return None,
            };
            Some(EventSource { kind, id })
        })
}

fn print_message(source: EventSource, payload: &Map<String, Value>, reason: LogReason) {
    let field = |key: &str| payload.get(key).map(render).unwrap_or_else(|| "?".to_string());

    match source.kind {
        SourceType::Sensor => info!(
            sensor_id = source.id,
            temperature = %field("temperature"),
            humidity = %field("humidity"),
            %reason,
            "Sensor reading"
        ),
        SourceType::Device => {
            let target = payload
                .get("target_temp")
                .or_else(|| payload.get("temperature"))
                .map(render)
                .unwrap_or_else(|| "?".to_string());
            info!(
                device_id = source.id,
                state = %field("state").to_uppercase(),
                target = %target,
                action = %payload.get("action").map(render).unwrap_or_else(|| "status".to_string()),
                %reason,
                "Device update"
            )
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
