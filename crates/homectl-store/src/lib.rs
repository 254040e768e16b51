//! Rule store and event log
//!
//! The rule engine only talks to persistence through [`RuleStore`]; the
//! monitor records traffic through [`EventRecorder`]. Two backends implement
//! both traits:
//!
//! - [`SqliteStore`] - durable storage in a single SQLite file
//! - [`MemoryStore`] - process-local storage, used by tests and dry runs
//!
//! Conditions and action payloads always cross this boundary as structured
//! data ([`Conditions`], JSON objects), never as code.

mod memory;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use homectl_core::{ConditionError, Conditions, DeviceId, EventSource, RuleDefinition, RuleId, SensorId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid stored condition: {0}")]
    Condition(#[from] ConditionError),

    #[error("Invalid row {id}: {reason}")]
    InvalidRow { id: i64, reason: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

/// A persisted rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRow {
    pub id: RuleId,
    pub name: String,
    pub sensor_id: SensorId,
    pub conditions: Conditions,
    pub device_id: DeviceId,
    pub action: serde_json::Map<String, serde_json::Value>,
    pub enabled: bool,
}

impl RuleRow {
    /// The definition this row was created from
    pub fn definition(&self) -> RuleDefinition {
        RuleDefinition::new(
            self.name.clone(),
            self.sensor_id,
            self.conditions.clone(),
            self.device_id,
            self.action.clone(),
        )
    }
}

/// A registered sensor or device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub id: i64,
    pub name: String,
    pub category: String,
    /// Hardware or model type, e.g. `DHT22`
    pub kind: String,
    /// Last payload reported (sensors) or last status (devices)
    pub last_payload: Option<String>,
    pub last_update: Option<DateTime<Utc>>,
}

impl EndpointRecord {
    pub fn new(id: i64, name: impl Into<String>, category: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            category: category.into(),
            kind: kind.into(),
            last_payload: None,
            last_update: None,
        }
    }
}

/// An entry of the message log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    /// `sensor`, `device` or `unknown`
    pub source_type: String,
    pub source_id: i64,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

/// A rule firing recorded by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: i64,
    pub rule_id: RuleId,
    pub executed_at: DateTime<Utc>,
}

/// Persistence used by the rule engine
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// All rules in ascending id order
    async fn all_rules(&self) -> StoreResult<Vec<RuleRow>>;

    /// Persist a new, enabled rule and return its id
    async fn add_rule(&self, definition: &RuleDefinition) -> StoreResult<RuleId>;

    /// Remove a rule; absent ids are ignored
    async fn delete_rule(&self, id: RuleId) -> StoreResult<()>;

    async fn set_enabled(&self, id: RuleId, enabled: bool) -> StoreResult<()>;

    /// Category of a sensor, or `"unknown"`
    async fn sensor_category(&self, id: SensorId) -> StoreResult<String>;

    /// Category of a device, or `"unknown"`
    async fn device_category(&self, id: DeviceId) -> StoreResult<String>;

    /// Distinct categories of all registered sensors
    async fn sensor_categories(&self) -> StoreResult<Vec<String>>;

    async fn log_execution(&self, rule_id: RuleId, at: DateTime<Utc>) -> StoreResult<()>;
}

/// Persistence used by the monitor
#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Append a message to the log; `None` sources are logged as `unknown`
    async fn log_event(
        &self,
        source: Option<EventSource>,
        payload: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Store the latest payload of a sensor or the latest status of a device
    async fn update_status(
        &self,
        source: EventSource,
        payload: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Most recent log entries, newest first
    async fn recent_events(&self, limit: usize) -> StoreResult<Vec<EventRecord>>;
}

/// `source_type`/`source_id` columns for a possibly unknown source
pub(crate) fn source_columns(source: Option<EventSource>) -> (String, i64) {
    match source {
        Some(source) => (source.kind.as_str().to_string(), source.id),
        None => ("unknown".to_string(), 0),
    }
}
