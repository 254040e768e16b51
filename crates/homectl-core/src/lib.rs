//! Core types for homectl
//!
//! This crate provides the fundamental types shared by the rule engine, the
//! rule store and the transport adapters: telemetry [`Event`]s with their
//! typed [`Payload`], rule [`Condition`]s built on a closed [`Comparator`]
//! set, and [`RuleDefinition`]s as they cross the store boundary.

mod condition;
mod event;
mod payload;
mod rule;
pub mod topic;

pub use condition::{Comparator, Condition, ConditionError, ConditionResult, Conditions};
pub use event::{Event, EventError, EventResult, EventSource, SourceType};
pub use payload::{Payload, Scalar};
pub use rule::{DeviceId, RuleDefinition, RuleId, SensorId};

/// Category reported for sensors and devices missing from the store
pub const UNKNOWN_CATEGORY: &str = "unknown";

/// Payload field carrying the id of the publishing sensor
pub const SENSOR_ID_FIELD: &str = "sensor_id";

/// Payload field carrying the id of the addressed or reporting device
pub const DEVICE_ID_FIELD: &str = "device_id";
