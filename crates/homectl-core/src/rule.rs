//! Rule definitions as they cross the store boundary

use serde::{Deserialize, Serialize};

use crate::condition::{ConditionError, ConditionResult, Conditions};

/// Store-assigned rule identifier; ascending ids follow creation order
pub type RuleId = i64;

/// Sensor identifier as published in `sensor_id`
pub type SensorId = i64;

/// Device identifier as published in `device_id`
pub type DeviceId = i64;

/// Everything needed to create a rule
///
/// Topics are deliberately absent: they are derived from the sensor and
/// device categories whenever the rule is resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    /// Display name
    pub name: String,

    /// Sensor whose telemetry is evaluated
    pub sensor_id: SensorId,

    /// Clauses that must all hold
    pub conditions: Conditions,

    /// Device that receives the command
    pub device_id: DeviceId,

    /// Fields merged into the command payload
    #[serde(default)]
    pub action: serde_json::Map<String, serde_json::Value>,
}

impl RuleDefinition {
    pub fn new(
        name: impl Into<String>,
        sensor_id: SensorId,
        conditions: impl Into<Conditions>,
        device_id: DeviceId,
        action: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            name: name.into(),
            sensor_id,
            conditions: conditions.into(),
            device_id,
            action,
        }
    }

    /// Build a definition from the JSON wire format, validating every clause
    pub fn from_json(
        name: impl Into<String>,
        sensor_id: SensorId,
        conditions: &serde_json::Value,
        device_id: DeviceId,
        action: &serde_json::Value,
    ) -> ConditionResult<Self> {
        let conditions = Conditions::from_json(conditions)?;
        let action = action
            .as_object()
            .cloned()
            .ok_or(ConditionError::ActionNotObject)?;

        Ok(Self::new(name, sensor_id, conditions, device_id, action))
    }
}
