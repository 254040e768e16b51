//! Resolved rules
//!
//! A [`Rule`] is a stored rule row with its source and target topics
//! resolved from the current sensor and device categories.

use homectl_core::topic::{command_topic, telemetry_topic};
use homectl_core::{Conditions, DeviceId, Event, RuleDefinition, RuleId, SensorId};
use homectl_store::{RuleRow, RuleStore, StoreResult};
use serde::{Deserialize, Serialize};

use crate::evaluator::evaluate;

/// Where a rule listens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSelector {
    pub sensor_id: SensorId,
    /// `{sensor category}/get`
    pub topic: String,
}

/// Where a rule sends its command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub device_id: DeviceId,
    /// `{device category}/send`
    pub topic: String,
}

/// A rule ready for evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub name: String,
    pub source: SourceSelector,
    pub conditions: Conditions,
    pub target: Target,
    pub action: serde_json::Map<String, serde_json::Value>,
    pub enabled: bool,
}

impl Rule {
    /// Build a rule from its definition and the current categories
    pub fn from_definition(
        id: RuleId,
        definition: RuleDefinition,
        sensor_category: &str,
        device_category: &str,
        enabled: bool,
    ) -> Self {
        Self {
            id,
            name: definition.name,
            source: SourceSelector {
                sensor_id: definition.sensor_id,
                topic: telemetry_topic(sensor_category),
            },
            conditions: definition.conditions,
            target: Target {
                device_id: definition.device_id,
                topic: command_topic(device_category),
            },
            action: definition.action,
            enabled,
        }
    }

    /// Resolve a stored row through the store's category lookup
    pub async fn resolve(row: RuleRow, store: &dyn RuleStore) -> StoreResult<Self> {
        let sensor_category = store.sensor_category(row.sensor_id).await?;
        let device_category = store.device_category(row.device_id).await?;
        let (id, enabled) = (row.id, row.enabled);
        Ok(Self::from_definition(
            id,
            row.definition(),
            &sensor_category,
            &device_category,
            enabled,
        ))
    }

    /// Re-derive both topics from fresh categories
    pub async fn refresh_topics(&mut self, store: &dyn RuleStore) -> StoreResult<bool> {
        let source = telemetry_topic(&store.sensor_category(self.source.sensor_id).await?);
        let target = command_topic(&store.device_category(self.target.device_id).await?);
        let changed = source != self.source.topic || target != self.target.topic;
        self.source.topic = source;
        self.target.topic = target;
        Ok(changed)
    }

    /// Whether `event` is a candidate for this rule
    ///
    /// Ignores the enabled flag; the engine filters disabled rules itself.
    pub fn matches(&self, event: &Event) -> bool {
        event.topic == self.source.topic
            && event.sensor_id() == Some(self.source.sensor_id)
            && evaluate(&self.conditions, &event.payload)
    }

    /// The definition this rule was built from
    pub fn definition(&self) -> RuleDefinition {
        RuleDefinition::new(
            self.name.clone(),
            self.source.sensor_id,
            self.conditions.clone(),
            self.target.device_id,
            self.action.clone(),
        )
    }
}
