//! In-memory backend

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use homectl_core::{DeviceId, EventSource, RuleDefinition, RuleId, SensorId, SourceType, UNKNOWN_CATEGORY};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

use crate::{
    source_columns, EndpointRecord, EventRecord, EventRecorder, ExecutionRecord, RuleRow,
    RuleStore, StoreError, StoreResult,
};

/// Process-local store with the same semantics as [`crate::SqliteStore`]
///
/// Writes can be switched off with [`MemoryStore::set_unavailable`] to
/// exercise persistence failures.
#[derive(Default)]
pub struct MemoryStore {
    rules: DashMap<RuleId, RuleRow>,
    sensors: DashMap<SensorId, EndpointRecord>,
    devices: DashMap<DeviceId, EndpointRecord>,
    events: Mutex<Vec<EventRecord>>,
    executions: Mutex<Vec<ExecutionRecord>>,
    last_rule_id: AtomicI64,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with [`StoreError::Unavailable`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }

    pub fn upsert_sensor(&self, sensor: EndpointRecord) {
        self.sensors.insert(sensor.id, sensor);
    }

    pub fn upsert_device(&self, device: EndpointRecord) {
        self.devices.insert(device.id, device);
    }

    pub fn sensor(&self, id: SensorId) -> Option<EndpointRecord> {
        self.sensors.get(&id).map(|s| s.value().clone())
    }

    pub fn device(&self, id: DeviceId) -> Option<EndpointRecord> {
        self.devices.get(&id).map(|d| d.value().clone())
    }

    /// Firings of one rule, oldest first
    pub fn executions(&self, rule_id: RuleId) -> Vec<ExecutionRecord> {
        self.executions
            .lock()
            .map(|log| log.iter().filter(|e| e.rule_id == rule_id).cloned().collect())
            .unwrap_or_default()
    }

    fn push_execution(&self, rule_id: RuleId, at: DateTime<Utc>) -> StoreResult<()> {
        let mut log = self
            .executions
            .lock()
            .map_err(|_| StoreError::Unavailable("execution log lock poisoned".to_string()))?;
        let id = log.len() as i64 + 1;
        log.push(ExecutionRecord {
            id,
            rule_id,
            executed_at: at,
        });
        Ok(())
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn all_rules(&self) -> StoreResult<Vec<RuleRow>> {
        let mut rules: Vec<RuleRow> = self.rules.iter().map(|r| r.value().clone()).collect();
        rules.sort_by_key(|r| r.id);
        Ok(rules)
    }

    async fn add_rule(&self, definition: &RuleDefinition) -> StoreResult<RuleId> {
        self.check_available()?;
        let id = self.last_rule_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.rules.insert(
            id,
            RuleRow {
                id,
                name: definition.name.clone(),
                sensor_id: definition.sensor_id,
                conditions: definition.conditions.clone(),
                device_id: definition.device_id,
                action: definition.action.clone(),
                enabled: true,
            },
        );
        Ok(id)
    }

    async fn delete_rule(&self, id: RuleId) -> StoreResult<()> {
        self.check_available()?;
        self.rules.remove(&id);
        Ok(())
    }

    async fn set_enabled(&self, id: RuleId, enabled: bool) -> StoreResult<()> {
        self.check_available()?;
        if let Some(mut rule) = self.rules.get_mut(&id) {
            rule.enabled = enabled;
        }
        Ok(())
    }

    async fn sensor_category(&self, id: SensorId) -> StoreResult<String> {
        Ok(self
            .sensors
            .get(&id)
            .map(|s| s.category.clone())
            .unwrap_or_else(|| UNKNOWN_CATEGORY.to_string()))
    }

    async fn device_category(&self, id: DeviceId) -> StoreResult<String> {
        Ok(self
            .devices
            .get(&id)
            .map(|d| d.category.clone())
            .unwrap_or_else(|| UNKNOWN_CATEGORY.to_string()))
    }

    async fn sensor_categories(&self) -> StoreResult<Vec<String>> {
        let categories: BTreeSet<String> =
            self.sensors.iter().map(|s| s.category.clone()).collect();
        Ok(categories.into_iter().collect())
    }

    async fn log_execution(&self, rule_id: RuleId, at: DateTime<Utc>) -> StoreResult<()> {
        self.check_available()?;
        self.push_execution(rule_id, at)
    }
}

#[async_trait]
impl EventRecorder for MemoryStore {
    async fn log_event(
        &self,
        source: Option<EventSource>,
        payload: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.check_available()?;
        let (source_type, source_id) = source_columns(source);
        let mut events = self
            .events
            .lock()
            .map_err(|_| StoreError::Unavailable("event log lock poisoned".to_string()))?;
        let id = events.len() as i64 + 1;
        events.push(EventRecord {
            id,
            source_type,
            source_id,
            payload: payload.to_string(),
            timestamp: at,
        });
        Ok(())
    }

    async fn update_status(
        &self,
        source: EventSource,
        payload: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.check_available()?;
        let registry = match source.kind {
            SourceType::Sensor => &self.sensors,
            SourceType::Device => &self.devices,
        };
        if let Some(mut record) = registry.get_mut(&source.id) {
            record.last_payload = Some(payload.to_string());
            record.last_update = Some(at);
        }
        Ok(())
    }

    async fn recent_events(&self, limit: usize) -> StoreResult<Vec<EventRecord>> {
        let events = self
            .events
            .lock()
            .map_err(|_| StoreError::Unavailable("event log lock poisoned".to_string()))?;
        Ok(events.iter().rev().take(limit).cloned().collect())
    }
}
