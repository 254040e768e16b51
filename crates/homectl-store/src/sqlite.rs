//! SQLite backend
//!
//! Schema:
//! - sensors / devices: registry with category and last reported payload
//! - triggers: rules, conditions and action payload stored as JSON text
//! - events: every message seen by the monitor
//! - trigger_logs: one row per rule firing

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use homectl_core::{
    Conditions, DeviceId, EventSource, RuleDefinition, RuleId, SensorId, SourceType,
    UNKNOWN_CATEGORY,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::{
    source_columns, EndpointRecord, EventRecord, EventRecorder, ExecutionRecord, RuleRow,
    RuleStore, StoreError, StoreResult,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sensors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    category TEXT NOT NULL,
    type TEXT NOT NULL,
    last_payload TEXT,
    last_update TIMESTAMP
);

CREATE TABLE IF NOT EXISTS devices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    category TEXT NOT NULL,
    type TEXT NOT NULL,
    current_status TEXT,
    last_update TIMESTAMP
);

CREATE TABLE IF NOT EXISTS triggers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    sensor_id INTEGER NOT NULL,
    condition TEXT NOT NULL,
    device_id INTEGER NOT NULL,
    action_payload TEXT NOT NULL,
    enabled INTEGER DEFAULT 1
);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_type TEXT NOT NULL,
    source_id INTEGER NOT NULL,
    payload TEXT NOT NULL,
    timestamp TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS trigger_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trigger_id INTEGER NOT NULL,
    executed_at TIMESTAMP NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trigger_logs_trigger ON trigger_logs(trigger_id);
"#;

/// SQLite-backed store
///
/// The connection is shared behind a mutex and every query runs on the
/// blocking thread pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at `path`
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        debug!("Opened rule store at {:?}", path);
        Self::init(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
    }

    /// Register a sensor, replacing name, category and type if the id exists
    pub async fn upsert_sensor(&self, sensor: &EndpointRecord) -> StoreResult<()> {
        let sensor = sensor.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sensors (id, name, category, type) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name, category = excluded.category, type = excluded.type",
                params![sensor.id, sensor.name, sensor.category, sensor.kind],
            )?;
            Ok(())
        })
        .await
    }

    /// Register a device, replacing name, category and type if the id exists
    pub async fn upsert_device(&self, device: &EndpointRecord) -> StoreResult<()> {
        let device = device.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO devices (id, name, category, type) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name, category = excluded.category, type = excluded.type",
                params![device.id, device.name, device.category, device.kind],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn sensors(&self) -> StoreResult<Vec<EndpointRecord>> {
        self.with_conn(|conn| {
            query_endpoints(
                conn,
                "SELECT id, name, category, type, last_payload, last_update FROM sensors ORDER BY id",
            )
        })
        .await
    }

    pub async fn devices(&self) -> StoreResult<Vec<EndpointRecord>> {
        self.with_conn(|conn| {
            query_endpoints(
                conn,
                "SELECT id, name, category, type, current_status, last_update FROM devices ORDER BY id",
            )
        })
        .await
    }

    /// Firings of one rule, oldest first
    pub async fn executions(&self, rule_id: RuleId) -> StoreResult<Vec<ExecutionRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, trigger_id, executed_at FROM trigger_logs
                 WHERE trigger_id = ?1 ORDER BY id",
            )?;
            let records = stmt
                .query_map(params![rule_id], |row| {
                    Ok(ExecutionRecord {
                        id: row.get(0)?,
                        rule_id: row.get(1)?,
                        executed_at: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }
}

fn query_endpoints(conn: &Connection, sql: &str) -> StoreResult<Vec<EndpointRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let records = stmt
        .query_map([], |row| {
            Ok(EndpointRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                category: row.get(2)?,
                kind: row.get(3)?,
                last_payload: row.get(4)?,
                last_update: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

fn lookup_category(conn: &Connection, sql: &str, id: i64) -> StoreResult<String> {
    let category: Option<String> = conn
        .query_row(sql, params![id], |row| row.get(0))
        .optional()?;
    Ok(category.unwrap_or_else(|| UNKNOWN_CATEGORY.to_string()))
}

/// Raw `triggers` columns before JSON decoding
struct RawRule {
    id: RuleId,
    name: String,
    sensor_id: SensorId,
    condition: String,
    device_id: DeviceId,
    action_payload: String,
    enabled: i64,
}

impl RawRule {
    fn decode(self) -> StoreResult<RuleRow> {
        let conditions = Conditions::from_json(&serde_json::from_str(&self.condition)?)?;
        let action = match serde_json::from_str(&self.action_payload)? {
            serde_json::Value::Object(map) => map,
            _ => {
                return Err(StoreError::InvalidRow {
                    id: self.id,
                    reason: "action payload is not a JSON object".to_string(),
                })
            }
        };

        Ok(RuleRow {
            id: self.id,
            name: self.name,
            sensor_id: self.sensor_id,
            conditions,
            device_id: self.device_id,
            action,
            enabled: self.enabled != 0,
        })
    }
}

#[async_trait]
impl RuleStore for SqliteStore {
    async fn all_rules(&self) -> StoreResult<Vec<RuleRow>> {
        let raw = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, sensor_id, condition, device_id, action_payload, enabled
                     FROM triggers ORDER BY id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(RawRule {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            sensor_id: row.get(2)?,
                            condition: row.get(3)?,
                            device_id: row.get(4)?,
                            action_payload: row.get(5)?,
                            enabled: row.get(6)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut rules = Vec::with_capacity(raw.len());
        for row in raw {
            let id = row.id;
            match row.decode() {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!(rule_id = id, error = %e, "Skipping unreadable rule"),
            }
        }
        Ok(rules)
    }

    async fn add_rule(&self, definition: &RuleDefinition) -> StoreResult<RuleId> {
        let condition = serde_json::to_string(&definition.conditions.to_json())?;
        let action = serde_json::to_string(&definition.action)?;
        let name = definition.name.clone();
        let (sensor_id, device_id) = (definition.sensor_id, definition.device_id);

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO triggers (name, sensor_id, condition, device_id, action_payload, enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                params![name, sensor_id, condition, device_id, action],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn delete_rule(&self, id: RuleId) -> StoreResult<()> {
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM triggers WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    async fn set_enabled(&self, id: RuleId, enabled: bool) -> StoreResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE triggers SET enabled = ?1 WHERE id = ?2",
                params![i64::from(enabled), id],
            )?;
            Ok(())
        })
        .await
    }

    async fn sensor_category(&self, id: SensorId) -> StoreResult<String> {
        self.with_conn(move |conn| {
            lookup_category(conn, "SELECT category FROM sensors WHERE id = ?1", id)
        })
        .await
    }

    async fn device_category(&self, id: DeviceId) -> StoreResult<String> {
        self.with_conn(move |conn| {
            lookup_category(conn, "SELECT category FROM devices WHERE id = ?1", id)
        })
        .await
    }

    async fn sensor_categories(&self) -> StoreResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT category FROM sensors ORDER BY category")?;
            let categories = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(categories)
        })
        .await
    }

    async fn log_execution(&self, rule_id: RuleId, at: DateTime<Utc>) -> StoreResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO trigger_logs (trigger_id, executed_at) VALUES (?1, ?2)",
                params![rule_id, at],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl EventRecorder for SqliteStore {
    async fn log_event(
        &self,
        source: Option<EventSource>,
        payload: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let (source_type, source_id) = source_columns(source);
        let payload = payload.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO events (source_type, source_id, payload, timestamp)
                 VALUES (?1, ?2, ?3, ?4)",
                params![source_type, source_id, payload, at],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_status(
        &self,
        source: EventSource,
        payload: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let sql = match source.kind {
            SourceType::Sensor => {
                "UPDATE sensors SET last_payload = ?1, last_update = ?2 WHERE id = ?3"
            }
            SourceType::Device => {
                "UPDATE devices SET current_status = ?1, last_update = ?2 WHERE id = ?3"
            }
        };
        let payload = payload.to_string();
        self.with_conn(move |conn| {
            conn.execute(sql, params![payload, at, source.id])?;
            Ok(())
        })
        .await
    }

    async fn recent_events(&self, limit: usize) -> StoreResult<Vec<EventRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, source_type, source_id, payload, timestamp
                 FROM events ORDER BY id DESC LIMIT ?1",
            )?;
            let records = stmt
                .query_map(params![limit], |row| {
                    Ok(EventRecord {
                        id: row.get(0)?,
                        source_type: row.get(1)?,
                        source_id: row.get(2)?,
                        payload: row.get(3)?,
                        timestamp: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }
}
