//! Controller configuration
//!
//! Parses `homectl.yaml`. Every section and every key is optional:
//!
//! ```yaml
//! mqtt:
//!   host: broker.local
//!   port: 1883
//!   username: !secret mqtt_user
//!   password: !secret mqtt_password
//! database:
//!   path: /var/lib/homectl/homectl.db
//! rules:
//!   cooldown_secs: 5
//!   qos: 1
//!   refresh_interval_secs: 30
//! monitor:
//!   enabled: true
//! logger:
//!   level: info
//! ```

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::{ConfigError, ConfigResult};
use crate::loader::ConfigLoader;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "homectl.yaml";

/// Broker connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// Bound of the outgoing request queue and the inbound channel
    pub capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "homectl-controller".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 30,
            capacity: 64,
        }
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// Username and password, when both are set
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(password)) => Some((user.as_str(), password.as_str())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("homectl.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Minimum seconds between two firings of the same rule
    pub cooldown_secs: u64,
    /// MQTT QoS of device commands (0, 1 or 2)
    pub qos: u8,
    /// How often `serve` re-reads sensor and device categories; 0 disables
    pub refresh_interval_secs: u64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 5,
            qos: 1,
            refresh_interval_secs: 30,
        }
    }
}

impl RulesConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    /// Periodic readings closer together than this are not echoed to the log
    pub min_log_interval_secs: u64,
    pub client_id: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_log_interval_secs: 3,
            client_id: "homectl-monitor".to_string(),
        }
    }
}

impl MonitorConfig {
    pub fn min_log_interval(&self) -> Duration {
        Duration::from_secs(self.min_log_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Default `tracing` filter directive; `RUST_LOG` takes precedence
    pub level: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Complete controller configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub mqtt: MqttConfig,
    pub database: DatabaseConfig,
    pub rules: RulesConfig,
    pub monitor: MonitorConfig,
    pub logger: LoggerConfig,
}

impl ControllerConfig {
    /// Load and validate a configuration file
    ///
    /// `secrets.yaml` and `!include` paths are resolved next to `path`.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file = path.file_name().map(Path::new).unwrap_or(path);

        let yaml = ConfigLoader::new(dir)?.load_file(file)?;
        Self::from_yaml(&yaml)
    }

    /// Like [`ControllerConfig::load`], falling back to defaults when the file is absent
    pub fn load_or_default(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "No configuration file, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Parse an already loaded document; `null` (an empty file) means defaults
    pub fn from_yaml(yaml: &Value) -> ConfigResult<Self> {
        if yaml.is_null() {
            return Ok(Self::default());
        }
        if !yaml.is_mapping() {
            return Err(ConfigError::InvalidValue {
                key: "root".to_string(),
                reason: "configuration must be a mapping".to_string(),
            });
        }

        let config: Self =
            serde_yaml::from_value(yaml.clone()).map_err(|e| ConfigError::InvalidValue {
                key: "root".to_string(),
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.mqtt.host.trim().is_empty() {
            return Err(invalid("mqtt.host", "must not be empty"));
        }
        if self.mqtt.port == 0 {
            return Err(invalid("mqtt.port", "must be between 1 and 65535"));
        }
        if self.mqtt.capacity == 0 {
            return Err(invalid("mqtt.capacity", "must be at least 1"));
        }
        if self.mqtt.username.is_some() != self.mqtt.password.is_some() {
            return Err(invalid(
                "mqtt.password",
                "username and password must be set together",
            ));
        }
        if self.rules.qos > 2 {
            return Err(invalid("rules.qos", "must be 0, 1 or 2"));
        }
        if self.mqtt.client_id == self.monitor.client_id {
            return Err(invalid(
                "monitor.client_id",
                "must differ from mqtt.client_id",
            ));
        }
        Ok(())
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}
