//! Configuration for homectl
//!
//! The controller reads a single YAML file (`homectl.yaml` by default) with
//! support for a few custom tags:
//!
//! - `!include path` - Include another YAML file
//! - `!secret key` - Substitute from `secrets.yaml`
//! - `!env_var VAR` - Environment variable substitution
//!
//! # Example
//!
//! ```ignore
//! use homectl_config::ControllerConfig;
//!
//! let config = ControllerConfig::load("/etc/homectl/homectl.yaml")?;
//! println!("broker at {}:{}", config.mqtt.host, config.mqtt.port);
//! ```

mod controller;
mod error;
mod loader;
mod secrets;

pub use controller::{
    ControllerConfig, DatabaseConfig, LoggerConfig, MonitorConfig, MqttConfig, RulesConfig,
    DEFAULT_CONFIG_FILE,
};
pub use error::{ConfigError, ConfigResult};
pub use loader::{load_yaml, ConfigLoader};
pub use secrets::{Secrets, SECRETS_FILE};

pub use serde_yaml::Value;
