//! Loading a complete configuration directory from disk

use homectl_config::{ConfigError, ControllerConfig, DEFAULT_CONFIG_FILE, SECRETS_FILE};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
fn test_load_with_secrets_and_include() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join(SECRETS_FILE),
        "mqtt_user: main_connection\nmqtt_password: hunter2\n",
    )
    .unwrap();
    fs::write(dir.path().join("rules.yaml"), "cooldown_secs: 8\nqos: 2\n").unwrap();
    fs::write(
        dir.path().join(DEFAULT_CONFIG_FILE),
        r#"
mqtt:
  host: broker.local
  username: !secret mqtt_user
  password: !secret mqtt_password
database:
  path: /var/lib/homectl/homectl.db
rules: !include rules.yaml
monitor:
  enabled: false
logger:
  level: debug
"#,
    )
    .unwrap();

    let config = ControllerConfig::load(dir.path().join(DEFAULT_CONFIG_FILE)).unwrap();

    assert_eq!(config.mqtt.host, "broker.local");
    assert_eq!(config.mqtt.credentials(), Some(("main_connection", "hunter2")));
    assert_eq!(
        config.database.path,
        PathBuf::from("/var/lib/homectl/homectl.db")
    );
    assert_eq!(config.rules.cooldown_secs, 8);
    assert_eq!(config.rules.qos, 2);
    assert!(!config.monitor.enabled);
    assert_eq!(config.logger.level, "debug");
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(DEFAULT_CONFIG_FILE);

    assert!(matches!(
        ControllerConfig::load(&path),
        Err(ConfigError::ReadFile { .. })
    ));
    assert_eq!(
        ControllerConfig::load_or_default(&path).unwrap(),
        ControllerConfig::default()
    );
}
