//! Command-line interface

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use homectl_config::DEFAULT_CONFIG_FILE;
use homectl_core::RuleDefinition;
use homectl_store::{EndpointRecord, EventRecorder, RuleRow, RuleStore, SqliteStore};
use std::path::PathBuf;

/// homectl - rule-based home automation controller
#[derive(Parser, Debug)]
#[command(name = "homectl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Database file, overrides `database.path`
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the controller and monitor until interrupted
    ///
    /// Category changes are picked up every `rules.refresh_interval_secs`;
    /// rule edits made while running need a SIGHUP to take effect.
    Serve,
    /// Manage automation rules
    Rules {
        #[command(subcommand)]
        command: RulesCommand,
    },
    /// Manage registered sensors
    Sensors {
        #[command(subcommand)]
        command: EndpointCommand,
    },
    /// Manage registered devices
    Devices {
        #[command(subcommand)]
        command: EndpointCommand,
    },
    /// Inspect the message log
    Events {
        #[command(subcommand)]
        command: EventsCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum RulesCommand {
    /// List all rules
    List,
    /// Add a rule, e.g. `add "Heat" --sensor 100 --when '{"temperature":"<18"}' --device 200 --action '{"state":"on"}'`
    Add {
        name: String,
        #[arg(long)]
        sensor: i64,
        /// Conditions as a JSON object of clauses
        #[arg(long)]
        when: String,
        #[arg(long)]
        device: i64,
        /// Fields sent to the device, as a JSON object
        #[arg(long)]
        action: String,
    },
    /// Delete a rule
    Remove { id: i64 },
    Enable { id: i64 },
    Disable { id: i64 },
    /// Flip a rule between enabled and disabled
    Toggle { id: i64 },
}

#[derive(Subcommand, Debug)]
pub enum EndpointCommand {
    List,
    /// Register or update an endpoint
    Add {
        id: i64,
        name: String,
        /// Topic category, e.g. `temperature`
        #[arg(long)]
        category: String,
        /// Hardware type, e.g. `DHT22`
        #[arg(long, default_value = "generic")]
        kind: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum EventsCommand {
    /// Most recent messages, newest first
    Recent {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

/// Run a rules subcommand against the store and return its output lines
pub async fn rules(store: &SqliteStore, command: RulesCommand) -> Result<Vec<String>> {
    match command {
        RulesCommand::List => Ok(store.all_rules().await?.iter().map(describe_rule).collect()),
        RulesCommand::Add {
            name,
            sensor,
            when,
            device,
            action,
        } => {
            let conditions: serde_json::Value =
                serde_json::from_str(&when).context("conditions are not valid JSON")?;
            let action: serde_json::Value =
                serde_json::from_str(&action).context("action is not valid JSON")?;
            let definition = RuleDefinition::from_json(name, sensor, &conditions, device, &action)?;
            let id = store.add_rule(&definition).await?;
            Ok(vec![format!("added rule {}", id)])
        }
        RulesCommand::Remove { id } => {
            find_rule(store, id).await?;
            store.delete_rule(id).await?;
            Ok(vec![format!("removed rule {}", id)])
        }
        RulesCommand::Enable { id } => set_enabled(store, id, true).await,
        RulesCommand::Disable { id } => set_enabled(store, id, false).await,
        RulesCommand::Toggle { id } => {
            let rule = find_rule(store, id).await?;
            set_enabled(store, id, !rule.enabled).await
        }
    }
}

async fn set_enabled(store: &SqliteStore, id: i64, enabled: bool) -> Result<Vec<String>> {
    find_rule(store, id).await?;
    store.set_enabled(id, enabled).await?;
    let state = if enabled { "enabled" } else { "disabled" };
    Ok(vec![format!("rule {} {}", id, state)])
}

async fn find_rule(store: &SqliteStore, id: i64) -> Result<RuleRow> {
    match store.all_rules().await?.into_iter().find(|r| r.id == id) {
        Some(rule) => Ok(rule),
        None => bail!("no rule with id {}", id),
    }
}

fn describe_rule(rule: &RuleRow) -> String {
    format!(
        "{:>4}  {:<8}  {}  sensor {} {}  ->  device {} {}",
        rule.id,
        if rule.enabled { "enabled" } else { "disabled" },
        rule.name,
        rule.sensor_id,
        rule.conditions.to_json(),
        rule.device_id,
        serde_json::Value::Object(rule.action.clone()),
    )
}

/// Run a sensors or devices subcommand
pub async fn endpoints(store: &SqliteStore, kind: EndpointKind, command: EndpointCommand) -> Result<Vec<String>> {
    match command {
        EndpointCommand::List => {
            let records = match kind {
                EndpointKind::Sensor => store.sensors().await?,
                EndpointKind::Device => store.devices().await?,
            };
            Ok(records.iter().map(describe_endpoint).collect())
        }
        EndpointCommand::Add {
            id,
            name,
            category,
            kind: hardware,
        } => {
            if category.trim().is_empty() || category.contains(['/', '+', '#']) {
                bail!("invalid category '{}'", category);
            }
            let record = EndpointRecord::new(id, name, category, hardware);
            match kind {
                EndpointKind::Sensor => store.upsert_sensor(&record).await?,
                EndpointKind::Device => store.upsert_device(&record).await?,
            }
            Ok(vec![format!("registered {} {}", kind, id)])
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Sensor,
    Device,
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EndpointKind::Sensor => "sensor",
            EndpointKind::Device => "device",
        })
    }
}

fn describe_endpoint(record: &EndpointRecord) -> String {
    let last_update = record
        .last_update
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());
    format!(
        "{:>4}  {:<20}  {:<12}  {:<10}  {}  {}",
        record.id,
        record.name,
        record.category,
        record.kind,
        last_update,
        record.last_payload.as_deref().unwrap_or("-"),
    )
}

pub async fn events(store: &SqliteStore, command: EventsCommand) -> Result<Vec<String>> {
    match command {
        EventsCommand::Recent { limit } => Ok(store
            .recent_events(limit)
            .await?
            .iter()
            .map(|e| {
                format!(
                    "{}  {} {}  {}",
                    e.timestamp.to_rfc3339(),
                    e.source_type,
                    e.source_id,
                    e.payload
                )
            })
            .collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_rule_add() {
        let cli = Cli::parse_from([
            "homectl",
            "rules",
            "add",
            "Heat when cold",
            "--sensor",
            "100",
            "--when",
            r#"{"temperature":"<18"}"#,
            "--device",
            "200",
            "--action",
            r#"{"state":"on"}"#,
        ]);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
        assert!(matches!(
            cli.command,
            Command::Rules {
                command: RulesCommand::Add { sensor: 100, device: 200, .. }
            }
        ));
    }

    fn add(name: &str, when: &str) -> RulesCommand {
        RulesCommand::Add {
            name: name.to_string(),
            sensor: 100,
            when: when.to_string(),
            device: 200,
            action: r#"{"state":"on"}"#.to_string(),
        }
    }

    #[tokio::test]
    async fn test_rule_administration() {
        let store = SqliteStore::open_in_memory().unwrap();

        let out = rules(&store, add("Heat", r#"{"temperature":"<18"}"#)).await.unwrap();
        assert_eq!(out, vec!["added rule 1".to_string()]);

        let out = rules(&store, RulesCommand::Toggle { id: 1 }).await.unwrap();
        assert_eq!(out, vec!["rule 1 disabled".to_string()]);
        assert!(!store.all_rules().await.unwrap()[0].enabled);

        let listing = rules(&store, RulesCommand::List).await.unwrap();
        assert_eq!(listing.len(), 1);
        assert!(listing[0].contains("disabled"));
        assert!(listing[0].contains("<18"));

        assert!(rules(&store, RulesCommand::Enable { id: 9 }).await.is_err());
        rules(&store, RulesCommand::Remove { id: 1 }).await.unwrap();
        assert!(store.all_rules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_rule_is_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();

        assert!(rules(&store, add("Bad", r#"{"temperature":"~18"}"#)).await.is_err());
        assert!(rules(&store, add("Bad", "not json")).await.is_err());
        assert!(store.all_rules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_register_endpoints() {
        let store = SqliteStore::open_in_memory().unwrap();
        let add = |category: &str| EndpointCommand::Add {
            id: 100,
            name: "Living room".to_string(),
            category: category.to_string(),
            kind: "DHT22".to_string(),
        };

        endpoints(&store, EndpointKind::Sensor, add("temperature")).await.unwrap();
        assert!(endpoints(&store, EndpointKind::Sensor, add("a/b")).await.is_err());

        assert_eq!(store.sensor_category(100).await.unwrap(), "temperature");
        let listing = endpoints(&store, EndpointKind::Sensor, EndpointCommand::List)
            .await
            .unwrap();
        assert_eq!(listing.len(), 1);
        assert!(endpoints(&store, EndpointKind::Device, EndpointCommand::List)
            .await
            .unwrap()
            .is_empty());
    }
}
