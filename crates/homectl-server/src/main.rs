//! homectl
//!
//! Entry point: runs the rule controller and traffic monitor against an MQTT
//! broker, or administers rules, sensors and devices in the database.

mod cli;
mod controller;
mod monitor;

use anyhow::{Context, Result};
use clap::Parser;
use homectl_config::{ControllerConfig, MqttConfig};
use homectl_rules::EngineConfig;
use homectl_store::SqliteStore;
use homectl_transport::{MqttEndpoint, MqttTransport, Qos};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command, EndpointKind};
use crate::controller::Controller;
use crate::monitor::Monitor;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ControllerConfig::load_or_default(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    if let Some(database) = cli.database {
        config.database.path = database;
    }

    init_tracing(&config.logger.level);

    let store = SqliteStore::open(&config.database.path)
        .with_context(|| format!("failed to open {}", config.database.path.display()))?;

    let output = match cli.command {
        Command::Serve => return serve(config, store).await,
        Command::Rules { command } => cli::rules(&store, command).await?,
        Command::Sensors { command } => cli::endpoints(&store, EndpointKind::Sensor, command).await?,
        Command::Devices { command } => cli::endpoints(&store, EndpointKind::Device, command).await?,
        Command::Events { command } => cli::events(&store, command).await?,
    };
    for line in output {
        println!("{}", line);
    }
    Ok(())
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn endpoint(mqtt: &MqttConfig, client_id: &str) -> MqttEndpoint {
    let mut endpoint = MqttEndpoint::new(&mqtt.host, mqtt.port, client_id);
    endpoint.keep_alive = mqtt.keep_alive();
    endpoint.capacity = mqtt.capacity;
    match mqtt.credentials() {
        Some((username, password)) => endpoint.with_credentials(username, password),
        None => endpoint,
    }
}

async fn serve(config: ControllerConfig, store: SqliteStore) -> Result<()> {
    info!(
        broker = %config.mqtt.host,
        port = config.mqtt.port,
        database = %config.database.path.display(),
        "Starting homectl"
    );

    let store = Arc::new(store);
    let engine_config = EngineConfig {
        cooldown: config.rules.cooldown(),
        qos: Qos::try_from(config.rules.qos)?,
    };

    let (transport, inbound) = MqttTransport::connect(&endpoint(&config.mqtt, &config.mqtt.client_id))?;
    let transport = Arc::new(transport);
    let controller = Controller::new(store.clone(), transport.clone(), engine_config);
    let mut tasks = vec![controller.start(inbound).await?];

    let monitor_transport = if config.monitor.enabled {
        let (monitor_transport, monitor_inbound) =
            MqttTransport::connect(&endpoint(&config.mqtt, &config.monitor.client_id))?;
        Monitor::subscribe(&monitor_transport).await?;
        let monitor = Monitor::new(store.clone(), config.monitor.min_log_interval());
        tasks.push(tokio::spawn(monitor.run(monitor_inbound)));
        Some(monitor_transport)
    } else {
        None
    };

    info!("homectl is running");
    wait_for_shutdown(&controller, config.rules.refresh_interval()).await?;
    info!("Shutting down");

    controller.stop();
    transport.disconnect().await?;
    if let Some(monitor_transport) = monitor_transport {
        monitor_transport.disconnect().await?;
    }
    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            error!(error = %e, "Task ended abnormally");
        }
    }

    info!("Stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown(controller: &Controller, refresh_every: Option<Duration>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut refresh = refresh_every.map(|period| interval_at(Instant::now() + period, period));
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => return Ok(result?),
            _ = hangup.recv() => {
                info!("Received SIGHUP, reloading rules");
                if let Err(e) = controller.reload().await {
                    error!(error = %e, "Reload failed");
                }
            }
            _ = next_tick(&mut refresh) => refresh_topics(controller).await,
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(controller: &Controller, refresh_every: Option<Duration>) -> Result<()> {
    let mut refresh = refresh_every.map(|period| interval_at(Instant::now() + period, period));
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => return Ok(result?),
            _ = next_tick(&mut refresh) => refresh_topics(controller).await,
        }
    }
}

async fn next_tick(refresh: &mut Option<Interval>) {
    match refresh {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn refresh_topics(controller: &Controller) {
    if let Err(e) = controller.refresh().await {
        warn!(error = %e, "Category refresh failed");
    }
}
