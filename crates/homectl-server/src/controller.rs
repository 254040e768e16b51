//! Controller service
//!
//! Wires a transport connection to the rule engine: subscribes to the
//! telemetry topic of every known sensor category, loads the rules and runs
//! the engine loop on the connection's inbound channel.

use anyhow::{Context, Result};
use homectl_core::topic::telemetry_topic;
use homectl_rules::{EngineConfig, RuleEngine};
use homectl_store::RuleStore;
use homectl_transport::{Inbound, Qos, Transport};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Telemetry category that is always subscribed, even with no sensors registered
pub const DEFAULT_CATEGORY: &str = "temperature";

pub struct Controller {
    engine: Arc<RuleEngine>,
    store: Arc<dyn RuleStore>,
    transport: Arc<dyn Transport>,
    subscribed: Mutex<BTreeSet<String>>,
}

impl Controller {
    pub fn new(store: Arc<dyn RuleStore>, transport: Arc<dyn Transport>, config: EngineConfig) -> Self {
        let engine = Arc::new(RuleEngine::new(store.clone(), transport.clone(), config));
        Self {
            engine,
            store,
            transport,
            subscribed: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn engine(&self) -> &Arc<RuleEngine> {
        &self.engine
    }

    /// Subscribe, load rules and spawn the engine loop
    pub async fn start(&self, inbound: Inbound) -> Result<JoinHandle<()>> {
        self.subscribe_categories().await?;
        self.engine
            .load_rules()
            .await
            .context("failed to load rules")?;

        let engine = self.engine.clone();
        let handle = tokio::spawn(async move { engine.run(inbound).await });
        info!("Controller started");
        Ok(handle)
    }

    /// Reload rules from the store and pick up new sensor categories
    pub async fn reload(&self) -> Result<usize> {
        self.subscribe_categories().await?;
        let count = self
            .engine
            .load_rules()
            .await
            .context("failed to reload rules")?;
        info!(count, "Reloaded rules");
        Ok(count)
    }

    /// Pick up sensor and device category changes without reloading rules
    ///
    /// Subscribes to newly seen categories and re-derives the rule topics.
    /// Returns the number of rules whose topics changed.
    pub async fn refresh(&self) -> Result<usize> {
        self.subscribe_categories().await?;
        let changed = self
            .engine
            .refresh_topics()
            .await
            .context("failed to refresh rule topics")?;
        if changed > 0 {
            info!(changed, "Rule topics updated");
        }
        Ok(changed)
    }

    pub fn stop(&self) {
        self.engine.stop();
    }

    /// Topics currently subscribed, sorted
    pub async fn subscriptions(&self) -> Vec<String> {
        self.subscribed.lock().await.iter().cloned().collect()
    }

    async fn subscribe_categories(&self) -> Result<()> {
        let mut categories = self
            .store
            .sensor_categories()
            .await
            .context("failed to list sensor categories")?;
        categories.push(DEFAULT_CATEGORY.to_string());

        let mut subscribed = self.subscribed.lock().await;
        for topic in categories.iter().map(|c| telemetry_topic(c)) {
            if subscribed.contains(&topic) {
                continue;
            }
            match self.transport.subscribe(&topic, Qos::AtLeastOnce).await {
                Ok(()) => {
                    info!(topic = %topic, "Subscribed to telemetry");
                    subscribed.insert(topic);
                }
                Err(e) => warn!(topic = %topic, error = %e, "Subscription failed"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homectl_core::RuleDefinition;
    use homectl_store::{EndpointRecord, MemoryStore};
    use homectl_transport::MemoryBroker;
    use serde_json::json;
    use std::time::Duration;

    async fn wait_for(broker: &MemoryBroker, topic: &str) -> usize {
        for _ in 0..100 {
            let n = broker.published_to(topic).len();
            if n > 0 {
                return n;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        0
    }

    async fn stop(controller: &Controller, handle: JoinHandle<()>) {
        while !controller.engine().is_running() {
            tokio::task::yield_now().await;
        }
        controller.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribes_default_and_sensor_categories() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_sensor(EndpointRecord::new(1, "Tank", "water", "Float"));
        let broker = MemoryBroker::new();
        let (transport, inbound) = broker.connect();

        let controller = Controller::new(store, Arc::new(transport), EngineConfig::default());
        let handle = controller.start(inbound).await.unwrap();

        assert_eq!(
            controller.subscriptions().await,
            vec!["temperature/get".to_string(), "water/get".to_string()]
        );

        stop(&controller, handle).await;
    }

    #[tokio::test]
    async fn test_reload_picks_up_rules_and_categories() {
        let store = Arc::new(MemoryStore::new());
        let broker = MemoryBroker::new();
        let (transport, inbound) = broker.connect();
        let controller = Controller::new(store.clone(), Arc::new(transport), EngineConfig::default());
        let handle = controller.start(inbound).await.unwrap();
        assert!(controller.engine().rules().await.is_empty());

        // Registered and written while the controller runs
        store.upsert_sensor(EndpointRecord::new(7, "Stove", "gas", "MQ-5"));
        store.upsert_device(EndpointRecord::new(8, "Gas valve", "gas", "Valve"));
        store
            .add_rule(
                &RuleDefinition::from_json(
                    "Close valve on leak",
                    7,
                    &json!({"ppm": ">400"}),
                    8,
                    &json!({"state": "closed"}),
                )
                .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(controller.reload().await.unwrap(), 1);
        assert!(controller.subscriptions().await.contains(&"gas/get".to_string()));

        let (sensor, _) = broker.connect();
        sensor
            .publish("gas/get", br#"{"sensor_id": 7, "ppm": 520}"#.to_vec(), Qos::AtMostOnce)
            .await
            .unwrap();
        assert_eq!(wait_for(&broker, "gas/send").await, 1);

        stop(&controller, handle).await;
    }

    #[tokio::test]
    async fn test_refresh_follows_category_change() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_sensor(EndpointRecord::new(7, "Boiler sensor", "water", "DS18B20"));
        store.upsert_device(EndpointRecord::new(8, "Boiler", "water", "Relay"));
        store
            .add_rule(
                &RuleDefinition::from_json(
                    "Boiler on when cold",
                    7,
                    &json!({"temperature": "<40"}),
                    8,
                    &json!({"state": "on"}),
                )
                .unwrap(),
            )
            .await
            .unwrap();

        let broker = MemoryBroker::new();
        let (transport, inbound) = broker.connect();
        let controller = Controller::new(store.clone(), Arc::new(transport), EngineConfig::default());
        let handle = controller.start(inbound).await.unwrap();

        store.upsert_sensor(EndpointRecord::new(7, "Boiler sensor", "heating", "DS18B20"));
        assert_eq!(controller.refresh().await.unwrap(), 1);
        assert_eq!(controller.refresh().await.unwrap(), 0);
        assert!(controller.subscriptions().await.contains(&"heating/get".to_string()));

        let (sensor, _) = broker.connect();
        sensor
            .publish("heating/get", br#"{"sensor_id": 7, "temperature": 35}"#.to_vec(), Qos::AtMostOnce)
            .await
            .unwrap();
        assert_eq!(wait_for(&broker, "water/send").await, 1);

        stop(&controller, handle).await;
    }
}
