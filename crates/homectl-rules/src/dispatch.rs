//! Action dispatch

use homectl_core::DEVICE_ID_FIELD;
use homectl_transport::{Qos, Transport, TransportError};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::rule::Rule;

/// Dispatch errors
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to encode command for rule {rule_id}: {source}")]
    Encode {
        rule_id: i64,
        #[source]
        source: serde_json::Error,
    },

    #[error("transport rejected command for rule {rule_id}: {source}")]
    Transport {
        rule_id: i64,
        #[source]
        source: TransportError,
    },
}

/// Publishes rule actions as device commands
#[derive(Clone)]
pub struct ActionDispatcher {
    transport: Arc<dyn Transport>,
    qos: Qos,
}

impl ActionDispatcher {
    pub fn new(transport: Arc<dyn Transport>, qos: Qos) -> Self {
        Self { transport, qos }
    }

    pub fn qos(&self) -> Qos {
        self.qos
    }

    /// Command body: the target `device_id` overlaid with the action fields
    ///
    /// Action fields win on key collision.
    pub fn build_payload(rule: &Rule) -> serde_json::Map<String, serde_json::Value> {
        let mut payload = serde_json::Map::new();
        payload.insert(DEVICE_ID_FIELD.to_string(), rule.target.device_id.into());
        for (key, value) in &rule.action {
            payload.insert(key.clone(), value.clone());
        }
        payload
    }

    /// Publish the command for `rule` to its target topic
    pub async fn dispatch(&self, rule: &Rule) -> Result<(), DispatchError> {
        let payload = Self::build_payload(rule);
        let bytes = serde_json::to_vec(&payload).map_err(|source| DispatchError::Encode {
            rule_id: rule.id,
            source,
        })?;

        debug!(
            rule_id = rule.id,
            topic = %rule.target.topic,
            qos = %self.qos,
            "Dispatching command"
        );

        self.transport
            .publish(&rule.target.topic, bytes, self.qos)
            .await
            .map_err(|source| DispatchError::Transport {
                rule_id: rule.id,
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homectl_core::RuleDefinition;
    use homectl_transport::MemoryBroker;
    use serde_json::json;

    fn rule(action: serde_json::Value) -> Rule {
        let definition = RuleDefinition::from_json(
            "Heat when cold",
            100,
            &json!({"temperature": "<18"}),
            200,
            &action,
        )
        .unwrap();
        Rule::from_definition(7, definition, "temperature", "temperature", true)
    }

    #[test]
    fn test_build_payload_puts_device_id_first() {
        let payload = ActionDispatcher::build_payload(&rule(json!({"state": "on", "temperature": 22})));
        assert_eq!(
            serde_json::Value::Object(payload),
            json!({"device_id": 200, "state": "on", "temperature": 22})
        );
    }

    #[test]
    fn test_action_wins_on_collision() {
        let payload = ActionDispatcher::build_payload(&rule(json!({"device_id": 5})));
        assert_eq!(payload["device_id"], json!(5));
    }

    #[tokio::test]
    async fn test_dispatch_publishes_to_target_topic() {
        let broker = MemoryBroker::new();
        let (transport, _inbound) = broker.connect();
        let dispatcher = ActionDispatcher::new(Arc::new(transport), Qos::AtLeastOnce);

        tokio_test::assert_ok!(dispatcher.dispatch(&rule(json!({"state": "on"}))).await);

        let sent = broker.published_to("temperature/send");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].qos, Qos::AtLeastOnce);
        let body: serde_json::Value = serde_json::from_slice(&sent[0].payload).unwrap();
        assert_eq!(body, json!({"device_id": 200, "state": "on"}));
    }

    #[tokio::test]
    async fn test_transport_failure_is_reported() {
        let broker = MemoryBroker::new();
        let (transport, _inbound) = broker.connect();
        let dispatcher = ActionDispatcher::new(Arc::new(transport), Qos::AtLeastOnce);
        broker.set_offline(true);

        let result = dispatcher.dispatch(&rule(json!({"state": "on"}))).await;
        assert!(matches!(result, Err(DispatchError::Transport { rule_id: 7, .. })));
    }
}
