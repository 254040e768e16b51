//! MQTT adapter built on rumqttc

use async_trait::async_trait;
use chrono::Utc;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{Inbound, InboundMessage, Qos, Transport, TransportError, TransportResult};

/// Where and how to reach the broker
#[derive(Debug, Clone)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<(String, String)>,
    pub keep_alive: Duration,
    /// Capacity of the outgoing request queue and of the inbound channel
    pub capacity: usize,
    /// Pause between reconnection attempts
    pub reconnect_delay: Duration,
}

impl MqttEndpoint {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            credentials: None,
            keep_alive: Duration::from_secs(30),
            capacity: 64,
            reconnect_delay: Duration::from_secs(2),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    fn options(&self) -> MqttOptions {
        let mut opts = MqttOptions::new(&self.client_id, &self.host, self.port);
        opts.set_keep_alive(self.keep_alive);
        opts.set_clean_session(true);
        if let Some((username, password)) = &self.credentials {
            opts.set_credentials(username, password);
        }
        opts
    }
}

type Subscriptions = Arc<Mutex<Vec<(String, Qos)>>>;

/// How long [`MqttTransport::disconnect`] waits for the event loop to flush
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// A connection to an MQTT broker
///
/// Inbound publishes are forwarded in arrival order to the channel returned
/// by [`MqttTransport::connect`]. Subscriptions are replayed after every
/// reconnect since sessions are clean.
pub struct MqttTransport {
    client: AsyncClient,
    subscriptions: Subscriptions,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Start the client and its event loop task
    ///
    /// The broker connection itself is established lazily by the event loop;
    /// failures are logged and retried every `reconnect_delay`.
    pub fn connect(endpoint: &MqttEndpoint) -> TransportResult<(Self, Inbound)> {
        if endpoint.host.is_empty() {
            return Err(TransportError::NotConnected("empty broker host".to_string()));
        }

        let (client, eventloop) = AsyncClient::new(endpoint.options(), endpoint.capacity);
        let (sender, receiver) = mpsc::channel(endpoint.capacity.max(1));
        let subscriptions: Subscriptions = Arc::new(Mutex::new(Vec::new()));

        info!(
            host = %endpoint.host,
            port = endpoint.port,
            client_id = %endpoint.client_id,
            "Connecting to MQTT broker"
        );

        let event_task = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            Arc::clone(&subscriptions),
            sender,
            endpoint.reconnect_delay,
        ));

        Ok((
            Self {
                client,
                subscriptions,
                event_task: Mutex::new(Some(event_task)),
            },
            receiver,
        ))
    }

    /// Send a DISCONNECT and stop the event loop
    ///
    /// Closes the inbound channel once the event loop has exited.
    pub async fn disconnect(&self) -> TransportResult<()> {
        if let Err(e) = self.client.try_disconnect() {
            warn!(error = %e, "MQTT disconnect request failed");
        }

        let handle = self.event_task.lock().ok().and_then(|mut task| task.take());
        if let Some(mut handle) = handle {
            if tokio::time::timeout(DISCONNECT_TIMEOUT, &mut handle).await.is_err() {
                debug!("MQTT event loop did not stop in time, aborting");
                handle.abort();
            }
        }
        info!("Disconnected from MQTT broker");
        Ok(())
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.event_task.get_mut().ok().and_then(Option::take) {
            handle.abort();
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn subscribe(&self, filter: &str, qos: Qos) -> TransportResult<()> {
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            if !subscriptions.iter().any(|(f, _)| f == filter) {
                subscriptions.push((filter.to_string(), qos));
            }
        }

        self.client
            .subscribe(filter, qos.into())
            .await
            .map_err(|e| TransportError::Subscribe {
                filter: filter.to_string(),
                reason: e.to_string(),
            })?;
        debug!(filter, %qos, "Subscribed");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> TransportResult<()> {
        self.client
            .publish(topic, qos.into(), false, payload)
            .await
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Subscriptions,
    sender: mpsc::Sender<InboundMessage>,
    reconnect_delay: Duration,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let message = InboundMessage {
                    topic: p.topic,
                    payload: p.payload.to_vec(),
                    received_at: Utc::now(),
                };
                if sender.send(message).await.is_err() {
                    debug!("Inbound receiver dropped, stopping MQTT event loop");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    error!(code = ?ack.code, "MQTT broker refused connection");
                    continue;
                }
                info!("Connected to MQTT broker");
                resubscribe(&client, &subscriptions);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Disconnect sent, stopping MQTT event loop");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "MQTT connection error, retrying");
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }
}

// Runs inside the event loop task, so it must not wait on the request queue
fn resubscribe(client: &AsyncClient, subscriptions: &Subscriptions) {
    let Ok(subscriptions) = subscriptions.lock() else {
        return;
    };
    for (filter, qos) in subscriptions.iter() {
        if let Err(e) = client.try_subscribe(filter.as_str(), (*qos).into()) {
            warn!(filter = %filter, error = %e, "Failed to restore subscription");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_defaults() {
        let endpoint = MqttEndpoint::new("localhost", 1883, "homectl-controller")
            .with_credentials("user", "secret");
        assert_eq!(endpoint.keep_alive, Duration::from_secs(30));
        assert_eq!(endpoint.credentials, Some(("user".to_string(), "secret".to_string())));

        let opts = endpoint.options();
        assert_eq!(opts.client_id(), "homectl-controller");
        assert_eq!(opts.broker_address(), ("localhost".to_string(), 1883));
    }

    #[tokio::test]
    async fn test_empty_host_is_rejected() {
        let endpoint = MqttEndpoint::new("", 1883, "c");
        assert!(matches!(
            MqttTransport::connect(&endpoint),
            Err(TransportError::NotConnected(_))
        ));
    }
}
