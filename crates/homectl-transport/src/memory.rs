//! In-process broker
//!
//! Routes publications between clients of the same [`MemoryBroker`] using
//! MQTT filter semantics. Every publication is also kept in a history so
//! tests can assert on what was sent.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::{
    topic_matches, Inbound, InboundMessage, Qos, Transport, TransportError, TransportResult,
    DEFAULT_CHANNEL_CAPACITY,
};

/// A message handed to the broker
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
}

impl Publication {
    /// Payload as UTF-8 text, lossy
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Unique identifier for a connected client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

struct Client {
    filters: Vec<String>,
    sender: mpsc::Sender<InboundMessage>,
}

/// The shared routing table behind every [`MemoryTransport`]
pub struct MemoryBroker {
    clients: DashMap<ClientId, Client>,
    history: Mutex<Vec<Publication>>,
    next_client_id: AtomicU64,
    offline: AtomicBool,
    capacity: usize,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Broker whose clients get inbound channels of `capacity` messages
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            clients: DashMap::new(),
            history: Mutex::new(Vec::new()),
            next_client_id: AtomicU64::new(1),
            offline: AtomicBool::new(false),
            capacity,
        })
    }

    /// Register a new client and return its transport and inbound channel
    pub fn connect(self: &Arc<Self>) -> (MemoryTransport, Inbound) {
        let id = ClientId(self.next_client_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.clients.insert(
            id,
            Client {
                filters: Vec::new(),
                sender,
            },
        );
        debug!(client = id.0, "Memory client connected");

        let transport = MemoryTransport {
            id,
            broker: Arc::clone(self),
        };
        (transport, receiver)
    }

    /// Simulate a broker outage; publishes and subscribes fail while offline
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Every publication accepted so far, oldest first
    pub fn published(&self) -> Vec<Publication> {
        self.history
            .lock()
            .map(|history| history.clone())
            .unwrap_or_default()
    }

    /// Publications to one topic
    pub fn published_to(&self, topic: &str) -> Vec<Publication> {
        self.published()
            .into_iter()
            .filter(|p| p.topic == topic)
            .collect()
    }

    /// Number of connected clients
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    fn check_online(&self) -> TransportResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected(
                "memory broker is offline".to_string(),
            ));
        }
        Ok(())
    }

    fn route(&self, publication: Publication) {
        trace!(topic = %publication.topic, "Routing publication");

        for client in self.clients.iter() {
            if !client
                .filters
                .iter()
                .any(|filter| topic_matches(filter, &publication.topic))
            {
                continue;
            }

            let message = InboundMessage::new(publication.topic.clone(), publication.payload.clone());
            match client.sender.try_send(message) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(client = client.key().0, topic = %publication.topic, "Inbound channel full, message dropped");
                }
                // Receiver gone; the client is cleaned up when its transport drops
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        if let Ok(mut history) = self.history.lock() {
            history.push(publication);
        }
    }
}

/// One client connection to a [`MemoryBroker`]
pub struct MemoryTransport {
    id: ClientId,
    broker: Arc<MemoryBroker>,
}

impl MemoryTransport {
    pub fn id(&self) -> ClientId {
        self.id
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn subscribe(&self, filter: &str, _qos: Qos) -> TransportResult<()> {
        self.broker.check_online()?;

        let mut client = self.broker.clients.get_mut(&self.id).ok_or_else(|| {
            TransportError::Subscribe {
                filter: filter.to_string(),
                reason: "client disconnected".to_string(),
            }
        })?;
        if !client.filters.iter().any(|f| f == filter) {
            client.filters.push(filter.to_string());
        }
        debug!(client = self.id.0, filter, "Subscribed");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> TransportResult<()> {
        self.broker.check_online()?;
        self.broker.route(Publication {
            topic: topic.to_string(),
            payload,
            qos,
        });
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.broker.clients.remove(&self.id);
    }
}
