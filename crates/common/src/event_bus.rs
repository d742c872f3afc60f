use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

/// Payload wrapper delivered to subscribers, stamped at publish time.
#[derive(Debug, Clone)]
pub struct EventEnvelope<K, T> {
    pub topic: K,
    pub payload: T,
    pub ts_ms: u128,
}

/// Broadcast bus keyed by a caller-supplied topic type, usually an enum.
/// One channel per topic, created lazily on first publish or subscribe.
/// Publishing is fire-and-forget: absent subscribers are logged at debug,
/// never propagated back to the publisher.
pub struct EventBus<K, T> {
    channels: Arc<RwLock<HashMap<K, broadcast::Sender<EventEnvelope<K, T>>>>>,
    subscribe_buffer: usize,
}

// Derived Clone would require K: Clone + T: Clone on the handle itself
impl<K, T> Clone for EventBus<K, T> {
    fn clone(&self) -> Self {
        Self {
            channels: Arc::clone(&self.channels),
            subscribe_buffer: self.subscribe_buffer,
        }
    }
}

impl<K, T> Default for EventBus<K, T>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    T: Clone + Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(1000)
    }
}

impl<K, T> EventBus<K, T>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    T: Clone + Debug + Send + Sync + 'static,
{
    pub fn new(subscribe_buffer: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            subscribe_buffer,
        }
    }

    pub async fn publish(&self, topic: K, payload: T) {
        let sender = self.sender(&topic).await;
        let envelope = EventEnvelope {
            topic: topic.clone(),
            payload,
            ts_ms: current_ts_ms(),
        };
        match sender.send(envelope) {
            Ok(delivered) => {
                debug!(target: "event_bus", topic = ?topic, delivered, "published");
            }
            Err(_) => {
                debug!(target: "event_bus", topic = ?topic, "no subscribers");
            }
        }
    }

    pub async fn subscribe(&self, topic: K) -> broadcast::Receiver<EventEnvelope<K, T>> {
        self.sender(&topic).await.subscribe()
    }

    async fn sender(&self, topic: &K) -> broadcast::Sender<EventEnvelope<K, T>> {
        {
            let channels = self.channels.read().await;
            if let Some(sender) = channels.get(topic) {
                return sender.clone();
            }
        }
        let mut channels = self.channels.write().await;
        channels
            .entry(topic.clone())
            .or_insert_with(|| {
                info!(target: "event_bus", topic = ?topic, "created topic");
                broadcast::channel(self.subscribe_buffer).0
            })
            .clone()
    }
}

fn current_ts_ms() -> u128 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}
