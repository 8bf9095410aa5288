use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use tracing::warn;
use uuid::Uuid;

use palaver_types::events::GatewayEvent;
use palaver_types::fields::LogEntry;

/// An append, serialized once and fanned out to every connection.
#[derive(Debug, Clone)]
pub struct Notice {
    pub channel_id: Arc<str>,
    pub json: Arc<str>,
}

/// Tracks gateway connections and their channel subscriptions, and fans out
/// append notices.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Broadcast channel for append notices; every connection receives all
    /// notices and filters by its own subscriptions
    broadcast_tx: broadcast::Sender<Notice>,

    /// conn_id -> subscribed channel ids
    subscriptions: RwLock<HashMap<Uuid, HashSet<String>>>,
}

impl Dispatcher {
    pub fn new(capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                subscriptions: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to append notices. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Announce a newly appended entry to all connections.
    pub fn publish_append(&self, channel_id: &str, entry: LogEntry) {
        let event = GatewayEvent::EntryAppended {
            channel_id: channel_id.to_string(),
            entry,
        };
        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize append for {}: {}", channel_id, e);
                return;
            }
        };
        // No receivers is fine: nobody is connected.
        let _ = self.inner.broadcast_tx.send(Notice {
            channel_id: channel_id.into(),
            json: json.into(),
        });
    }

    pub async fn register_connection(&self) -> Uuid {
        let conn_id = Uuid::new_v4();
        self.inner.subscriptions.write().await.insert(conn_id, HashSet::new());
        conn_id
    }

    pub async fn unregister_connection(&self, conn_id: Uuid) {
        self.inner.subscriptions.write().await.remove(&conn_id);
    }

    /// Returns false if the connection was already subscribed.
    pub async fn add_subscription(&self, conn_id: Uuid, channel_id: &str) -> bool {
        self.inner
            .subscriptions
            .write()
            .await
            .entry(conn_id)
            .or_default()
            .insert(channel_id.to_string())
    }

    pub async fn remove_subscription(&self, conn_id: Uuid, channel_id: &str) -> bool {
        self.inner
            .subscriptions
            .write()
            .await
            .get_mut(&conn_id)
            .is_some_and(|subs| subs.remove(channel_id))
    }

    pub async fn is_subscribed(&self, conn_id: Uuid, channel_id: &str) -> bool {
        self.inner
            .subscriptions
            .read()
            .await
            .get(&conn_id)
            .is_some_and(|subs| subs.contains(channel_id))
    }

    /// Number of connections currently watching a channel.
    pub async fn subscriber_count(&self, channel_id: &str) -> usize {
        self.inner
            .subscriptions
            .read()
            .await
            .values()
            .filter(|subs| subs.contains(channel_id))
            .count()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(1024)
    }
}
