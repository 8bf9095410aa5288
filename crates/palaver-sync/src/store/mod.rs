//! The log store the sync engine reads from and writes to.
//!
//! Stores hold one append-only log per channel. Keys are message ids and
//! order lexicographically; values are JSON objects updated with path
//! updates (see [`palaver_types::fields`]).
pub mod memory;
pub mod remote;

use std::future::Future;

use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use palaver_types::api::Direction;
use palaver_types::fields::{self, Fields, LogEntry};
use palaver_types::models::{ChannelId, MessageId};

use crate::error::StoreError;

pub type SubscriptionId = Uuid;

/// What an append subscription delivers, in store order.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendEvent {
    Appended(LogEntry),
    /// The transport was lost and a reconnect attempt is under way.
    Reconnecting { attempt: u32 },
    /// The transport came back and the subscription was re-established.
    Resubscribed,
    /// Reconnecting failed for good. Nothing follows.
    Dropped { reason: String },
}

pub struct AppendSubscription {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<AppendEvent>,
}

/// Address of a value inside one entry of a channel log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorePath {
    pub channel_id: ChannelId,
    pub key: String,
    pub path: String,
}

impl StorePath {
    pub fn new(channel_id: ChannelId, key: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            channel_id,
            key: key.into(),
            path: path.into(),
        }
    }

    /// `<channel>/<message>/reactions/<emoji>`
    pub fn reaction_count(channel_id: &ChannelId, message_id: &MessageId, emoji: &str) -> Self {
        Self::new(
            channel_id.clone(),
            message_id.as_str(),
            fields::join_path(&[fields::REACTIONS, emoji]),
        )
    }
}

impl std::fmt::Display for StorePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.channel_id, self.key, self.path)
    }
}

/// The narrow surface the sync engine needs from a log store.
///
/// `transact` runs `update` against the current value at `path` and commits
/// the result atomically, re-running `update` on contention until the
/// store's attempt budget runs out. It never creates the enclosing entry.
pub trait MessageStore: Send + Sync + 'static {
    fn range_read(
        &self,
        channel_id: &ChannelId,
        bound: Option<&str>,
        direction: Direction,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<LogEntry>, StoreError>> + Send;

    fn point_read(
        &self,
        channel_id: &ChannelId,
        key: &str,
    ) -> impl Future<Output = Result<Option<LogEntry>, StoreError>> + Send;

    fn write(
        &self,
        channel_id: &ChannelId,
        key: &str,
        fields: Fields,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Deliver every entry appended to the channel from now on, in append
    /// order. Entries that already exist are not replayed.
    fn subscribe_append(
        &self,
        channel_id: &ChannelId,
    ) -> impl Future<Output = Result<AppendSubscription, StoreError>> + Send;

    fn unsubscribe(&self, id: SubscriptionId) -> impl Future<Output = ()> + Send;

    fn transact<F>(
        &self,
        path: &StorePath,
        update: F,
    ) -> impl Future<Output = Result<Value, StoreError>> + Send
    where
        F: Fn(Option<&Value>) -> Value + Send + Sync + 'static;
}

/// `update` for counters: absent or non-numeric counts start from zero.
pub fn increment(current: Option<&Value>) -> Value {
    let count = current.and_then(Value::as_u64).unwrap_or(0);
    Value::from(count + 1)
}
