//! In-process [`MessageStore`] with the same semantics as the log service:
//! inclusive range bounds, path updates, per-entry revisions and optimistic
//! transactions. Faults can be injected to exercise the failure paths of the
//! sync engine.
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use palaver_types::api::Direction;
use palaver_types::fields::{Fields, LogEntry, apply_updates, set_at, value_at};
use palaver_types::models::ChannelId;

use super::{AppendEvent, AppendSubscription, MessageStore, StorePath, SubscriptionId};
use crate::error::StoreError;

pub struct MemoryStore {
    state: Mutex<MemoryState>,
    transact_attempts: u32,
}

#[derive(Default)]
struct MemoryState {
    logs: HashMap<ChannelId, BTreeMap<String, StoredEntry>>,
    subscribers: HashMap<SubscriptionId, Subscriber>,
    faults: Faults,
}

struct StoredEntry {
    fields: Fields,
    revision: u64,
}

struct Subscriber {
    channel_id: ChannelId,
    tx: mpsc::UnboundedSender<AppendEvent>,
}

#[derive(Default)]
struct Faults {
    unreachable: bool,
    forced_conflicts: u32,
    ambiguous_commits: u32,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_transact_attempts(25)
    }

    pub fn with_transact_attempts(attempts: u32) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            transact_attempts: attempts.max(1),
        }
    }

    /// While set, every operation fails with [`StoreError::Unreachable`].
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().faults.unreachable = unreachable;
    }

    /// The next `count` compare-and-set steps lose to a phantom writer.
    pub fn force_conflicts(&self, count: u32) {
        self.lock().faults.forced_conflicts = count;
    }

    /// The next `count` transactions commit but report an unknown outcome.
    pub fn lose_commit_acks(&self, count: u32) {
        self.lock().faults.ambiguous_commits = count;
    }

    /// End every live subscription as if the transport had died for good.
    pub fn drop_subscriptions(&self, reason: &str) {
        let subscribers = std::mem::take(&mut self.lock().subscribers);
        for (_, sub) in subscribers {
            let _ = sub.tx.send(AppendEvent::Dropped {
                reason: reason.to_string(),
            });
        }
    }

    pub fn subscriber_count(&self, channel_id: &ChannelId) -> usize {
        self.lock()
            .subscribers
            .values()
            .filter(|s| &s.channel_id == channel_id && !s.tx.is_closed())
            .count()
    }

    pub fn entry_count(&self, channel_id: &ChannelId) -> usize {
        self.lock().logs.get(channel_id).map_or(0, BTreeMap::len)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reachable(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        let state = self.lock();
        if state.faults.unreachable {
            return Err(StoreError::Unreachable("memory store is offline".into()));
        }
        Ok(state)
    }
}

impl MessageStore for MemoryStore {
    async fn range_read(
        &self,
        channel_id: &ChannelId,
        bound: Option<&str>,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let state = self.reachable()?;
        let Some(log) = state.logs.get(channel_id) else {
            return Ok(vec![]);
        };
        let to_entry = |(key, stored): (&String, &StoredEntry)| LogEntry::new(key.as_str(), stored.fields.clone());

        let entries = match direction {
            Direction::Backward => {
                let upper = bound.map_or(Bound::Unbounded, Bound::Included);
                let mut entries: Vec<LogEntry> = log
                    .range::<str, _>((Bound::Unbounded, upper))
                    .rev()
                    .take(limit)
                    .map(to_entry)
                    .collect();
                entries.reverse();
                entries
            }
            Direction::Forward => {
                let lower = bound.map_or(Bound::Unbounded, Bound::Included);
                log.range::<str, _>((lower, Bound::Unbounded))
                    .take(limit)
                    .map(to_entry)
                    .collect()
            }
        };
        Ok(entries)
    }

    async fn point_read(&self, channel_id: &ChannelId, key: &str) -> Result<Option<LogEntry>, StoreError> {
        let state = self.reachable()?;
        Ok(state
            .logs
            .get(channel_id)
            .and_then(|log| log.get(key))
            .map(|stored| LogEntry::new(key, stored.fields.clone())))
    }

    async fn write(&self, channel_id: &ChannelId, key: &str, fields: Fields) -> Result<(), StoreError> {
        let mut state = self.reachable()?;
        let log = state.logs.entry(channel_id.clone()).or_default();
        let created = !log.contains_key(key);
        let stored = log.entry(key.to_string()).or_insert_with(|| StoredEntry {
            fields: Fields::new(),
            revision: 0,
        });
        apply_updates(&mut stored.fields, &fields);
        stored.revision += 1;

        if created {
            let entry = LogEntry::new(key, stored.fields.clone());
            state.subscribers.retain(|_, sub| {
                if &sub.channel_id != channel_id {
                    return true;
                }
                sub.tx.send(AppendEvent::Appended(entry.clone())).is_ok()
            });
        }
        Ok(())
    }

    async fn subscribe_append(&self, channel_id: &ChannelId) -> Result<AppendSubscription, StoreError> {
        let mut state = self.reachable()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        state.subscribers.insert(
            id,
            Subscriber {
                channel_id: channel_id.clone(),
                tx,
            },
        );
        debug!("Subscription {} attached to {}", id, channel_id);
        Ok(AppendSubscription { id, events: rx })
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        if self.lock().subscribers.remove(&id).is_some() {
            debug!("Subscription {} detached", id);
        }
    }

    async fn transact<F>(&self, path: &StorePath, update: F) -> Result<Value, StoreError>
    where
        F: Fn(Option<&Value>) -> Value + Send + Sync + 'static,
    {
        let missing = || StoreError::NotFound(path.to_string());

        for attempt in 1..=self.transact_attempts {
            let (current, revision) = {
                let state = self.reachable()?;
                let stored = state
                    .logs
                    .get(&path.channel_id)
                    .and_then(|log| log.get(&path.key))
                    .ok_or_else(missing)?;
                (value_at(&stored.fields, &path.path).cloned(), stored.revision)
            };

            let next = update(current.as_ref());

            // Let competing transactions interleave between read and commit.
            tokio::task::yield_now().await;

            let mut state = self.reachable()?;
            if state.faults.forced_conflicts > 0 {
                state.faults.forced_conflicts -= 1;
                debug!("Transaction on {} lost attempt {} to a forced conflict", path, attempt);
                continue;
            }
            let stored = state
                .logs
                .get_mut(&path.channel_id)
                .and_then(|log| log.get_mut(&path.key))
                .ok_or_else(missing)?;
            if stored.revision != revision {
                debug!("Transaction on {} conflicted on attempt {}", path, attempt);
                continue;
            }

            set_at(&mut stored.fields, &path.path, next.clone());
            stored.revision += 1;

            if state.faults.ambiguous_commits > 0 {
                state.faults.ambiguous_commits -= 1;
                return Err(StoreError::Ambiguous("commit acknowledgement lost".into()));
            }
            return Ok(next);
        }

        Err(StoreError::TransactionAborted {
            attempts: self.transact_attempts,
        })
    }
}
