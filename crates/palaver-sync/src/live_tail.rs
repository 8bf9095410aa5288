//! Live delivery of appended messages for one open channel.
//!
//! ```text
//! Idle --begin (seeded)--> Subscribing --activate--> Active
//!   ^                           |                      |
//!   +------ failed/dropped -----+----------------------+
//! any --close--> Closed
//! ```
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use palaver_types::api::Direction;
use palaver_types::fields::LogEntry;
use palaver_types::models::{ChannelId, MessageId};

use crate::error::StoreError;
use crate::store::{AppendEvent, MessageStore, SubscriptionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveTailState {
    Idle,
    Subscribing,
    Active,
    Closed,
}

impl fmt::Display for LiveTailState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Subscribing => "subscribing",
            Self::Active => "active",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("live tail cannot go from {from} to {to}")]
pub struct TransitionError {
    pub from: LiveTailState,
    pub to: LiveTailState,
}

#[derive(Debug)]
pub struct LiveTail {
    channel_id: ChannelId,
    state: LiveTailState,
    subscription: Option<SubscriptionId>,
}

impl LiveTail {
    pub fn new(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            state: LiveTailState::Idle,
            subscription: None,
        }
    }

    pub fn state(&self) -> LiveTailState {
        self.state
    }

    pub fn subscription(&self) -> Option<SubscriptionId> {
        self.subscription
    }

    /// Deliveries are only applied while the subscription is acknowledged.
    pub fn accepts_deliveries(&self) -> bool {
        self.state == LiveTailState::Active
    }

    /// Subscribing is only allowed once the initial page is in the timeline.
    pub fn begin(&mut self, seeded: bool) -> Result<(), TransitionError> {
        if self.state != LiveTailState::Idle || !seeded {
            return Err(self.rejected(LiveTailState::Subscribing));
        }
        self.state = LiveTailState::Subscribing;
        Ok(())
    }

    pub fn activate(&mut self, subscription: SubscriptionId) -> Result<(), TransitionError> {
        if self.state != LiveTailState::Subscribing {
            return Err(self.rejected(LiveTailState::Active));
        }
        info!("Live tail of {} active ({})", self.channel_id, subscription);
        self.state = LiveTailState::Active;
        self.subscription = Some(subscription);
        Ok(())
    }

    /// Back to idle after the subscription failed to open or was dropped.
    /// Returns the subscription that was in place, if any.
    pub fn reset(&mut self) -> Result<Option<SubscriptionId>, TransitionError> {
        match self.state {
            LiveTailState::Subscribing | LiveTailState::Active => {
                self.state = LiveTailState::Idle;
                Ok(self.subscription.take())
            }
            _ => Err(self.rejected(LiveTailState::Idle)),
        }
    }

    /// Terminal. Returns the subscription to tear down, if any.
    pub fn close(&mut self) -> Option<SubscriptionId> {
        if self.state != LiveTailState::Closed {
            debug!("Live tail of {} closed from {}", self.channel_id, self.state);
        }
        self.state = LiveTailState::Closed;
        self.subscription.take()
    }

    fn rejected(&self, to: LiveTailState) -> TransitionError {
        TransitionError { from: self.state, to }
    }
}

/// What the forwarding task reports to its channel.
#[derive(Debug)]
pub enum LiveSignal {
    Attached(SubscriptionId),
    AttachFailed(StoreError),
    Event(AppendEvent),
}

/// Entries read per catch-up request.
const CATCH_UP_BATCH: usize = 100;

/// Open an append subscription and forward everything it yields, in order,
/// to the channel worker behind `tx`.
///
/// Once the subscription is in place the log is read forward from `since`
/// (the newest loaded message, inclusive) and those entries are forwarded
/// ahead of anything the subscription delivered meanwhile, so appends made
/// between the initial page and the subscription are not lost. The worker
/// drops the overlap as duplicates. The task ends when the subscription is
/// dropped or the worker goes away, detaching from the store in the latter
/// case.
pub fn spawn_forwarder<S, T, W>(
    store: Arc<S>,
    channel_id: ChannelId,
    since: Option<MessageId>,
    tx: mpsc::WeakUnboundedSender<T>,
    wrap: W,
) -> JoinHandle<()>
where
    S: MessageStore,
    T: Send + 'static,
    W: Fn(LiveSignal) -> T + Send + 'static,
{
    tokio::spawn(async move {
        let forward = move |signal: LiveSignal| match tx.upgrade() {
            Some(tx) => tx.send(wrap(signal)).is_ok(),
            None => false,
        };

        let mut subscription = match store.subscribe_append(&channel_id).await {
            Ok(subscription) => subscription,
            Err(e) => {
                forward(LiveSignal::AttachFailed(e));
                return;
            }
        };
        let missed = match catch_up(&*store, &channel_id, since).await {
            Ok(missed) => missed,
            Err(e) => {
                store.unsubscribe(subscription.id).await;
                forward(LiveSignal::AttachFailed(e));
                return;
            }
        };
        if !forward(LiveSignal::Attached(subscription.id)) {
            store.unsubscribe(subscription.id).await;
            return;
        }
        if !missed.is_empty() {
            debug!("Catching {} up with {} entries", channel_id, missed.len());
        }
        for entry in missed {
            if !forward(LiveSignal::Event(AppendEvent::Appended(entry))) {
                store.unsubscribe(subscription.id).await;
                return;
            }
        }

        while let Some(event) = subscription.events.recv().await {
            let dropped = matches!(event, AppendEvent::Dropped { .. });
            if !forward(LiveSignal::Event(event)) {
                debug!("Channel {} went away, detaching", channel_id);
                store.unsubscribe(subscription.id).await;
                return;
            }
            if dropped {
                return;
            }
        }
    })
}

/// Every entry after `since`, oldest first. Without `since` the whole log.
async fn catch_up<S: MessageStore>(
    store: &S,
    channel_id: &ChannelId,
    since: Option<MessageId>,
) -> Result<Vec<LogEntry>, StoreError> {
    let mut bound = since.map(|id| id.as_str().to_string());
    let mut missed = Vec::new();
    loop {
        let batch = store
            .range_read(channel_id, bound.as_deref(), Direction::Forward, CATCH_UP_BATCH)
            .await?;
        let full = batch.len() == CATCH_UP_BATCH;
        let fresh: Vec<LogEntry> = batch
            .into_iter()
            .filter(|entry| Some(entry.key.as_str()) != bound.as_deref())
            .collect();
        let Some(last) = fresh.last() else {
            return Ok(missed);
        };
        bound = Some(last.key.clone());
        missed.extend(fresh);
        if !full {
            return Ok(missed);
        }
    }
}
