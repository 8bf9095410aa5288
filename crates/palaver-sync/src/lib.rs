//! Client-side timeline synchronization for Palaver channels.
//!
//! A [`SyncClient`] opens channels against any [`MessageStore`]. Each open
//! channel is driven by one worker task that owns the channel's cursor,
//! timeline and live subscription; the presentation layer talks to it
//! through a [`TimelineHandle`].
pub mod channel;
pub mod client;
pub mod config;
pub mod cursor;
pub mod error;
pub mod live_tail;
pub mod reactions;
pub mod session;
pub mod store;
pub mod timeline;

pub use channel::{ChannelStatus, PageApplied, ReactionOutcome, TimelineEvent, TimelineHandle};
pub use client::{MediaMessage, SyncClient};
pub use config::SyncConfig;
pub use error::{StoreError, SyncError};
pub use session::{SessionContext, SessionObserver};
pub use store::memory::MemoryStore;
pub use store::remote::RemoteStore;
pub use store::{AppendEvent, AppendSubscription, MessageStore, StorePath, SubscriptionId};
pub use timeline::{Timeline, TimelineError};
