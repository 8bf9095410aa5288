use serde::{Deserialize, Serialize};

use crate::fields::LogEntry;

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// The connection now receives appends for this channel
    Subscribed { channel_id: String },

    /// The connection no longer receives appends for this channel
    Unsubscribed { channel_id: String },

    /// A new entry was appended to a channel log
    EntryAppended { channel_id: String, entry: LogEntry },
}

impl GatewayEvent {
    /// Returns the channel this event is scoped to.
    pub fn channel_id(&self) -> &str {
        match self {
            Self::Subscribed { channel_id }
            | Self::Unsubscribed { channel_id }
            | Self::EntryAppended { channel_id, .. } => channel_id,
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Start receiving appends for a channel. The server answers with
    /// `Subscribed`; only entries appended after that are pushed.
    Subscribe { channel_id: String },

    /// Stop receiving appends for a channel
    Unsubscribe { channel_id: String },
}
