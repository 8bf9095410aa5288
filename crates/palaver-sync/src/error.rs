use thiserror::Error;

use palaver_types::models::{EntryError, MessageId};

use crate::timeline::TimelineError;

/// Failures reported by a [`MessageStore`](crate::store::MessageStore).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// The request never reached the store.
    #[error("store unreachable: {0}")]
    Unreachable(String),

    /// The request may have been applied; its outcome is unknown.
    #[error("store outcome unknown: {0}")]
    Ambiguous(String),

    #[error("transaction aborted after {attempts} attempts")]
    TransactionAborted { attempts: u32 },

    #[error("no entry at {0}")]
    NotFound(String),

    #[error("malformed store response: {0}")]
    Malformed(String),

    #[error("store rejected the request: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether a failed write is known not to have been applied.
    /// `None` when the outcome cannot be known.
    pub fn committed(&self) -> Option<bool> {
        match self {
            Self::Ambiguous(_) => None,
            _ => Some(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    /// A page or boundary read failed. Retrying with the same cursor is safe.
    #[error("fetch failed: {0}")]
    FetchFailed(#[source] StoreError),

    #[error("live subscription dropped: {0}")]
    SubscriptionDropped(String),

    /// `committed` is `Some(false)` when the counter was definitely not
    /// incremented and `None` when the outcome is unknown.
    #[error("reaction failed (committed: {committed:?}): {source}")]
    ReactionFailed {
        committed: Option<bool>,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    MalformedEntry(#[from] EntryError),

    #[error("send failed: {0}")]
    SendFailed(#[source] StoreError),

    #[error("a page request is already in flight")]
    PaginationInFlight,

    #[error("channel is closed")]
    ChannelClosed,

    #[error("no user is logged in")]
    NotAuthenticated,

    #[error(transparent)]
    Timeline(#[from] TimelineError),

    #[error("message text is empty")]
    EmptyMessage,

    #[error("{0} is not a media kind")]
    InvalidMedia(String),

    #[error("invalid reaction {0:?}")]
    InvalidReaction(String),

    #[error("invalid user id {0:?}")]
    InvalidUser(String),

    #[error("message {0} is not loaded in this timeline")]
    UnknownMessage(MessageId),
}

impl SyncError {
    /// Errors the caller may resolve by trying the same operation again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::FetchFailed(_) | Self::SendFailed(_) | Self::PaginationInFlight => true,
            Self::ReactionFailed { committed, .. } => *committed == Some(false),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguous_failures_are_not_retryable_reactions() {
        let unknown = SyncError::ReactionFailed {
            committed: StoreError::Ambiguous("timeout".into()).committed(),
            source: StoreError::Ambiguous("timeout".into()),
        };
        assert!(!unknown.is_retryable());

        let aborted = StoreError::TransactionAborted { attempts: 3 };
        let definite = SyncError::ReactionFailed {
            committed: aborted.committed(),
            source: aborted,
        };
        assert!(definite.is_retryable());
    }
}
