//! Emoji reactions.
//!
//! A reaction is two writes: a transactional increment of the per-emoji
//! counter, then a plain write of the user's choice under `userReactions`.
//! Choosing a different emoji later records the new one without
//! decrementing the old counter, so counts only ever grow.
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, warn};

use palaver_types::fields::{self, Fields};
use palaver_types::models::{ChannelId, MessageId, UserId};

use crate::error::SyncError;
use crate::session::SessionContext;
use crate::store::{self, MessageStore, StorePath};

pub struct ReactionAggregator<S> {
    store: Arc<S>,
    session: SessionContext,
}

impl<S> Clone for ReactionAggregator<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            session: self.session.clone(),
        }
    }
}

/// Emoji are used as path segments.
pub fn validate_emoji(emoji: &str) -> Result<(), SyncError> {
    if emoji.trim().is_empty() || emoji.contains('/') || emoji.len() > 64 {
        return Err(SyncError::InvalidReaction(emoji.to_string()));
    }
    Ok(())
}

/// User ids name the key under `userReactions`.
pub fn validate_user(user_id: &UserId) -> Result<(), SyncError> {
    let id = user_id.as_str();
    if id.trim().is_empty() || id.contains('/') {
        return Err(SyncError::InvalidUser(id.to_string()));
    }
    Ok(())
}

impl<S: MessageStore> ReactionAggregator<S> {
    pub fn new(store: Arc<S>, session: SessionContext) -> Self {
        Self { store, session }
    }

    /// Count `user_id`'s `emoji` on a message and return the counter after
    /// the increment.
    pub async fn add_reaction(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        emoji: &str,
        user_id: &UserId,
    ) -> Result<u64, SyncError> {
        self.session.require_user()?;
        validate_emoji(emoji)?;
        validate_user(user_id)?;

        let path = StorePath::reaction_count(channel_id, message_id, emoji);
        let committed = self
            .store
            .transact(&path, store::increment)
            .await
            .map_err(|source| SyncError::ReactionFailed {
                committed: source.committed(),
                source,
            })?;
        let count = committed.as_u64().unwrap_or(0);
        debug!("{} now has {} on {}", message_id, count, path);

        let mut choice = Fields::new();
        choice.insert(
            fields::join_path(&[fields::USER_REACTIONS, user_id.as_str()]),
            json!(emoji),
        );
        if let Err(e) = self.store.write(channel_id, message_id.as_str(), choice).await {
            // The counter is already committed; the choice is best effort.
            warn!("Recording {}'s reaction on {} failed: {}", user_id, message_id, e);
        }

        Ok(count)
    }

    /// Store-side counter, for reconciliation and tests.
    pub async fn current_count(&self, channel_id: &ChannelId, message_id: &MessageId, emoji: &str) -> Result<u64, SyncError> {
        let entry = self
            .store
            .point_read(channel_id, message_id.as_str())
            .await
            .map_err(SyncError::FetchFailed)?;
        let path = fields::join_path(&[fields::REACTIONS, emoji]);
        Ok(entry
            .as_ref()
            .and_then(|entry| fields::value_at(&entry.fields, &path))
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }
}
