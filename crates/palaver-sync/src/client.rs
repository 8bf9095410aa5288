use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use tracing::{debug, info, warn};

use palaver_types::fields::CHANNELS_LOG;
use palaver_types::ids::PushIdGenerator;
use palaver_types::models::{Channel, ChannelId, Media, Message, MessageId, MessageKind, UserProfile};

use crate::channel::{self, TimelineHandle};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::session::{SessionContext, SessionObserver};
use crate::store::MessageStore;

/// A photo, video or voice message.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaMessage {
    pub kind: MessageKind,
    /// Caption, or the preview text for the channel list.
    pub text: String,
    pub media: Media,
}

/// Entry point for the presentation layer: opens channels and sends
/// messages on behalf of the logged-in user.
pub struct SyncClient<S> {
    store: Arc<S>,
    session: SessionContext,
    config: SyncConfig,
    channels: Mutex<HashMap<ChannelId, TimelineHandle>>,
    next_epoch: AtomicU64,
    ids: Mutex<PushIdGenerator>,
}

impl<S: MessageStore> SyncClient<S> {
    /// The client closes every open channel when the session logs out.
    pub fn new(store: Arc<S>, session: SessionContext, config: SyncConfig) -> Arc<Self> {
        let client = Arc::new(Self {
            store,
            session: session.clone(),
            config,
            channels: Mutex::new(HashMap::new()),
            next_epoch: AtomicU64::new(1),
            ids: Mutex::new(PushIdGenerator::new()),
        });
        let observer: Weak<dyn SessionObserver> = Arc::downgrade(&client) as Weak<dyn SessionObserver>;
        session.add_observer(observer);
        client
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Open `channel` and start loading it. Opening a channel that is
    /// already open returns its existing handle. Must be called from within
    /// a Tokio runtime.
    pub fn open_channel(&self, channel: &Channel) -> Result<TimelineHandle, SyncError> {
        self.session.require_user()?;

        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = channels.get(&channel.id) {
            if !handle.is_closed() {
                debug!("Channel {} already open", channel.id);
                return Ok(handle.clone());
            }
        }

        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let handle = channel::open(channel, epoch, self.store.clone(), self.session.clone(), &self.config);
        channels.insert(channel.id.clone(), handle.clone());
        Ok(handle)
    }

    pub async fn close_channel(&self, channel_id: &ChannelId) {
        let handle = self
            .channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(channel_id);
        if let Some(handle) = handle {
            handle.close().await;
        }
    }

    pub fn open_channels(&self) -> Vec<ChannelId> {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<ChannelId> = channels
            .iter()
            .filter(|(_, handle)| !handle.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn send_text(&self, channel: &Channel, text: &str) -> Result<MessageId, SyncError> {
        if text.trim().is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        self.send(channel, MessageKind::Text, text, Media::default()).await
    }

    pub async fn send_media(&self, channel: &Channel, message: MediaMessage) -> Result<MessageId, SyncError> {
        if !matches!(message.kind, MessageKind::Photo | MessageKind::Video | MessageKind::Voice) {
            return Err(SyncError::InvalidMedia(message.kind.title().to_string()));
        }
        self.send(channel, message.kind, &message.text, message.media).await
    }

    /// Writes the message, then the channel preview. The message reaches
    /// open timelines through their live tails.
    async fn send(&self, channel: &Channel, kind: MessageKind, text: &str, media: Media) -> Result<MessageId, SyncError> {
        let user = self.session.require_user()?;
        let now = Utc::now();
        let id = self.ids.lock().unwrap_or_else(|e| e.into_inner()).next_id(now);

        let message = Message {
            id: id.clone(),
            channel_id: channel.id.clone(),
            sender_id: user.id,
            kind,
            text: text.to_string(),
            media,
            created_at: now,
            reactions: Default::default(),
            user_reactions: Default::default(),
        };
        self.store
            .write(&channel.id, id.as_str(), message.to_fields())
            .await
            .map_err(SyncError::SendFailed)?;
        debug!("Sent {} to {}", id, channel.id);

        let preview = Channel::preview_fields(text, kind, &now);
        if let Err(e) = self
            .store
            .write(&ChannelId::new(CHANNELS_LOG), channel.id.as_str(), preview)
            .await
        {
            warn!("Updating the preview of {} failed: {}", channel.id, e);
        }
        Ok(id)
    }

    fn close_all(&self) {
        let channels = std::mem::take(&mut *self.channels.lock().unwrap_or_else(|e| e.into_inner()));
        if !channels.is_empty() {
            info!("Closing {} open channels", channels.len());
        }
        for handle in channels.into_values() {
            handle.close_now();
        }
    }
}

impl<S: MessageStore> SessionObserver for SyncClient<S> {
    fn on_logged_in(&self, user: &UserProfile) {
        debug!("Sync client ready for {}", user.id);
    }

    fn on_logged_out(&self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use palaver_types::api::Direction;
    use palaver_types::models::UserId;

    use super::*;
    use crate::store::memory::MemoryStore;

    fn alice() -> UserProfile {
        UserProfile {
            id: UserId::new("alice"),
            username: "Alice".into(),
        }
    }

    fn channel(id: &str) -> Channel {
        Channel::new(
            id,
            vec![UserId::new("alice"), UserId::new("bob")],
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        )
    }

    fn client(session: SessionContext) -> (Arc<MemoryStore>, Arc<SyncClient<MemoryStore>>) {
        let store = Arc::new(MemoryStore::new());
        let client = SyncClient::new(store.clone(), session, SyncConfig::default());
        (store, client)
    }

    #[tokio::test]
    async fn opening_requires_a_user() {
        let session = SessionContext::new();
        let (_, client) = client(session.clone());
        assert_eq!(client.open_channel(&channel("general")).unwrap_err(), SyncError::NotAuthenticated);
        assert!(client.open_channels().is_empty());

        session.log_in(alice());
        client.open_channel(&channel("general")).unwrap();
        assert_eq!(client.open_channels(), [ChannelId::new("general")]);
    }

    #[tokio::test]
    async fn open_channels_are_listed_in_order() {
        let (_, client) = client(SessionContext::logged_in(alice()));
        for id in ["random", "general", "dev"] {
            client.open_channel(&channel(id)).unwrap();
        }
        let first = client.open_channel(&channel("dev")).unwrap();
        assert_eq!(first.epoch(), 3, "reopening returns the existing handle");

        client.close_channel(&ChannelId::new("random")).await;
        assert_eq!(client.open_channels(), [ChannelId::new("dev"), ChannelId::new("general")]);
    }

    #[tokio::test]
    async fn sends_validate_before_writing() {
        let (store, client) = client(SessionContext::logged_in(alice()));
        let general = channel("general");

        assert_eq!(client.send_text(&general, "  ").await, Err(SyncError::EmptyMessage));
        let not_media = MediaMessage {
            kind: MessageKind::Text,
            text: "caption".into(),
            media: Media::default(),
        };
        assert_eq!(
            client.send_media(&general, not_media).await,
            Err(SyncError::InvalidMedia("text".into()))
        );
        let written = store.range_read(&general.id, None, Direction::Forward, 10).await.unwrap();
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn sending_updates_the_channel_preview() {
        let (store, client) = client(SessionContext::logged_in(alice()));
        let general = channel("general");

        let id = client.send_text(&general, "hello").await.unwrap();
        let entry = store.point_read(&general.id, id.as_str()).await.unwrap().unwrap();
        let sent = Message::from_entry(&general.id, &entry).unwrap();
        assert_eq!(sent.sender_id, UserId::new("alice"));
        assert_eq!(sent.text, "hello");

        let preview = store
            .point_read(&ChannelId::new(CHANNELS_LOG), "general")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(preview.fields[palaver_types::fields::LAST_MESSAGE], "hello");
    }
}
