use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::fields::{self, Fields, LogEntry};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Log key of a message. Lexicographic order equals creation order.
    MessageId
);
string_id!(ChannelId);
string_id!(UserId);

/// Why a log entry could not be decoded into a [`Message`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EntryError {
    #[error("entry {key} is missing required field `{field}`")]
    MissingField { key: String, field: &'static str },

    #[error("entry {key} has an invalid `{field}` field")]
    InvalidField { key: String, field: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdminKind {
    ChannelCreation,
    MemberAdded,
    MemberLeft,
    ChannelNameChanged,
}

impl AdminKind {
    pub fn title(&self) -> &'static str {
        match self {
            Self::ChannelCreation => "channelCreation",
            Self::MemberAdded => "memberAdded",
            Self::MemberLeft => "memberLeft",
            Self::ChannelNameChanged => "channelNameChanged",
        }
    }

    pub fn from_title(title: &str) -> Option<Self> {
        match title {
            "channelCreation" => Some(Self::ChannelCreation),
            "memberAdded" => Some(Self::MemberAdded),
            "memberLeft" => Some(Self::MemberLeft),
            "channelNameChanged" => Some(Self::ChannelNameChanged),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Text,
    Photo,
    Video,
    Voice,
    Admin(AdminKind),
}

impl MessageKind {
    /// Value stored in the `type` field.
    pub fn title(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Voice => "audio",
            Self::Admin(_) => "admin",
        }
    }

    /// Unknown titles decode as text, matching what older clients wrote.
    fn from_fields(key: &str, entry: &Fields) -> Result<Self, EntryError> {
        let title = entry.get(fields::TYPE).and_then(Value::as_str).unwrap_or("text");
        let kind = match title {
            "photo" => Self::Photo,
            "video" => Self::Video,
            "audio" => Self::Voice,
            "admin" => {
                let admin = entry
                    .get(fields::ADMIN_TYPE)
                    .and_then(Value::as_str)
                    .and_then(AdminKind::from_title)
                    .ok_or(EntryError::InvalidField {
                        key: key.to_string(),
                        field: fields::ADMIN_TYPE,
                    })?;
                Self::Admin(admin)
            }
            _ => Self::Text,
        };
        Ok(kind)
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin(_))
    }
}

/// Optional media descriptors. Photo/video carry a thumbnail, video a
/// stream URL, voice an audio URL and duration in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Media {
    pub thumbnail_url: Option<String>,
    pub thumbnail_width: Option<f64>,
    pub thumbnail_height: Option<f64>,
    pub video_url: Option<String>,
    pub audio_url: Option<String>,
    pub audio_duration: Option<f64>,
}

impl Media {
    fn from_fields(entry: &Fields) -> Self {
        let string = |name: &str| entry.get(name).and_then(Value::as_str).map(str::to_string);
        let number = |name: &str| entry.get(name).and_then(Value::as_f64);
        Self {
            thumbnail_url: string(fields::THUMBNAIL_URL),
            thumbnail_width: number(fields::THUMBNAIL_WIDTH),
            thumbnail_height: number(fields::THUMBNAIL_HEIGHT),
            video_url: string(fields::VIDEO_URL),
            audio_url: string(fields::AUDIO_URL),
            audio_duration: number(fields::AUDIO_DURATION),
        }
    }

    fn write_fields(&self, out: &mut Fields) {
        if let Some(url) = &self.thumbnail_url {
            out.insert(fields::THUMBNAIL_URL.into(), json!(url));
        }
        if let Some(width) = self.thumbnail_width {
            out.insert(fields::THUMBNAIL_WIDTH.into(), json!(width));
        }
        if let Some(height) = self.thumbnail_height {
            out.insert(fields::THUMBNAIL_HEIGHT.into(), json!(height));
        }
        if let Some(url) = &self.video_url {
            out.insert(fields::VIDEO_URL.into(), json!(url));
        }
        if let Some(url) = &self.audio_url {
            out.insert(fields::AUDIO_URL.into(), json!(url));
        }
        if let Some(duration) = self.audio_duration {
            out.insert(fields::AUDIO_DURATION.into(), json!(duration));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub text: String,
    pub media: Media,
    pub created_at: DateTime<Utc>,
    /// emoji -> count
    pub reactions: HashMap<String, u64>,
    /// user -> the single emoji that user picked last
    pub user_reactions: HashMap<UserId, String>,
}

impl Message {
    /// Decode a log entry. `ownerUid` and `timeStamp` are required; everything
    /// else falls back to an empty value.
    pub fn from_entry(channel_id: &ChannelId, entry: &LogEntry) -> Result<Self, EntryError> {
        let key = entry.key.as_str();
        let f = &entry.fields;

        let sender_id = f
            .get(fields::OWNER_UID)
            .and_then(Value::as_str)
            .ok_or(EntryError::MissingField {
                key: key.to_string(),
                field: fields::OWNER_UID,
            })?;

        let seconds = f
            .get(fields::TIMESTAMP)
            .ok_or(EntryError::MissingField {
                key: key.to_string(),
                field: fields::TIMESTAMP,
            })?
            .as_f64()
            .ok_or(EntryError::InvalidField {
                key: key.to_string(),
                field: fields::TIMESTAMP,
            })?;
        let created_at = timestamp_from_seconds(seconds).ok_or(EntryError::InvalidField {
            key: key.to_string(),
            field: fields::TIMESTAMP,
        })?;

        let reactions = f
            .get(fields::REACTIONS)
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(emoji, count)| Some((emoji.clone(), count.as_u64()?)))
                    .collect()
            })
            .unwrap_or_default();

        let user_reactions = f
            .get(fields::USER_REACTIONS)
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(user, emoji)| {
                        Some((UserId::new(user.as_str()), emoji.as_str()?.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            id: MessageId::new(key),
            channel_id: channel_id.clone(),
            sender_id: UserId::new(sender_id),
            kind: MessageKind::from_fields(key, f)?,
            text: f
                .get(fields::TEXT)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            media: Media::from_fields(f),
            created_at,
            reactions,
            user_reactions,
        })
    }

    /// Fields written when the message is first appended. Reaction maps are
    /// owned by the reaction protocol and never written here.
    pub fn to_fields(&self) -> Fields {
        let mut out = Fields::new();
        out.insert(fields::TEXT.into(), json!(self.text));
        out.insert(fields::TYPE.into(), json!(self.kind.title()));
        if let MessageKind::Admin(admin) = self.kind {
            out.insert(fields::ADMIN_TYPE.into(), json!(admin.title()));
        }
        out.insert(
            fields::TIMESTAMP.into(),
            json!(timestamp_to_seconds(&self.created_at)),
        );
        out.insert(fields::OWNER_UID.into(), json!(self.sender_id.as_str()));
        self.media.write_fields(&mut out);
        out
    }

    pub fn reaction_count(&self, emoji: &str) -> u64 {
        self.reactions.get(emoji).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub name: Option<String>,
    pub member_ids: Vec<UserId>,
    pub created_at: DateTime<Utc>,
    pub last_message: String,
    pub last_message_at: DateTime<Utc>,
    pub last_message_kind: String,
}

impl Channel {
    pub fn new(id: impl Into<ChannelId>, member_ids: Vec<UserId>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            name: None,
            member_ids,
            created_at,
            last_message: String::new(),
            last_message_at: created_at,
            last_message_kind: MessageKind::Text.title().to_string(),
        }
    }

    pub fn is_group(&self) -> bool {
        self.member_ids.len() > 2
    }

    /// Path updates for the denormalized preview shown in channel lists.
    pub fn preview_fields(text: &str, kind: MessageKind, at: &DateTime<Utc>) -> Fields {
        let mut out = Fields::new();
        out.insert(fields::LAST_MESSAGE.into(), json!(text));
        out.insert(
            fields::LAST_MESSAGE_TIMESTAMP.into(),
            json!(timestamp_to_seconds(at)),
        );
        out.insert(fields::LAST_MESSAGE_TYPE.into(), json!(kind.title()));
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
}

pub fn timestamp_to_seconds(at: &DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

pub fn timestamp_from_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    DateTime::from_timestamp_millis((seconds * 1000.0).round() as i64)
}
