//! Field names of log entries. Collaborators writing entries must use these
//! exact keys so clients can decode them.
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type Fields = serde_json::Map<String, Value>;

// -- Message entry fields --

pub const TEXT: &str = "text";
pub const TYPE: &str = "type";
pub const ADMIN_TYPE: &str = "adminType";
pub const TIMESTAMP: &str = "timeStamp";
pub const OWNER_UID: &str = "ownerUid";
pub const THUMBNAIL_URL: &str = "thumbnailUrl";
pub const THUMBNAIL_WIDTH: &str = "thumbnailWidth";
pub const THUMBNAIL_HEIGHT: &str = "thumbnailHeight";
pub const VIDEO_URL: &str = "videoURL";
pub const AUDIO_URL: &str = "audioURL";
pub const AUDIO_DURATION: &str = "audioDuration";
pub const REACTIONS: &str = "reactions";
pub const USER_REACTIONS: &str = "userReactions";

// -- Channel entry fields --

/// Reserved log holding one entry per channel (keyed by channel id).
pub const CHANNELS_LOG: &str = "channels";

pub const LAST_MESSAGE: &str = "lastMessage";
pub const LAST_MESSAGE_TIMESTAMP: &str = "lastMessageTimeStamp";
pub const LAST_MESSAGE_TYPE: &str = "lastMessageType";

/// One entry of a channel's append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub key: String,
    pub fields: Fields,
}

impl LogEntry {
    pub fn new(key: impl Into<String>, fields: Fields) -> Self {
        Self {
            key: key.into(),
            fields,
        }
    }
}

/// Join path segments with `/`.
pub fn join_path(segments: &[&str]) -> String {
    segments.join("/")
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Look up a nested value by `/`-separated path.
pub fn value_at<'a>(fields: &'a Fields, path: &str) -> Option<&'a Value> {
    let mut segments = split_path(path);
    let mut current = fields.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Set a nested value by path, creating intermediate objects and replacing
/// non-object intermediates. A `null` value removes the addressed field.
pub fn set_at(fields: &mut Fields, path: &str, value: Value) {
    let segments: Vec<&str> = split_path(path).collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    let mut current = fields;
    for segment in parents {
        let slot = current
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Fields::new()));
        if !slot.is_object() {
            *slot = Value::Object(Fields::new());
        }
        let Value::Object(map) = slot else {
            return;
        };
        current = map;
    }

    if value.is_null() {
        current.remove(*last);
    } else {
        current.insert((*last).to_string(), value);
    }
}

/// Apply a batch of path updates. Siblings of updated paths are preserved.
pub fn apply_updates(fields: &mut Fields, updates: &Fields) {
    for (path, value) in updates {
        set_at(fields, path, value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn nested_update_keeps_siblings() {
        let mut fields = obj(json!({
            "text": "hi",
            "userReactions": { "u1": "👍" }
        }));

        let updates = obj(json!({ "userReactions/u2": "❤️" }));
        apply_updates(&mut fields, &updates);

        assert_eq!(value_at(&fields, "userReactions/u1"), Some(&json!("👍")));
        assert_eq!(value_at(&fields, "userReactions/u2"), Some(&json!("❤️")));
        assert_eq!(value_at(&fields, "text"), Some(&json!("hi")));
    }

    #[test]
    fn null_removes_field() {
        let mut fields = obj(json!({ "reactions": { "👍": 2, "❤️": 1 } }));
        set_at(&mut fields, "reactions/👍", Value::Null);

        assert_eq!(value_at(&fields, "reactions/👍"), None);
        assert_eq!(value_at(&fields, "reactions/❤️"), Some(&json!(1)));
    }

    #[test]
    fn scalar_intermediate_is_replaced() {
        let mut fields = obj(json!({ "reactions": 5 }));
        set_at(&mut fields, "reactions/👍", json!(1));
        assert_eq!(value_at(&fields, "reactions/👍"), Some(&json!(1)));
    }

    #[test]
    fn empty_path_is_ignored() {
        let mut fields = Fields::new();
        set_at(&mut fields, "//", json!(1));
        assert!(fields.is_empty());
        assert_eq!(value_at(&fields, ""), None);
    }
}
