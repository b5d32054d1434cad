use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, Error as DeError};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

/// Fields a partial update may never overwrite. Mirrored by the buffer's Lua mutate script.
pub const PROTECTED_FIELDS: [&str; 4] = ["id", "chat_id", "sender_id", "created_at"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Media {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub media_type: String,
    pub url: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A chat message as held in the buffer and in the durable chat record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub chat_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub media: Vec<Media>,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub reactions: Vec<Reaction>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub received: bool,
    #[serde(default)]
    pub seen: bool,
}

impl Message {
    /// Active reaction of `user_id`, if any. A participant holds at most one per message.
    pub fn reaction_by(&self, user_id: &str) -> Option<&Reaction> {
        self.reactions.iter().find(|r| r.sender_id == user_id)
    }
}

/// Client-supplied message body. Identity, sender and creation time are never read
/// from the client, so payloads carrying them are silently ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MessageInput {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(rename = "type", default)]
    pub message_type: Option<MessageType>,
    #[serde(default, deserialize_with = "lenient_opt_vec")]
    pub media: Option<Vec<Media>>,
    #[serde(default)]
    pub received: Option<bool>,
    #[serde(default)]
    pub seen: Option<bool>,
}

/// Partial update. Absent fields are left untouched; serialized form is what the
/// buffer's mutate script merges into the stored entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<Vec<Media>>,
    /// Replaces any reaction already held by the same sender.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub add_reaction: Option<Reaction>,
    /// Drops the reaction held by this sender.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_reaction_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seen: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl MessagePatch {
    pub fn received() -> Self {
        Self {
            received: Some(true),
            ..Default::default()
        }
    }

    pub fn seen() -> Self {
        Self {
            seen: Some(true),
            ..Default::default()
        }
    }

    pub fn add_reaction(reaction: Reaction) -> Self {
        Self {
            add_reaction: Some(reaction),
            ..Default::default()
        }
    }

    pub fn remove_reaction(sender_id: &str) -> Self {
        Self {
            remove_reaction_by: Some(sender_id.to_string()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.message_type.is_none()
            && self.media.is_none()
            && self.add_reaction.is_none()
            && self.remove_reaction_by.is_none()
            && self.received.is_none()
            && self.seen.is_none()
    }

    pub fn stamped(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = Some(at);
        self
    }

    /// Apply the present fields to `message`. Identity, sender and creation time are untouched.
    pub fn apply(&self, message: &mut Message) {
        if let Some(content) = &self.content {
            message.content = content.clone();
        }
        if let Some(kind) = self.message_type {
            message.message_type = kind;
        }
        if let Some(media) = &self.media {
            message.media = media.clone();
        }
        let reactor = self
            .remove_reaction_by
            .as_deref()
            .or(self.add_reaction.as_ref().map(|r| r.sender_id.as_str()));
        if let Some(reactor) = reactor {
            message.reactions.retain(|r| r.sender_id != reactor);
        }
        if let Some(reaction) = &self.add_reaction {
            message.reactions.push(reaction.clone());
        }
        if let Some(received) = self.received {
            message.received = received;
        }
        if let Some(seen) = self.seen {
            message.seen = seen;
        }
        if let Some(updated_at) = self.updated_at {
            message.updated_at = updated_at;
        }
    }
}

impl From<MessageInput> for MessagePatch {
    /// Empty strings and empty lists from a client update count as "not provided".
    fn from(input: MessageInput) -> Self {
        Self {
            content: input.content.filter(|c| !c.is_empty()),
            message_type: input.message_type,
            media: input.media.filter(|m| !m.is_empty()),
            add_reaction: None,
            remove_reaction_by: None,
            received: input.received,
            seen: input.seen,
            updated_at: None,
        }
    }
}

/// Accept a JSON array, `null`, or an empty object (Lua cjson's rendering of `[]`).
fn lenient_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = JsonValue::deserialize(deserializer)?;
    match value {
        JsonValue::Null => Ok(Vec::new()),
        JsonValue::Object(map) if map.is_empty() => Ok(Vec::new()),
        JsonValue::Array(items) => {
            serde_json::from_value(JsonValue::Array(items)).map_err(D::Error::custom)
        }
        other => Err(D::Error::custom(format!(
            "expected a list, found {}",
            other
        ))),
    }
}

fn lenient_opt_vec<'de, D, T>(deserializer: D) -> Result<Option<Vec<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    lenient_vec(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Message {
        let now = Utc::now();
        Message {
            id: "m1".into(),
            chat_id: "c1".into(),
            sender_id: "alice".into(),
            content: "hi".into(),
            message_type: MessageType::Text,
            media: vec![],
            reactions: vec![],
            created_at: now,
            updated_at: now,
            received: false,
            seen: false,
        }
    }

    #[test]
    fn decodes_cjson_empty_object_as_empty_list() {
        let raw = json!({
            "id": "m1",
            "sender_id": "alice",
            "content": "hi",
            "type": "text",
            "media": {},
            "reactions": {},
            "created_at": "2024-05-01T10:00:00Z",
            "updated_at": "2024-05-01T10:00:00Z"
        });
        let msg: Message = serde_json::from_value(raw).unwrap();
        assert!(msg.media.is_empty());
        assert!(msg.reactions.is_empty());
        assert!(!msg.seen);
    }

    #[test]
    fn rejects_scalar_where_list_expected() {
        let raw = json!({
            "id": "m1",
            "sender_id": "alice",
            "media": "nope",
            "created_at": "2024-05-01T10:00:00Z",
            "updated_at": "2024-05-01T10:00:00Z"
        });
        assert!(serde_json::from_value::<Message>(raw).is_err());
    }

    #[test]
    fn input_ignores_identity_fields() {
        let input: MessageInput = serde_json::from_value(json!({
            "id": "m1",
            "sender_id": "mallory",
            "created_at": "1999-01-01T00:00:00Z",
            "content": "edited"
        }))
        .unwrap();

        let mut msg = sample();
        let before = msg.clone();
        MessagePatch::from(input).apply(&mut msg);

        assert_eq!(msg.content, "edited");
        assert_eq!(msg.id, before.id);
        assert_eq!(msg.sender_id, before.sender_id);
        assert_eq!(msg.created_at, before.created_at);
    }

    #[test]
    fn empty_content_is_not_applied() {
        let input = MessageInput {
            content: Some(String::new()),
            seen: Some(true),
            ..Default::default()
        };
        let mut msg = sample();
        MessagePatch::from(input).apply(&mut msg);
        assert_eq!(msg.content, "hi");
        assert!(msg.seen);
    }

    #[test]
    fn reaction_patch_keeps_one_per_sender() {
        let mut msg = sample();
        let reaction = |sender: &str, content: &str| Reaction {
            id: format!("{sender}-{content}"),
            sender_id: sender.into(),
            content: content.into(),
            created_at: Utc::now(),
        };

        MessagePatch::add_reaction(reaction("bob", "👍")).apply(&mut msg);
        MessagePatch::add_reaction(reaction("carol", "🔥")).apply(&mut msg);
        MessagePatch::add_reaction(reaction("bob", "❤️")).apply(&mut msg);

        assert_eq!(msg.reactions.len(), 2);
        assert_eq!(msg.reaction_by("bob").unwrap().content, "❤️");

        MessagePatch::remove_reaction("bob").apply(&mut msg);
        assert!(msg.reaction_by("bob").is_none());
        assert_eq!(msg.reactions.len(), 1);
    }

    #[test]
    fn patch_serializes_only_present_fields() {
        let value = serde_json::to_value(MessagePatch::received()).unwrap();
        assert_eq!(value, json!({ "received": true }));
        for field in PROTECTED_FIELDS {
            assert!(value.get(field).is_none());
        }
    }
}
