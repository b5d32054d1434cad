use super::message::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MessageSent,
    MessageUpdated,
    MessageReceived,
    MessageSeen,
    TypingStarted,
    TypingStopped,
    ReactionAdded,
    ReactionRemoved,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MessageSent => "message_sent",
            EventKind::MessageUpdated => "message_updated",
            EventKind::MessageReceived => "message_received",
            EventKind::MessageSeen => "message_seen",
            EventKind::TypingStarted => "typing_started",
            EventKind::TypingStopped => "typing_stopped",
            EventKind::ReactionAdded => "reaction_added",
            EventKind::ReactionRemoved => "reaction_removed",
        }
    }

    /// Seen batches go to every connection, the actor's own included.
    pub fn echoes_to_actor(&self) -> bool {
        matches!(self, EventKind::MessageSeen)
    }
}

/// Event published on a chat's pub/sub channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub kind: EventKind,
    pub chat_id: String,
    pub actor_id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub timestamp: DateTime<Utc>,
}

impl ChatEvent {
    pub fn new(kind: EventKind, chat_id: &str, actor_id: &str, messages: Vec<Message>) -> Self {
        Self {
            kind,
            chat_id: chat_id.to_string(),
            actor_id: actor_id.to_string(),
            messages,
            timestamp: Utc::now(),
        }
    }
}
