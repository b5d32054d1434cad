//! JSON text frames exchanged with clients over the delivery connection.

use crate::error::{AppError, AppResult};
use crate::models::{ChatEvent, EventKind, Message, MessageInput, MessagePatch};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundKind {
    MessageSent,
    MessageUpdated,
    TypingStarted,
    TypingStopped,
    ReactionAdded,
    ReactionRemoved,
    MessageReceived,
    MessageSeen,
    QueryMessages,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReactionInput {
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub reaction: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageQuery {
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub before_id: Option<String>,
}

/// One decoded client frame. Built fresh for every read.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    pub event: InboundKind,
    #[serde(default)]
    pub message: Option<MessageInput>,
    #[serde(default)]
    pub reaction: Option<ReactionInput>,
    #[serde(default)]
    pub mark_seen: Option<Vec<String>>,
    #[serde(default)]
    pub message_query: Option<MessageQuery>,
}

impl InboundFrame {
    pub fn decode(text: &str) -> AppResult<Self> {
        serde_json::from_str(text).map_err(|e| AppError::Validation(format!("malformed frame: {e}")))
    }
}

/// Validated operation requested by a client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Send(MessageInput),
    Update { message_id: String, patch: MessagePatch },
    TypingStarted,
    TypingStopped,
    AddReaction { message_id: String, content: String },
    RemoveReaction { message_id: String },
    MarkReceived { message_id: String },
    MarkSeen(Vec<String>),
    Query { limit: usize, before_id: Option<String> },
}

fn required_message_id(message: Option<MessageInput>) -> AppResult<(String, MessageInput)> {
    let message = message.ok_or_else(|| AppError::Validation("message is required".into()))?;
    match message.id.clone().filter(|id| !id.is_empty()) {
        Some(id) => Ok((id, message)),
        None => Err(AppError::Validation("message id is required".into())),
    }
}

impl TryFrom<InboundFrame> for Command {
    type Error = AppError;

    fn try_from(frame: InboundFrame) -> AppResult<Self> {
        match frame.event {
            InboundKind::MessageSent => frame
                .message
                .map(Command::Send)
                .ok_or_else(|| AppError::Validation("message is required".into())),
            InboundKind::MessageUpdated => {
                let (message_id, message) = required_message_id(frame.message)?;
                Ok(Command::Update {
                    message_id,
                    patch: MessagePatch::from(message),
                })
            }
            InboundKind::TypingStarted => Ok(Command::TypingStarted),
            InboundKind::TypingStopped => Ok(Command::TypingStopped),
            InboundKind::ReactionAdded => match frame.reaction {
                Some(r) if !r.message_id.is_empty() && !r.reaction.is_empty() => {
                    Ok(Command::AddReaction {
                        message_id: r.message_id,
                        content: r.reaction,
                    })
                }
                _ => Err(AppError::Validation("reaction is required".into())),
            },
            InboundKind::ReactionRemoved => match frame.reaction {
                Some(r) if !r.message_id.is_empty() => Ok(Command::RemoveReaction {
                    message_id: r.message_id,
                }),
                _ => Err(AppError::Validation("message id is required".into())),
            },
            InboundKind::MessageReceived => {
                let (message_id, _) = required_message_id(frame.message)?;
                Ok(Command::MarkReceived { message_id })
            }
            InboundKind::MessageSeen => match frame.mark_seen {
                Some(ids) if !ids.is_empty() => Ok(Command::MarkSeen(ids)),
                _ => Err(AppError::Validation("mark_seen array is required".into())),
            },
            InboundKind::QueryMessages => {
                let query = frame
                    .message_query
                    .ok_or_else(|| AppError::Validation("message query is required".into()))?;
                Ok(Command::Query {
                    limit: query.limit,
                    before_id: query.before_id.filter(|id| !id.is_empty()),
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundKind {
    MessageSent,
    MessageUpdated,
    MessageReceived,
    MessageSeen,
    TypingStarted,
    TypingStopped,
    ReactionAdded,
    ReactionRemoved,
    MessagesQuerySuccess,
    /// Result of the requester's own operation, carrying the stored messages.
    Ack,
    Error,
    Unauthorized,
}

impl From<EventKind> for OutboundKind {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::MessageSent => OutboundKind::MessageSent,
            EventKind::MessageUpdated => OutboundKind::MessageUpdated,
            EventKind::MessageReceived => OutboundKind::MessageReceived,
            EventKind::MessageSeen => OutboundKind::MessageSeen,
            EventKind::TypingStarted => OutboundKind::TypingStarted,
            EventKind::TypingStopped => OutboundKind::TypingStopped,
            EventKind::ReactionAdded => OutboundKind::ReactionAdded,
            EventKind::ReactionRemoved => OutboundKind::ReactionRemoved,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub event: OutboundKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OutboundFrame {
    fn new(event: OutboundKind) -> Self {
        Self {
            event,
            messages: Vec::new(),
            data: None,
            error: None,
        }
    }

    pub fn from_event(event: &ChatEvent) -> Self {
        Self {
            messages: event.messages.clone(),
            data: Some(json!({
                "actor_id": event.actor_id,
                "timestamp": event.timestamp,
            })),
            ..Self::new(event.kind.into())
        }
    }

    pub fn error(err: &AppError) -> Self {
        let kind = match err {
            AppError::Unauthorized(_) => OutboundKind::Unauthorized,
            _ => OutboundKind::Error,
        };
        Self {
            error: Some(err.client_message()),
            ..Self::new(kind)
        }
    }

    pub fn ack(request: InboundKind, messages: Vec<Message>) -> Self {
        Self {
            messages,
            data: Some(json!({ "request": request })),
            ..Self::new(OutboundKind::Ack)
        }
    }

    pub fn query_success(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::new(OutboundKind::MessagesQuerySuccess)
        }
    }

    pub fn encode(&self) -> AppResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(text: &str) -> AppResult<Command> {
        Command::try_from(InboundFrame::decode(text)?)
    }

    #[test]
    fn decodes_send_frame() {
        let cmd = command(r#"{"event":"message_sent","message":{"content":"hey","type":"text"}}"#)
            .unwrap();
        match cmd {
            Command::Send(input) => assert_eq!(input.content.as_deref(), Some("hey")),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn update_requires_message_id() {
        let err = command(r#"{"event":"message_updated","message":{"content":"x"}}"#).unwrap_err();
        assert_eq!(err, AppError::Validation("message id is required".into()));
    }

    #[test]
    fn reaction_needs_content_and_target() {
        assert!(command(r#"{"event":"reaction_added","reaction":{"message_id":"m1"}}"#).is_err());
        let cmd =
            command(r#"{"event":"reaction_added","reaction":{"message_id":"m1","reaction":"🔥"}}"#)
                .unwrap();
        assert_eq!(
            cmd,
            Command::AddReaction {
                message_id: "m1".into(),
                content: "🔥".into()
            }
        );
    }

    #[test]
    fn empty_seen_batch_is_rejected() {
        let err = command(r#"{"event":"message_seen","mark_seen":[]}"#).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn query_defaults_are_preserved_for_session() {
        let cmd = command(r#"{"event":"query_messages","message_query":{"before_id":""}}"#).unwrap();
        assert_eq!(
            cmd,
            Command::Query {
                limit: 0,
                before_id: None
            }
        );
    }

    #[test]
    fn unknown_event_is_validation_error() {
        let err = InboundFrame::decode(r#"{"event":"message_deleted"}"#).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn outbound_frame_omits_absent_parts() {
        let frame = OutboundFrame::error(&AppError::NotFound("message m9".into()));
        let value: JsonValue = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value, json!({ "event": "error", "error": "message m9" }));
    }

    #[test]
    fn unauthorized_errors_use_their_own_kind() {
        let frame = OutboundFrame::error(&AppError::Unauthorized("not a participant".into()));
        assert_eq!(frame.event, OutboundKind::Unauthorized);
    }
}
