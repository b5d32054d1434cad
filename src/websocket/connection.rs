use super::frames::{Command, InboundFrame, InboundKind, OutboundFrame};
use crate::buffer::Subscription;
use crate::error::{AppError, AppResult};
use crate::models::ChatEvent;
use crate::services::{ChatServices, ChatSession};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// `Connecting -> Authenticated -> Active -> Closed`. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Active,
    Closed,
}

/// Per-connection protocol state. Owns the chat session for the connection's lifetime.
pub struct Connection {
    chat_id: String,
    state: ConnectionState,
    session: Option<ChatSession>,
}

impl Connection {
    pub fn new(chat_id: &str) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            state: ConnectionState::Connecting,
            session: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn user_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.user_id())
    }

    /// Open the chat session. On failure the connection is closed and the single
    /// diagnostic frame to send is returned.
    pub async fn authenticate(
        &mut self,
        services: ChatServices,
        user_id: &str,
    ) -> Result<(), OutboundFrame> {
        if self.state != ConnectionState::Connecting {
            self.state = ConnectionState::Closed;
            return Err(OutboundFrame::error(&AppError::Validation(
                "connection already authenticated".into(),
            )));
        }

        match ChatSession::open(services, &self.chat_id, user_id).await {
            Ok(session) => {
                self.session = Some(session);
                self.state = ConnectionState::Authenticated;
                Ok(())
            }
            Err(e) => {
                tracing::info!(chat_id = %self.chat_id, user_id = %user_id, error = %e, "connection refused");
                self.state = ConnectionState::Closed;
                Err(OutboundFrame::error(&e))
            }
        }
    }

    /// Start fan-out. The returned subscription ends when this connection closes.
    pub fn activate(&mut self) -> AppResult<Subscription> {
        match (&self.session, self.state) {
            (Some(session), ConnectionState::Authenticated) => {
                let subscription = session.subscribe();
                self.state = ConnectionState::Active;
                Ok(subscription)
            }
            _ => Err(AppError::Validation("connection is not authenticated".into())),
        }
    }

    /// Handle one client text frame. Returns the frame to send back to this
    /// client, if any. Errors are reported as frames and never close the connection.
    pub async fn handle_text(&self, text: &str) -> Option<OutboundFrame> {
        let session = match (&self.session, self.state) {
            (Some(session), ConnectionState::Active) => session,
            (_, ConnectionState::Closed) => return None,
            _ => {
                return Some(OutboundFrame::error(&AppError::Validation(
                    "connection is not active".into(),
                )))
            }
        };

        let result = match InboundFrame::decode(text) {
            Ok(frame) => {
                let kind = frame.event;
                match Command::try_from(frame) {
                    Ok(command) => dispatch(session, kind, command).await,
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(chat_id = %self.chat_id, error = %e, "client operation failed");
                Some(OutboundFrame::error(&e))
            }
        }
    }

    /// Idempotent. Tears down the session and with it the subscription.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed && self.session.is_none() {
            return;
        }
        self.state = ConnectionState::Closed;
        if let Some(session) = self.session.take() {
            session.close();
        }
    }
}

/// Run one validated command against the session.
pub async fn dispatch(
    session: &ChatSession,
    request: InboundKind,
    command: Command,
) -> AppResult<Option<OutboundFrame>> {
    let stored = match command {
        Command::Send(input) => vec![session.send(input).await?],
        Command::Update { message_id, patch } => vec![session.update(&message_id, patch).await?],
        Command::AddReaction {
            message_id,
            content,
        } => vec![session.add_reaction(&message_id, &content).await?],
        Command::RemoveReaction { message_id } => {
            vec![session.remove_reaction(&message_id).await?]
        }
        Command::MarkReceived { message_id } => vec![session.mark_received(&message_id).await?],
        Command::MarkSeen(ids) => session.mark_seen(&ids, session.user_id()).await?,
        Command::TypingStarted => {
            session.typing_started().await?;
            return Ok(None);
        }
        Command::TypingStopped => {
            session.typing_stopped().await?;
            return Ok(None);
        }
        Command::Query { limit, before_id } => {
            let page = session.get_messages(limit, before_id.as_deref()).await?;
            return Ok(Some(OutboundFrame::query_success(page)));
        }
    };
    Ok(Some(OutboundFrame::ack(request, stored)))
}

/// Echo suppression: a connection never gets its own user's events back,
/// except seen batches.
pub fn should_deliver(user_id: &str, event: &ChatEvent) -> bool {
    event.actor_id != user_id || event.kind.echoes_to_actor()
}

/// Outgoing half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: &OutboundFrame) -> AppResult<()>;
}

#[async_trait]
impl FrameSink for actix_ws::Session {
    async fn send_frame(&mut self, frame: &OutboundFrame) -> AppResult<()> {
        let text = frame.encode()?;
        self.text(text).await.map_err(|_| AppError::Closed)
    }
}

#[async_trait]
impl FrameSink for mpsc::Sender<OutboundFrame> {
    async fn send_frame(&mut self, frame: &OutboundFrame) -> AppResult<()> {
        self.send(frame.clone()).await.map_err(|_| AppError::Closed)
    }
}

/// Drain the subscription into `sink` until either side closes. Returns frames delivered.
pub async fn run_outbound<S: FrameSink>(
    mut subscription: Subscription,
    user_id: String,
    mut sink: S,
) -> usize {
    let mut delivered = 0;
    while let Some(event) = subscription.recv().await {
        if !should_deliver(&user_id, &event) {
            continue;
        }
        if let Err(e) = sink.send_frame(&OutboundFrame::from_event(&event)).await {
            tracing::debug!(chat_id = %subscription.chat_id(), user_id = %user_id, error = %e, "outbound sink closed");
            break;
        }
        delivered += 1;
    }
    subscription.close();
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventKind;

    #[test]
    fn own_events_are_suppressed_except_seen() {
        let sent = ChatEvent::new(EventKind::MessageSent, "c1", "alice", vec![]);
        let typing = ChatEvent::new(EventKind::TypingStarted, "c1", "alice", vec![]);
        let seen = ChatEvent::new(EventKind::MessageSeen, "c1", "alice", vec![]);

        assert!(!should_deliver("alice", &sent));
        assert!(!should_deliver("alice", &typing));
        assert!(should_deliver("alice", &seen));
        assert!(should_deliver("bob", &sent));
    }

    #[tokio::test]
    async fn inactive_connection_ignores_frames() {
        let conn = Connection::new("c1");
        let reply = conn.handle_text(r#"{"event":"typing_started"}"#).await.unwrap();
        assert!(reply.error.is_some());
        assert_eq!(conn.state(), ConnectionState::Connecting);
    }

    #[test]
    fn activate_requires_authentication() {
        let mut conn = Connection::new("c1");
        assert!(conn.activate().is_err());
        conn.close();
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }
}
