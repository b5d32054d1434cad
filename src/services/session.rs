use super::ChatServices;
use crate::buffer::Subscription;
use crate::error::{AppError, AppResult};
use crate::models::{ChatEvent, EventKind, Message, MessageInput, MessagePatch, Reaction};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use tokio::sync::watch;
use uuid::Uuid;

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 100;

/// Per-connection facade over one (chat, user) pair.
pub struct ChatSession {
    services: ChatServices,
    chat_id: String,
    user_id: String,
    shutdown: watch::Sender<bool>,
}

impl ChatSession {
    /// Fails with `Unauthorized` unless `user_id` participates in `chat_id`.
    pub async fn open(services: ChatServices, chat_id: &str, user_id: &str) -> AppResult<Self> {
        services
            .membership
            .ensure_participant(chat_id, user_id)
            .await?;

        let (shutdown, _) = watch::channel(false);
        tracing::debug!(chat_id = %chat_id, user_id = %user_id, "chat session opened");

        Ok(Self {
            services,
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            shutdown,
        })
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.is_closed() {
            return Err(AppError::Closed);
        }
        Ok(())
    }

    async fn publish(&self, kind: EventKind, actor_id: &str, messages: Vec<Message>) -> AppResult<()> {
        let event = ChatEvent::new(kind, &self.chat_id, actor_id, messages);
        self.services.buffer.publish(&event).await
    }

    pub async fn send(&self, input: MessageInput) -> AppResult<Message> {
        self.ensure_open()?;

        let content = input.content.unwrap_or_default();
        let mut media = input.media.unwrap_or_default();
        if content.trim().is_empty() && media.is_empty() {
            return Err(AppError::Validation("message content is empty".into()));
        }

        let now = Utc::now();
        for item in media.iter_mut().filter(|m| m.id.is_empty()) {
            item.id = Uuid::new_v4().to_string();
        }

        let message = Message {
            id: Uuid::new_v4().to_string(),
            chat_id: self.chat_id.clone(),
            sender_id: self.user_id.clone(),
            content,
            message_type: input.message_type.unwrap_or_default(),
            media,
            reactions: Vec::new(),
            created_at: now,
            updated_at: now,
            received: false,
            seen: false,
        };

        self.services.buffer.append(&self.chat_id, &message).await?;
        self.publish(EventKind::MessageSent, &self.user_id, vec![message.clone()])
            .await?;

        if let Err(e) = self.services.scheduler.schedule_flush(&self.chat_id).await {
            tracing::warn!(chat_id = %self.chat_id, message_id = %message.id, error = %e, "flush scheduling failed, message stays buffered");
            return Err(e);
        }

        Ok(message)
    }

    pub async fn update(&self, message_id: &str, patch: MessagePatch) -> AppResult<Message> {
        self.ensure_open()?;
        if patch.is_empty() {
            return Err(AppError::Validation("update carries no changes".into()));
        }

        let updated = self
            .apply_patch(message_id, &patch.stamped(Utc::now()))
            .await?;
        self.publish(EventKind::MessageUpdated, &self.user_id, vec![updated.clone()])
            .await?;
        Ok(updated)
    }

    pub async fn mark_received(&self, message_id: &str) -> AppResult<Message> {
        self.ensure_open()?;
        let updated = self
            .apply_patch(message_id, &MessagePatch::received().stamped(Utc::now()))
            .await?;
        self.publish(EventKind::MessageReceived, &self.user_id, vec![updated.clone()])
            .await?;
        Ok(updated)
    }

    /// Sets this user's reaction, replacing any previous one on the same message.
    pub async fn add_reaction(&self, message_id: &str, content: &str) -> AppResult<Message> {
        self.ensure_open()?;
        if content.trim().is_empty() {
            return Err(AppError::Validation("reaction content is empty".into()));
        }

        let reaction = Reaction {
            id: Uuid::new_v4().to_string(),
            sender_id: self.user_id.clone(),
            content: content.to_string(),
            created_at: Utc::now(),
        };
        let patch = MessagePatch::add_reaction(reaction).stamped(Utc::now());
        let updated = self.apply_patch(message_id, &patch).await?;
        self.publish(EventKind::ReactionAdded, &self.user_id, vec![updated.clone()])
            .await?;
        Ok(updated)
    }

    /// Removing a reaction the caller never left returns the message untouched.
    pub async fn remove_reaction(&self, message_id: &str) -> AppResult<Message> {
        self.ensure_open()?;
        let current = self.get_message_by_id(message_id).await?;
        if current.reaction_by(&self.user_id).is_none() {
            tracing::debug!(chat_id = %self.chat_id, message_id, "no reaction to remove");
            return Ok(current);
        }

        let patch = MessagePatch::remove_reaction(&self.user_id).stamped(Utc::now());
        let updated = self.apply_patch(message_id, &patch).await?;
        self.publish(EventKind::ReactionRemoved, &self.user_id, vec![updated.clone()])
            .await?;
        Ok(updated)
    }

    /// Mark a batch seen by `user_id` and publish one combined event.
    ///
    /// Buffer lookups run concurrently (bounded); ids the buffer does not hold go
    /// to the durable record in one batch. Ids that fail or do not exist are
    /// dropped from the result.
    pub async fn mark_seen(&self, ids: &[String], user_id: &str) -> AppResult<Vec<Message>> {
        self.ensure_open()?;

        let mut unique = HashSet::new();
        let ids: Vec<&str> = ids
            .iter()
            .map(String::as_str)
            .filter(|id| !id.is_empty() && unique.insert(*id))
            .collect();
        if ids.is_empty() {
            return Err(AppError::Validation("mark_seen array is required".into()));
        }

        let patch = MessagePatch::seen().stamped(Utc::now());
        let lookups: Vec<(&str, AppResult<Option<Message>>)> = stream::iter(ids.iter().copied())
            .map(|id| {
                let patch = &patch;
                async move { (id, self.try_buffer(id, patch).await) }
            })
            .buffered(self.services.seen_concurrency)
            .collect()
            .await;

        let mut found: HashMap<String, Message> = HashMap::new();
        let mut leftover: Vec<String> = Vec::new();
        for (id, result) in lookups {
            match result {
                Ok(Some(message)) => {
                    found.insert(message.id.clone(), message);
                }
                Ok(None) => leftover.push(id.to_string()),
                Err(e) => {
                    tracing::warn!(chat_id = %self.chat_id, message_id = %id, error = %e, "seen lookup failed, dropping");
                }
            }
        }

        if !leftover.is_empty() {
            match self.try_durable(&leftover, &patch).await {
                Ok(updated) => {
                    for message in updated {
                        found.insert(message.id.clone(), message);
                    }
                }
                Err(e) => {
                    tracing::warn!(chat_id = %self.chat_id, count = leftover.len(), error = %e, "durable seen update failed, dropping");
                }
            }
        }

        let seen: Vec<Message> = ids.iter().filter_map(|id| found.remove(*id)).collect();
        if !seen.is_empty() {
            self.publish(EventKind::MessageSeen, user_id, seen.clone())
                .await?;
        }
        Ok(seen)
    }

    pub async fn typing_started(&self) -> AppResult<()> {
        self.ensure_open()?;
        self.publish(EventKind::TypingStarted, &self.user_id, Vec::new())
            .await
    }

    pub async fn typing_stopped(&self) -> AppResult<()> {
        self.ensure_open()?;
        self.publish(EventKind::TypingStopped, &self.user_id, Vec::new())
            .await
    }

    pub async fn get_message_by_id(&self, message_id: &str) -> AppResult<Message> {
        let buffered = self.services.buffer.read_all(&self.chat_id).await?;
        if let Some(message) = buffered.into_iter().find(|m| m.id == message_id) {
            return Ok(message);
        }

        self.services
            .repo
            .load_chat(&self.chat_id)
            .await?
            .and_then(|chat| chat.messages.into_iter().find(|m| m.id == message_id))
            .ok_or_else(|| AppError::NotFound(format!("message {message_id}")))
    }

    /// Page over durable plus buffered messages ordered by creation time.
    ///
    /// Returns the newest `limit` entries strictly before `before_id`, or the
    /// newest overall. A zero limit means the default page size.
    pub async fn get_messages(
        &self,
        limit: usize,
        before_id: Option<&str>,
    ) -> AppResult<Vec<Message>> {
        let limit = match limit {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };

        let chat = self
            .services
            .repo
            .load_chat(&self.chat_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("chat {}", self.chat_id)))?;
        let buffered = self.services.buffer.read_all(&self.chat_id).await?;

        let mut merged = chat.messages;
        let mut index: HashMap<String, usize> = merged
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id.clone(), i))
            .collect();
        for message in buffered {
            match index.get(&message.id) {
                Some(&slot) => merged[slot] = message,
                None => {
                    index.insert(message.id.clone(), merged.len());
                    merged.push(message);
                }
            }
        }
        merged.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let end = match before_id.filter(|id| !id.is_empty()) {
            Some(id) => merged
                .iter()
                .position(|m| m.id == id)
                .ok_or_else(|| AppError::NotFound(format!("message {id}")))?,
            None => merged.len(),
        };
        merged.truncate(end);
        let start = end.saturating_sub(limit);
        merged.drain(..start);
        Ok(merged)
    }

    /// Subscription that also ends when this session closes.
    pub fn subscribe(&self) -> Subscription {
        self.services
            .buffer
            .subscribe(&self.chat_id)
            .with_shutdown(self.shutdown.subscribe())
    }

    /// Idempotent. Returns true for the call that actually closed the session.
    pub fn close(&self) -> bool {
        let was_closed = self.shutdown.send_replace(true);
        if !was_closed {
            tracing::debug!(chat_id = %self.chat_id, user_id = %self.user_id, "chat session closed");
        }
        !was_closed
    }

    async fn try_buffer(&self, message_id: &str, patch: &MessagePatch) -> AppResult<Option<Message>> {
        self.services
            .buffer
            .mutate(&self.chat_id, message_id, patch)
            .await
    }

    async fn try_durable(&self, ids: &[String], patch: &MessagePatch) -> AppResult<Vec<Message>> {
        self.services
            .writer
            .update_messages(&self.chat_id, ids, |message| patch.apply(message))
            .await
    }

    /// Buffer first; fall back to the durable record once the message has been flushed.
    async fn apply_patch(&self, message_id: &str, patch: &MessagePatch) -> AppResult<Message> {
        if let Some(updated) = self.try_buffer(message_id, patch).await? {
            return Ok(updated);
        }
        self.try_durable(&[message_id.to_string()], patch)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("message {message_id}")))
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.close();
    }
}
