//! Per-chat staging area for messages not yet committed to the durable chat record,
//! plus the flush token and pub/sub channel scoped to each chat.

use crate::error::AppResult;
use crate::models::{ChatEvent, Message, MessagePatch};
use async_trait::async_trait;
use std::time::Duration;

pub mod hub;
pub mod memory;
pub mod redis_store;

pub use hub::{start_psub_listener, EventHub, Subscription};
pub use memory::MemoryBufferStore;
pub use redis_store::RedisBufferStore;

pub fn buffer_key(chat_id: &str) -> String {
    format!("chat:{}:msgs", chat_id)
}

pub fn token_key(chat_id: &str) -> String {
    format!("chat:{}:flush_token", chat_id)
}

pub fn events_channel(chat_id: &str) -> String {
    format!("chat:{}:events", chat_id)
}

pub const EVENTS_PATTERN: &str = "chat:*:events";

/// Recover the chat id from a `chat:{id}:events` channel name.
pub fn chat_id_from_channel(channel: &str) -> Option<&str> {
    channel
        .strip_prefix("chat:")
        .and_then(|rest| rest.strip_suffix(":events"))
        .filter(|id| !id.is_empty())
}

/// Decode raw buffered entries, skipping (and logging) any that do not parse.
pub(crate) fn decode_entries(chat_id: &str, raw: Vec<String>) -> Vec<Message> {
    raw.into_iter()
        .enumerate()
        .filter_map(|(slot, entry)| match serde_json::from_str::<Message>(&entry) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::warn!(chat_id = %chat_id, slot, error = %e, "skipping malformed buffered entry");
                None
            }
        })
        .collect()
}

/// Fast store holding each chat's pending increment of messages.
///
/// Calls on the same chat are linearizable; nothing is ordered across chats.
/// Store failures come back as `StoreUnavailable` with no internal retry.
#[async_trait]
pub trait BufferStore: Send + Sync {
    /// Push to the tail of the chat's buffer. No uniqueness check.
    async fn append(&self, chat_id: &str, message: &Message) -> AppResult<()>;

    /// Atomically rewrite the buffered entry with `message_id`. `Ok(None)` when not buffered.
    async fn mutate(
        &self,
        chat_id: &str,
        message_id: &str,
        patch: &MessagePatch,
    ) -> AppResult<Option<Message>>;

    /// Buffered entries in insertion order.
    async fn read_all(&self, chat_id: &str) -> AppResult<Vec<Message>>;

    async fn length(&self, chat_id: &str) -> AppResult<usize>;

    /// Remove the first `flushed` entries. Anything appended after the flush
    /// snapshot was taken survives for the next window.
    async fn clear(&self, chat_id: &str, flushed: usize) -> AppResult<()>;

    /// Active token for the chat, created with `ttl` if none exists.
    async fn get_or_create_flush_token(&self, chat_id: &str, ttl: Duration) -> AppResult<String>;

    async fn current_flush_token(&self, chat_id: &str) -> AppResult<Option<String>>;

    /// Delete the token only if it still equals `token`. Returns whether it was removed.
    async fn retire_flush_token(&self, chat_id: &str, token: &str) -> AppResult<bool>;

    async fn publish(&self, event: &ChatEvent) -> AppResult<()>;

    fn subscribe(&self, chat_id: &str) -> Subscription;
}
