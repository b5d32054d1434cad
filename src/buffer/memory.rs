use super::{decode_entries, BufferStore, EventHub, Subscription};
use crate::error::AppResult;
use crate::models::{ChatEvent, Message, MessagePatch};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

struct TokenEntry {
    value: String,
    expires_at: Instant,
}

/// In-process buffer store with the same semantics as the Redis one.
/// Used by tests and by `BUFFER_BACKEND=memory` single-instance runs.
pub struct MemoryBufferStore {
    buffers: DashMap<String, Arc<Mutex<Vec<String>>>>,
    tokens: DashMap<String, TokenEntry>,
    hub: Arc<EventHub>,
}

impl MemoryBufferStore {
    pub fn new(hub: Arc<EventHub>) -> Self {
        Self {
            buffers: DashMap::new(),
            tokens: DashMap::new(),
            hub,
        }
    }

    fn buffer(&self, chat_id: &str) -> Arc<Mutex<Vec<String>>> {
        self.buffers
            .entry(chat_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Push an already-serialized entry, bypassing encoding.
    #[cfg(test)]
    async fn push_raw(&self, chat_id: &str, raw: impl Into<String>) {
        self.buffer(chat_id).lock().await.push(raw.into());
    }
}

#[async_trait]
impl BufferStore for MemoryBufferStore {
    async fn append(&self, chat_id: &str, message: &Message) -> AppResult<()> {
        let encoded = serde_json::to_string(message)?;
        self.buffer(chat_id).lock().await.push(encoded);
        Ok(())
    }

    async fn mutate(
        &self,
        chat_id: &str,
        message_id: &str,
        patch: &MessagePatch,
    ) -> AppResult<Option<Message>> {
        let buffer = self.buffer(chat_id);
        let mut entries = buffer.lock().await;

        for slot in entries.iter_mut() {
            let Ok(mut message) = serde_json::from_str::<Message>(slot) else {
                continue;
            };
            if message.id != message_id {
                continue;
            }
            patch.apply(&mut message);
            *slot = serde_json::to_string(&message)?;
            return Ok(Some(message));
        }
        Ok(None)
    }

    async fn read_all(&self, chat_id: &str) -> AppResult<Vec<Message>> {
        let raw = self.buffer(chat_id).lock().await.clone();
        Ok(decode_entries(chat_id, raw))
    }

    async fn length(&self, chat_id: &str) -> AppResult<usize> {
        Ok(self.buffer(chat_id).lock().await.len())
    }

    async fn clear(&self, chat_id: &str, flushed: usize) -> AppResult<()> {
        let buffer = self.buffer(chat_id);
        let mut entries = buffer.lock().await;
        let n = flushed.min(entries.len());
        entries.drain(..n);
        Ok(())
    }

    async fn get_or_create_flush_token(&self, chat_id: &str, ttl: Duration) -> AppResult<String> {
        let now = Instant::now();
        let mut entry = self
            .tokens
            .entry(chat_id.to_string())
            .or_insert_with(|| TokenEntry {
                value: Uuid::new_v4().to_string(),
                expires_at: now + ttl,
            });
        if entry.expires_at <= now {
            *entry = TokenEntry {
                value: Uuid::new_v4().to_string(),
                expires_at: now + ttl,
            };
        }
        Ok(entry.value.clone())
    }

    async fn current_flush_token(&self, chat_id: &str) -> AppResult<Option<String>> {
        let now = Instant::now();
        Ok(self
            .tokens
            .get(chat_id)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone()))
    }

    async fn retire_flush_token(&self, chat_id: &str, token: &str) -> AppResult<bool> {
        Ok(self
            .tokens
            .remove_if(chat_id, |_, entry| entry.value == token)
            .is_some())
    }

    async fn publish(&self, event: &ChatEvent) -> AppResult<()> {
        self.hub.dispatch(event.clone());
        Ok(())
    }

    fn subscribe(&self, chat_id: &str) -> Subscription {
        self.hub.subscribe(chat_id)
    }
}
