use super::repository::ChatRepository;
use crate::buffer::BufferStore;
use crate::error::{AppError, AppResult};
use crate::models::Message;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Flushed { appended: usize, skipped: usize },
    /// Presented token was not the chat's active one; nothing was touched.
    Stale,
}

/// Sole writer of a chat's durable message list.
///
/// Read-modify-write cycles on the same chat are serialized within this process;
/// the merge is keyed by message id, so a retried flush never duplicates entries.
pub struct DurableWriter {
    buffer: Arc<dyn BufferStore>,
    repo: Arc<dyn ChatRepository>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl DurableWriter {
    pub fn new(buffer: Arc<dyn BufferStore>, repo: Arc<dyn ChatRepository>) -> Self {
        Self {
            buffer,
            repo,
            locks: DashMap::new(),
        }
    }

    fn chat_lock(&self, chat_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(chat_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn release_lock(&self, chat_id: &str) {
        self.locks
            .remove_if(chat_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub async fn flush(&self, chat_id: &str, token: &str) -> AppResult<FlushOutcome> {
        let lock = self.chat_lock(chat_id);
        let outcome = {
            let _guard = lock.lock().await;
            self.flush_locked(chat_id, token).await
        };
        drop(lock);
        self.release_lock(chat_id);
        outcome
    }

    async fn flush_locked(&self, chat_id: &str, token: &str) -> AppResult<FlushOutcome> {
        match self.buffer.current_flush_token(chat_id).await? {
            Some(active) if active == token => {}
            active => {
                tracing::info!(
                    chat_id = %chat_id,
                    has_active = active.is_some(),
                    "skipping flush with stale token"
                );
                return Ok(FlushOutcome::Stale);
            }
        }

        let mut chat = self
            .repo
            .load_chat(chat_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("chat {chat_id}")))?;

        // Length first: everything counted here is also in the read below, so
        // trimming `snapshot_len` entries never drops an unread append.
        let snapshot_len = self.buffer.length(chat_id).await?;
        let buffered = self.buffer.read_all(chat_id).await?;

        let mut known: HashSet<String> = chat.messages.iter().map(|m| m.id.clone()).collect();
        let mut appended = 0;
        let mut skipped = 0;
        for mut message in buffered {
            if !known.insert(message.id.clone()) {
                skipped += 1;
                continue;
            }
            if message.chat_id.is_empty() {
                message.chat_id = chat_id.to_string();
            }
            chat.messages.push(message);
            appended += 1;
        }

        if appended > 0 {
            self.repo.update_chat(&chat).await?;
        }
        self.repo.invalidate_cache(chat_id).await?;
        self.buffer.clear(chat_id, snapshot_len).await?;
        self.buffer.retire_flush_token(chat_id, token).await?;

        tracing::info!(chat_id = %chat_id, appended, skipped, "buffer flushed");
        Ok(FlushOutcome::Flushed { appended, skipped })
    }

    /// Durable tier of the two-tier update: edit the listed messages inside the
    /// authoritative record. Ids not present are skipped. Returns the edited
    /// messages in the order of `ids`.
    pub async fn update_messages<F>(
        &self,
        chat_id: &str,
        ids: &[String],
        mut edit: F,
    ) -> AppResult<Vec<Message>>
    where
        F: FnMut(&mut Message) + Send,
    {
        let lock = self.chat_lock(chat_id);
        let result = async {
            let _guard = lock.lock().await;
            let mut chat = self
                .repo
                .load_chat(chat_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("chat {chat_id}")))?;

            let mut updated = Vec::new();
            for id in ids {
                if let Some(message) = chat.messages.iter_mut().find(|m| &m.id == id) {
                    edit(message);
                    updated.push(message.clone());
                }
            }

            if !updated.is_empty() {
                self.repo.update_chat(&chat).await?;
                self.repo.invalidate_cache(chat_id).await?;
            }
            Ok::<_, AppError>(updated)
        }
        .await;
        drop(lock);
        self.release_lock(chat_id);
        result
    }
}
