use crate::db::with_timeout;
use crate::error::{AppError, AppResult};
use crate::models::{Chat, Message};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use dashmap::DashMap;
use deadpool_postgres::Pool;
use redis::Pipeline;
use redis_utils::{run_with_timeout, RedisPool};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_postgres::types::Json;
use tokio_postgres::Row;

pub fn cache_key(chat_id: &str) -> String {
    format!("chat_cache:{}", chat_id)
}

/// Authoritative chat storage. `update_chat` replaces the whole message list.
#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn load_chat(&self, chat_id: &str) -> AppResult<Option<Chat>>;

    async fn update_chat(&self, chat: &Chat) -> AppResult<()>;

    /// Drop read-through cache entries under the chat's cache prefix.
    async fn invalidate_cache(&self, chat_id: &str) -> AppResult<()>;
}

pub struct PgChatRepository {
    pool: Pool,
    timeout: Duration,
    cache: Option<RedisPool>,
    cache_timeout: Duration,
}

impl PgChatRepository {
    pub fn new(pool: Pool, timeout: Duration) -> Self {
        Self {
            pool,
            timeout,
            cache: None,
            cache_timeout: timeout,
        }
    }

    /// Invalidate the read-through cache in `cache` after every flush.
    pub fn with_cache(mut self, cache: Option<RedisPool>, timeout: Duration) -> Self {
        self.cache = cache;
        self.cache_timeout = timeout;
        self
    }

    fn chat_from_row(row: &Row) -> AppResult<Chat> {
        let created_at: NaiveDateTime = row.try_get("created_at")?;
        let match_id: Option<String> = row.try_get("match_id")?;
        let messages: Option<serde_json::Value> = row.try_get("messages")?;
        let messages = match messages {
            Some(value @ serde_json::Value::Array(_)) => {
                serde_json::from_value::<Vec<Message>>(value)?
            }
            _ => Vec::new(),
        };

        Ok(Chat {
            id: row.try_get("id")?,
            match_id: match_id.unwrap_or_default(),
            created_at: created_at.and_utc(),
            messages,
        })
    }
}

#[async_trait]
impl ChatRepository for PgChatRepository {
    async fn load_chat(&self, chat_id: &str) -> AppResult<Option<Chat>> {
        with_timeout(self.timeout, async {
            let client = self.pool.get().await?;
            let row = client
                .query_opt(
                    "SELECT id, match_id, created_at, messages FROM chats WHERE id = $1",
                    &[&chat_id],
                )
                .await?;
            row.as_ref().map(Self::chat_from_row).transpose()
        })
        .await
    }

    async fn update_chat(&self, chat: &Chat) -> AppResult<()> {
        with_timeout(self.timeout, async {
            let client = self.pool.get().await?;
            let updated = client
                .execute(
                    "UPDATE chats SET messages = $2 WHERE id = $1",
                    &[&chat.id, &Json(&chat.messages)],
                )
                .await?;
            if updated == 0 {
                return Err(AppError::NotFound(format!("chat {}", chat.id)));
            }
            Ok(())
        })
        .await
    }

    async fn invalidate_cache(&self, chat_id: &str) -> AppResult<()> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };
        let removed = invalidate_chat_cache(cache, chat_id, self.cache_timeout).await?;
        tracing::debug!(chat_id = %chat_id, keys = removed, "chat cache invalidated");
        Ok(())
    }
}

/// Delete `chat_cache:{id}` and every `chat_cache:{id}:*` entry. Returns how many
/// keys were targeted. Buffer and token keys live under `chat:` and are never matched.
pub async fn invalidate_chat_cache(
    cache: &RedisPool,
    chat_id: &str,
    timeout: Duration,
) -> AppResult<usize> {
    let mut conn = cache.connection().await;
    let prefix = cache_key(chat_id);

    let mut keys = vec![prefix.clone()];
    let pattern = format!("{prefix}:*");
    let mut cursor: u64 = 0;
    loop {
        let (next_cursor, batch): (u64, Vec<String>) = run_with_timeout(
            timeout,
            redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn),
        )
        .await?;
        keys.extend(batch);
        cursor = next_cursor;
        if cursor == 0 {
            break;
        }
    }

    let mut pipe = Pipeline::new();
    for key in &keys {
        pipe.del(key).ignore();
    }
    run_with_timeout(timeout, pipe.query_async::<_, ()>(&mut conn)).await?;
    Ok(keys.len())
}

/// In-memory chat table for tests and `DURABLE_BACKEND=memory`.
#[derive(Default)]
pub struct MemoryChatRepository {
    chats: DashMap<String, Chat>,
    updates: AtomicUsize,
    invalidations: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryChatRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, chat: Chat) {
        self.chats.insert(chat.id.clone(), chat);
    }

    pub fn get(&self, chat_id: &str) -> Option<Chat> {
        self.chats.get(chat_id).map(|c| c.clone())
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn invalidation_count(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }

    /// Make every call fail as if the database were unreachable.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> AppResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::StoreUnavailable("database unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatRepository for MemoryChatRepository {
    async fn load_chat(&self, chat_id: &str) -> AppResult<Option<Chat>> {
        self.check_available()?;
        Ok(self.get(chat_id))
    }

    async fn update_chat(&self, chat: &Chat) -> AppResult<()> {
        self.check_available()?;
        let mut stored = self
            .chats
            .get_mut(&chat.id)
            .ok_or_else(|| AppError::NotFound(format!("chat {}", chat.id)))?;
        stored.messages = chat.messages.clone();
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn invalidate_cache(&self, _chat_id: &str) -> AppResult<()> {
        self.check_available()?;
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
