use super::{buffer_key, decode_entries, events_channel, token_key, BufferStore, EventHub, Subscription};
use crate::error::{AppError, AppResult};
use crate::models::{ChatEvent, Message, MessagePatch};
use async_trait::async_trait;
use redis::{AsyncCommands, Script};
use redis_utils::{run_with_timeout, RedisPool};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Rewrites the first entry whose `id` matches ARGV[1], merging the JSON patch in
/// ARGV[2]. Protected keys are never overwritten; reaction ops keep one reaction
/// per sender. Returns the new entry or false.
const MUTATE_SCRIPT: &str = r#"
local key = KEYS[1]
local target = ARGV[1]
local patch = cjson.decode(ARGV[2])
local protected = { id = true, chat_id = true, sender_id = true, created_at = true }
local reaction_ops = { add_reaction = true, remove_reaction_by = true }

local entries = redis.call('LRANGE', key, 0, -1)
for i, raw in ipairs(entries) do
    local ok, entry = pcall(cjson.decode, raw)
    if ok and type(entry) == 'table' and entry['id'] == target then
        for field, value in pairs(patch) do
            if not protected[field] and not reaction_ops[field] then
                entry[field] = value
            end
        end

        local added = patch['add_reaction']
        local reactor = patch['remove_reaction_by']
        if reactor == nil and type(added) == 'table' then
            reactor = added['sender_id']
        end
        if reactor ~= nil then
            local kept = {}
            local current = entry['reactions']
            if type(current) == 'table' then
                for _, reaction in ipairs(current) do
                    if reaction['sender_id'] ~= reactor then
                        table.insert(kept, reaction)
                    end
                end
            end
            if type(added) == 'table' then
                table.insert(kept, added)
            end
            entry['reactions'] = kept
        end
        local encoded = cjson.encode(entry)
        redis.call('LSET', key, i - 1, encoded)
        return encoded
    end
end
return false
"#;

/// Compare-and-delete so a flush only retires the token it was scheduled with.
const RETIRE_TOKEN_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Redis-backed buffer: one list per chat, a TTL'd token string, and a pub/sub
/// channel fanned back into the local [`EventHub`] by the psubscribe listener.
pub struct RedisBufferStore {
    pool: RedisPool,
    hub: Arc<EventHub>,
    command_timeout: Duration,
    mutate_script: Script,
    retire_script: Script,
}

impl RedisBufferStore {
    pub fn new(pool: RedisPool, hub: Arc<EventHub>, command_timeout: Duration) -> Self {
        Self {
            pool,
            hub,
            command_timeout,
            mutate_script: Script::new(MUTATE_SCRIPT),
            retire_script: Script::new(RETIRE_TOKEN_SCRIPT),
        }
    }

    /// Run the mutate script with an already-encoded JSON patch object.
    pub async fn mutate_raw(
        &self,
        chat_id: &str,
        message_id: &str,
        patch_json: String,
    ) -> AppResult<Option<Message>> {
        let mut conn = self.pool.connection().await;
        let updated: Option<String> = run_with_timeout(
            self.command_timeout,
            self.mutate_script
                .key(buffer_key(chat_id))
                .arg(message_id)
                .arg(patch_json)
                .invoke_async::<_, Option<String>>(&mut conn),
        )
        .await?;

        match updated {
            Some(raw) => serde_json::from_str::<Message>(&raw).map(Some).map_err(|e| {
                tracing::warn!(chat_id = %chat_id, message_id = %message_id, error = %e, "mutated entry failed to decode");
                AppError::Serialization(e.to_string())
            }),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl BufferStore for RedisBufferStore {
    async fn append(&self, chat_id: &str, message: &Message) -> AppResult<()> {
        let encoded = serde_json::to_string(message)?;
        let mut conn = self.pool.connection().await;
        run_with_timeout(
            self.command_timeout,
            conn.rpush::<_, _, ()>(buffer_key(chat_id), encoded),
        )
        .await?;
        Ok(())
    }

    async fn mutate(
        &self,
        chat_id: &str,
        message_id: &str,
        patch: &MessagePatch,
    ) -> AppResult<Option<Message>> {
        let patch_json = serde_json::to_string(patch)?;
        self.mutate_raw(chat_id, message_id, patch_json).await
    }

    async fn read_all(&self, chat_id: &str) -> AppResult<Vec<Message>> {
        let mut conn = self.pool.connection().await;
        let raw: Vec<String> = run_with_timeout(
            self.command_timeout,
            conn.lrange(buffer_key(chat_id), 0, -1),
        )
        .await?;
        Ok(decode_entries(chat_id, raw))
    }

    async fn length(&self, chat_id: &str) -> AppResult<usize> {
        let mut conn = self.pool.connection().await;
        let len: usize =
            run_with_timeout(self.command_timeout, conn.llen(buffer_key(chat_id))).await?;
        Ok(len)
    }

    async fn clear(&self, chat_id: &str, flushed: usize) -> AppResult<()> {
        if flushed == 0 {
            return Ok(());
        }
        let start = isize::try_from(flushed).unwrap_or(isize::MAX);
        let mut conn = self.pool.connection().await;
        run_with_timeout(
            self.command_timeout,
            conn.ltrim::<_, ()>(buffer_key(chat_id), start, -1),
        )
        .await?;
        Ok(())
    }

    async fn get_or_create_flush_token(&self, chat_id: &str, ttl: Duration) -> AppResult<String> {
        let key = token_key(chat_id);
        let ttl_secs = ttl.as_secs().max(1);
        let candidate = Uuid::new_v4().to_string();
        let mut conn = self.pool.connection().await;

        let _: Option<String> = run_with_timeout(
            self.command_timeout,
            redis::cmd("SET")
                .arg(&key)
                .arg(&candidate)
                .arg("NX")
                .arg("EX")
                .arg(ttl_secs)
                .query_async(&mut conn),
        )
        .await?;

        let active: Option<String> =
            run_with_timeout(self.command_timeout, conn.get(&key)).await?;
        match active {
            Some(token) => Ok(token),
            None => {
                // Expired between SET and GET; store our candidate outright.
                run_with_timeout(
                    self.command_timeout,
                    conn.set_ex::<_, _, ()>(&key, &candidate, ttl_secs),
                )
                .await?;
                Ok(candidate)
            }
        }
    }

    async fn current_flush_token(&self, chat_id: &str) -> AppResult<Option<String>> {
        let mut conn = self.pool.connection().await;
        let token: Option<String> =
            run_with_timeout(self.command_timeout, conn.get(token_key(chat_id))).await?;
        Ok(token)
    }

    async fn retire_flush_token(&self, chat_id: &str, token: &str) -> AppResult<bool> {
        let mut conn = self.pool.connection().await;
        let removed: i64 = run_with_timeout(
            self.command_timeout,
            self.retire_script
                .key(token_key(chat_id))
                .arg(token)
                .invoke_async::<_, i64>(&mut conn),
        )
        .await?;
        Ok(removed > 0)
    }

    async fn publish(&self, event: &ChatEvent) -> AppResult<()> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.pool.connection().await;
        let receivers: i64 = run_with_timeout(
            self.command_timeout,
            conn.publish(events_channel(&event.chat_id), payload),
        )
        .await?;
        tracing::debug!(chat_id = %event.chat_id, event = event.kind.as_str(), receivers, "published chat event");
        Ok(())
    }

    fn subscribe(&self, chat_id: &str) -> Subscription {
        self.hub.subscribe(chat_id)
    }
}
