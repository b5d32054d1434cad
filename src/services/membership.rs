use crate::db::with_timeout;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use deadpool_postgres::Pool;
use std::time::Duration;

/// Answers "is this user a participant of this chat".
#[async_trait]
pub trait MembershipChecker: Send + Sync {
    /// `Ok(())` for participants, `Unauthorized` otherwise (unknown chats included).
    async fn ensure_participant(&self, chat_id: &str, user_id: &str) -> AppResult<()>;
}

fn not_participant() -> AppError {
    AppError::Unauthorized("not a participant of this chat".into())
}

/// A chat belongs to a match; its two sides are the participants.
pub struct PgMembership {
    pool: Pool,
    timeout: Duration,
}

impl PgMembership {
    pub fn new(pool: Pool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl MembershipChecker for PgMembership {
    async fn ensure_participant(&self, chat_id: &str, user_id: &str) -> AppResult<()> {
        let participants: Option<(Option<String>, Option<String>)> =
            with_timeout(self.timeout, async {
                let client = self.pool.get().await?;
                let row = client
                    .query_opt(
                        "SELECT m.she_id, m.he_id FROM chats c \
                         JOIN matches m ON m.id = c.match_id \
                         WHERE c.id = $1",
                        &[&chat_id],
                    )
                    .await?;
                match row {
                    Some(row) => Ok(Some((row.try_get(0)?, row.try_get(1)?))),
                    None => Ok(None),
                }
            })
            .await?;

        match participants {
            Some((she, he))
                if she.as_deref() == Some(user_id) || he.as_deref() == Some(user_id) =>
            {
                Ok(())
            }
            _ => {
                tracing::warn!(chat_id = %chat_id, user_id = %user_id, "membership check refused");
                Err(not_participant())
            }
        }
    }
}

/// Fixed membership table for tests and local runs.
#[derive(Default)]
pub struct StaticMembership {
    members: DashMap<String, DashSet<String>>,
}

impl StaticMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&self, chat_id: &str, user_id: &str) {
        self.members
            .entry(chat_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }

    pub fn with_member(self, chat_id: &str, user_id: &str) -> Self {
        self.allow(chat_id, user_id);
        self
    }
}

#[async_trait]
impl MembershipChecker for StaticMembership {
    async fn ensure_participant(&self, chat_id: &str, user_id: &str) -> AppResult<()> {
        let allowed = self
            .members
            .get(chat_id)
            .map(|users| users.contains(user_id))
            .unwrap_or(false);
        if allowed {
            Ok(())
        } else {
            Err(not_participant())
        }
    }
}
