use anyhow::{Context, Result};
use redis::aio::{ConnectionManager, PubSub};
use redis::{Client, ErrorKind, RedisError, RedisResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::info;

/// Lower bound for per-command timeouts; anything shorter trips on normal latency spikes.
pub const MIN_COMMAND_TIMEOUT: Duration = Duration::from_millis(50);

/// Redis connection pool: one multiplexed manager for commands plus the
/// client handle needed to open dedicated pub/sub connections.
#[derive(Clone)]
pub struct RedisPool {
    client: Client,
    manager: Arc<Mutex<ConnectionManager>>,
}

impl RedisPool {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).context("failed to parse REDIS_URL connection string")?;
        let connection_manager = ConnectionManager::new(client.clone())
            .await
            .context("failed to initialize Redis connection manager")?;

        info!("Redis connection manager initialized");

        Ok(Self {
            client,
            manager: Arc::new(Mutex::new(connection_manager)),
        })
    }

    /// Clone the multiplexed connection out of the shared manager.
    pub async fn connection(&self) -> ConnectionManager {
        let guard = self.manager.lock().await;
        guard.clone()
    }

    /// PubSub requires a dedicated connection, not the multiplexed one.
    pub async fn pubsub(&self) -> RedisResult<PubSub> {
        self.client.get_async_pubsub().await
    }
}

/// Run a Redis command future, failing with an IO error once `limit` elapses.
pub async fn run_with_timeout<F, T>(limit: Duration, future: F) -> RedisResult<T>
where
    F: Future<Output = RedisResult<T>>,
{
    let limit = limit.max(MIN_COMMAND_TIMEOUT);
    match timeout(limit, future).await {
        Ok(res) => res,
        Err(_) => Err(RedisError::from((
            ErrorKind::IoError,
            "redis command timed out",
        ))),
    }
}
