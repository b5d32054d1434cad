use super::delivery::{DelayedDelivery, DeliveryRequest, FlushRequest};
use crate::buffer::BufferStore;
use crate::config::FlushConfig;
use crate::error::{AppError, AppResult};
use std::sync::Arc;
use std::time::Duration;

/// Tokens outlive the idle delay by this much so the delayed callback still finds them.
pub const TOKEN_TTL_MARGIN: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct FlushPolicy {
    pub batch_size: usize,
    pub idle_timeout: Duration,
    pub retries: u32,
}

impl FlushPolicy {
    pub fn token_ttl(&self) -> Duration {
        self.idle_timeout + TOKEN_TTL_MARGIN
    }
}

impl From<&FlushConfig> for FlushPolicy {
    fn from(config: &FlushConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            idle_timeout: config.idle_timeout,
            retries: config.retries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledFlush {
    pub token: String,
    pub delay: Duration,
    pub deduplication_id: String,
}

impl ScheduledFlush {
    pub fn is_immediate(&self) -> bool {
        self.delay.is_zero()
    }
}

pub fn deduplication_id(chat_id: &str, token: &str) -> String {
    format!("chat--{chat_id}--flush--{token}")
}

/// Decides when a chat's buffer is committed and asks the delayed-delivery
/// service to call back. Repeated calls inside one window collapse on the
/// deduplication id; a full buffer short-circuits to an immediate flush.
pub struct FlushScheduler {
    buffer: Arc<dyn BufferStore>,
    delivery: Arc<dyn DelayedDelivery>,
    policy: FlushPolicy,
}

impl FlushScheduler {
    pub fn new(
        buffer: Arc<dyn BufferStore>,
        delivery: Arc<dyn DelayedDelivery>,
        policy: FlushPolicy,
    ) -> Self {
        Self {
            buffer,
            delivery,
            policy,
        }
    }

    pub async fn schedule_flush(&self, chat_id: &str) -> AppResult<ScheduledFlush> {
        let length = self.buffer.length(chat_id).await?;
        let token = self
            .buffer
            .get_or_create_flush_token(chat_id, self.policy.token_ttl())
            .await?;

        let window = deduplication_id(chat_id, &token);
        let (delay, deduplication_id) = if length >= self.policy.batch_size {
            // Distinct id so a pending delayed flush for this window does not swallow it.
            (Duration::ZERO, format!("{window}--now"))
        } else {
            (self.policy.idle_timeout, window)
        };

        let request = DeliveryRequest {
            body: FlushRequest {
                chat_id: chat_id.to_string(),
                flush_token: token.clone(),
            },
            delay,
            deduplication_id: deduplication_id.clone(),
            retries: self.policy.retries,
        };

        self.delivery.schedule(&request).await.map_err(|e| match e {
            AppError::Scheduling(_) => e,
            other => AppError::Scheduling(other.to_string()),
        })?;

        tracing::debug!(
            chat_id = %chat_id,
            buffered = length,
            immediate = delay.is_zero(),
            "flush requested"
        );

        Ok(ScheduledFlush {
            token,
            delay,
            deduplication_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{EventHub, MemoryBufferStore};
    use crate::models::{Message, MessageType};
    use crate::services::delivery::RecordingDelivery;
    use chrono::Utc;

    fn message(id: &str) -> Message {
        let now = Utc::now();
        Message {
            id: id.into(),
            chat_id: "c1".into(),
            sender_id: "alice".into(),
            content: "x".into(),
            message_type: MessageType::Text,
            media: vec![],
            reactions: vec![],
            created_at: now,
            updated_at: now,
            received: false,
            seen: false,
        }
    }

    fn scheduler(batch_size: usize) -> (FlushScheduler, Arc<MemoryBufferStore>, Arc<RecordingDelivery>) {
        let buffer = Arc::new(MemoryBufferStore::new(EventHub::new(8)));
        let delivery = Arc::new(RecordingDelivery::new());
        let scheduler = FlushScheduler::new(
            buffer.clone(),
            delivery.clone(),
            FlushPolicy {
                batch_size,
                idle_timeout: Duration::from_secs(30),
                retries: 3,
            },
        );
        (scheduler, buffer, delivery)
    }

    #[tokio::test]
    async fn debounce_requests_share_one_dedup_id() {
        let (scheduler, buffer, delivery) = scheduler(5);
        for n in 0..3 {
            buffer.append("c1", &message(&format!("m{n}"))).await.unwrap();
            scheduler.schedule_flush("c1").await.unwrap();
        }

        let requests = delivery.requests().await;
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.delay == Duration::from_secs(30)));
        assert!(requests
            .iter()
            .all(|r| r.deduplication_id == requests[0].deduplication_id));
        assert_eq!(requests[0].retries, 3);
    }

    #[tokio::test]
    async fn threshold_triggers_immediate_flush_on_nth_append() {
        let (scheduler, buffer, _delivery) = scheduler(3);
        let mut outcomes = Vec::new();
        for n in 0..3 {
            buffer.append("c1", &message(&format!("m{n}"))).await.unwrap();
            outcomes.push(scheduler.schedule_flush("c1").await.unwrap());
        }

        assert!(!outcomes[0].is_immediate());
        assert!(!outcomes[1].is_immediate());
        assert!(outcomes[2].is_immediate());
        assert!(outcomes[2].deduplication_id.ends_with("--now"));
        assert_eq!(outcomes[0].token, outcomes[2].token);
    }

    #[tokio::test]
    async fn delivery_failure_is_a_scheduling_error() {
        let (scheduler, buffer, delivery) = scheduler(3);
        buffer.append("c1", &message("m1")).await.unwrap();
        delivery.set_failing(true);

        let err = scheduler.schedule_flush("c1").await.unwrap_err();
        assert!(matches!(err, AppError::Scheduling(_)));
        assert_eq!(buffer.length("c1").await.unwrap(), 1);
    }
}
