pub mod delivery;
pub mod membership;
pub mod repository;
pub mod scheduler;
pub mod session;
pub mod writer;

pub use delivery::{DelayedDelivery, DeliveryRequest, FlushRequest, QStashClient, RecordingDelivery};
pub use membership::{MembershipChecker, PgMembership, StaticMembership};
pub use repository::{ChatRepository, MemoryChatRepository, PgChatRepository};
pub use scheduler::{FlushPolicy, FlushScheduler, ScheduledFlush};
pub use session::ChatSession;
pub use writer::{DurableWriter, FlushOutcome};

use crate::buffer::BufferStore;
use crate::error::AppResult;
use std::sync::Arc;

/// Everything a chat session or the flush endpoint needs, wired once at startup.
#[derive(Clone)]
pub struct ChatServices {
    pub buffer: Arc<dyn BufferStore>,
    pub repo: Arc<dyn ChatRepository>,
    pub membership: Arc<dyn MembershipChecker>,
    pub scheduler: Arc<FlushScheduler>,
    pub writer: Arc<DurableWriter>,
    /// Upper bound on concurrent lookups while marking a batch seen.
    pub seen_concurrency: usize,
}

impl ChatServices {
    pub fn new(
        buffer: Arc<dyn BufferStore>,
        repo: Arc<dyn ChatRepository>,
        membership: Arc<dyn MembershipChecker>,
        delivery: Arc<dyn DelayedDelivery>,
        policy: FlushPolicy,
        seen_concurrency: usize,
    ) -> Self {
        let scheduler = Arc::new(FlushScheduler::new(buffer.clone(), delivery, policy));
        let writer = Arc::new(DurableWriter::new(buffer.clone(), repo.clone()));
        Self {
            buffer,
            repo,
            membership,
            scheduler,
            writer,
            seen_concurrency: seen_concurrency.max(1),
        }
    }

    /// Commit the window named by `token`, then make sure nothing is left behind.
    ///
    /// Sends that land while a flush runs still see the old token, so their
    /// schedule request collapses onto the callback being served right now. If
    /// the buffer is not empty once the flush returns, a fresh window is opened
    /// here. A stale callback does the same, so a retried delivery converges too.
    pub async fn flush(&self, chat_id: &str, token: &str) -> AppResult<FlushOutcome> {
        let outcome = self.writer.flush(chat_id, token).await?;

        let remaining = self.buffer.length(chat_id).await?;
        if remaining > 0 {
            let next = self.scheduler.schedule_flush(chat_id).await?;
            tracing::info!(
                chat_id = %chat_id,
                remaining,
                immediate = next.is_immediate(),
                "entries left after flush, next window scheduled"
            );
        }
        Ok(outcome)
    }
}
