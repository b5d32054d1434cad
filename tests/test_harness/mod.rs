//! In-memory wiring shared by the integration tests.
//!
//! Every collaborator is the in-process implementation, so the suites run
//! without Redis, Postgres or the delayed-delivery service.

#![allow(dead_code)]

use chat_delivery_service::buffer::{EventHub, MemoryBufferStore};
use chat_delivery_service::models::{Chat, Message, MessageInput, MessageType};
use chat_delivery_service::services::{
    ChatServices, ChatSession, FlushPolicy, MemoryChatRepository, RecordingDelivery,
    StaticMembership,
};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

pub const CHAT_ID: &str = "chat-1";
pub const ALICE: &str = "alice";
pub const BOB: &str = "bob";

pub struct TestEnvironment {
    pub hub: Arc<EventHub>,
    pub buffer: Arc<MemoryBufferStore>,
    pub repo: Arc<MemoryChatRepository>,
    pub delivery: Arc<RecordingDelivery>,
    pub membership: Arc<StaticMembership>,
    pub policy: FlushPolicy,
    pub services: ChatServices,
}

impl TestEnvironment {
    pub fn new() -> Self {
        Self::with_batch_size(20)
    }

    /// One chat between alice and bob with an empty durable history.
    pub fn with_batch_size(batch_size: usize) -> Self {
        let hub = EventHub::new(64);
        let buffer = Arc::new(MemoryBufferStore::new(hub.clone()));
        let repo = Arc::new(MemoryChatRepository::new());
        let delivery = Arc::new(RecordingDelivery::new());
        let membership = Arc::new(
            StaticMembership::new()
                .with_member(CHAT_ID, ALICE)
                .with_member(CHAT_ID, BOB),
        );

        repo.insert(Chat {
            id: CHAT_ID.to_string(),
            match_id: "match-1".to_string(),
            created_at: Utc::now(),
            messages: Vec::new(),
        });

        let policy = FlushPolicy {
            batch_size,
            idle_timeout: Duration::from_secs(30),
            retries: 3,
        };
        let services = ChatServices::new(
            buffer.clone(),
            repo.clone(),
            membership.clone(),
            delivery.clone(),
            policy.clone(),
            4,
        );

        Self {
            hub,
            buffer,
            repo,
            delivery,
            membership,
            policy,
            services,
        }
    }

    pub async fn session(&self, user_id: &str) -> ChatSession {
        ChatSession::open(self.services.clone(), CHAT_ID, user_id)
            .await
            .expect("participant should be able to open a session")
    }

    /// Seed the durable record directly, bypassing the buffer.
    pub fn seed_durable(&self, messages: Vec<Message>) {
        let mut chat = self.repo.get(CHAT_ID).expect("chat seeded");
        chat.messages = messages;
        self.repo.insert(chat);
    }
}

pub fn text(content: &str) -> MessageInput {
    MessageInput {
        content: Some(content.to_string()),
        message_type: Some(MessageType::Text),
        ..Default::default()
    }
}

/// Durable message created `minutes_ago` minutes in the past.
pub fn durable_message(id: &str, sender: &str, minutes_ago: i64) -> Message {
    let at = Utc::now() - ChronoDuration::minutes(minutes_ago);
    Message {
        id: id.to_string(),
        chat_id: CHAT_ID.to_string(),
        sender_id: sender.to_string(),
        content: format!("durable {id}"),
        message_type: MessageType::Text,
        media: Vec::new(),
        reactions: Vec::new(),
        created_at: at,
        updated_at: at,
        received: false,
        seen: false,
    }
}
