//! Chat session flows against the in-memory backends.
//!
//! Run: cargo test --test session_flow_test

mod test_harness;

use chat_delivery_service::buffer::BufferStore;
use chat_delivery_service::error::AppError;
use chat_delivery_service::models::{EventKind, MessagePatch};
use chat_delivery_service::services::{ChatSession, FlushOutcome};
use std::time::Duration;
use test_harness::{durable_message, text, TestEnvironment, ALICE, BOB, CHAT_ID};

#[tokio::test]
async fn test_sent_message_is_buffered_unchanged() {
    let env = TestEnvironment::new();
    let alice = env.session(ALICE).await;

    let sent = alice.send(text("hello")).await.unwrap();

    let buffered = env.buffer.read_all(CHAT_ID).await.unwrap();
    assert_eq!(buffered.len(), 1);
    assert_eq!(buffered[0].id, sent.id);
    assert_eq!(buffered[0].sender_id, ALICE);
    assert_eq!(buffered[0].created_at, sent.created_at);
    assert_eq!(buffered[0].chat_id, CHAT_ID);
    assert!(!sent.id.is_empty());
}

#[tokio::test]
async fn test_send_rejects_empty_message() {
    let env = TestEnvironment::new();
    let alice = env.session(ALICE).await;

    let err = alice.send(text("   ")).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert_eq!(env.buffer.length(CHAT_ID).await.unwrap(), 0);
}

#[tokio::test]
async fn test_send_publishes_and_schedules() {
    let env = TestEnvironment::new();
    let alice = env.session(ALICE).await;
    let mut events = env.hub.subscribe(CHAT_ID);

    let sent = alice.send(text("hi")).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, EventKind::MessageSent);
    assert_eq!(event.actor_id, ALICE);
    assert_eq!(event.messages[0].id, sent.id);

    let request = env.delivery.last().await.unwrap();
    assert_eq!(request.body.chat_id, CHAT_ID);
    assert!(!request.delay.is_zero());
}

#[tokio::test]
async fn test_scheduling_failure_keeps_message_buffered() {
    let env = TestEnvironment::new();
    let alice = env.session(ALICE).await;
    env.delivery.set_failing(true);

    let err = alice.send(text("still here")).await.unwrap_err();

    assert!(matches!(err, AppError::Scheduling(_)));
    assert_eq!(env.buffer.length(CHAT_ID).await.unwrap(), 1);
}

#[tokio::test]
async fn test_update_never_touches_identity_fields() {
    let env = TestEnvironment::new();
    let alice = env.session(ALICE).await;
    let sent = alice.send(text("draft")).await.unwrap();

    let patch = MessagePatch {
        content: Some("final".into()),
        ..Default::default()
    };
    let updated = alice.update(&sent.id, patch).await.unwrap();

    assert_eq!(updated.content, "final");
    assert_eq!(updated.id, sent.id);
    assert_eq!(updated.sender_id, sent.sender_id);
    assert_eq!(updated.created_at, sent.created_at);
    assert!(updated.updated_at >= sent.updated_at);
}

#[tokio::test]
async fn test_empty_update_is_rejected() {
    let env = TestEnvironment::new();
    let alice = env.session(ALICE).await;
    let sent = alice.send(text("x")).await.unwrap();

    let err = alice.update(&sent.id, MessagePatch::default()).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn test_update_unknown_message_is_not_found() {
    let env = TestEnvironment::new();
    let alice = env.session(ALICE).await;

    let patch = MessagePatch {
        content: Some("ghost".into()),
        ..Default::default()
    };
    let err = alice.update("missing", patch).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_update_after_flush_goes_to_durable_record() {
    let env = TestEnvironment::new();
    let alice = env.session(ALICE).await;
    let sent = alice.send(text("before flush")).await.unwrap();

    let token = env.delivery.last().await.unwrap().body.flush_token;
    let outcome = env.services.writer.flush(CHAT_ID, &token).await.unwrap();
    assert_eq!(outcome, FlushOutcome::Flushed { appended: 1, skipped: 0 });

    let received = alice.mark_received(&sent.id).await.unwrap();
    assert!(received.received);

    let chat = env.repo.get(CHAT_ID).unwrap();
    assert!(chat.find_message(&sent.id).unwrap().received);
}

#[tokio::test]
async fn test_seen_batch_skips_missing_ids() {
    let env = TestEnvironment::new();
    let alice = env.session(ALICE).await;
    let bob = env.session(BOB).await;

    let m1 = alice.send(text("one")).await.unwrap();
    env.seed_durable(vec![durable_message("m3", ALICE, 5)]);
    let mut events = env.hub.subscribe(CHAT_ID);

    let ids = vec![m1.id.clone(), "m2".to_string(), "m3".to_string()];
    let seen = bob.mark_seen(&ids, BOB).await.unwrap();

    let seen_ids: Vec<&str> = seen.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(seen_ids, vec![m1.id.as_str(), "m3"]);
    assert!(seen.iter().all(|m| m.seen));

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, EventKind::MessageSeen);
    assert_eq!(event.actor_id, BOB);
    assert_eq!(event.messages.len(), 2);
    assert_eq!(env.hub.subscriber_count(CHAT_ID), 1);
}

#[tokio::test]
async fn test_reactions_are_one_per_participant() {
    let env = TestEnvironment::new();
    let alice = env.session(ALICE).await;
    let bob = env.session(BOB).await;
    let sent = alice.send(text("react to me")).await.unwrap();

    alice.add_reaction(&sent.id, "👍").await.unwrap();
    bob.add_reaction(&sent.id, "😂").await.unwrap();
    let after = alice.add_reaction(&sent.id, "🔥").await.unwrap();

    assert_eq!(after.reactions.len(), 2);
    assert_eq!(after.reaction_by(ALICE).unwrap().content, "🔥");
    assert_eq!(after.reaction_by(BOB).unwrap().content, "😂");

    let removed = bob.remove_reaction(&sent.id).await.unwrap();
    assert!(removed.reaction_by(BOB).is_none());
    assert_eq!(removed.reactions.len(), 1);

    // Second removal is a silent no-op: same message back, nothing published.
    let mut events = env.hub.subscribe(CHAT_ID);
    let again = bob.remove_reaction(&sent.id).await.unwrap();
    assert_eq!(again.reactions, removed.reactions);
    assert_eq!(again.updated_at, removed.updated_at);
    let quiet = tokio::time::timeout(Duration::from_millis(100), events.recv()).await;
    assert!(quiet.is_err());
}

#[tokio::test]
async fn test_get_messages_pages_backwards_across_tiers() {
    let env = TestEnvironment::new();
    env.seed_durable(vec![
        durable_message("d1", ALICE, 30),
        durable_message("d2", BOB, 20),
        durable_message("d3", ALICE, 10),
    ]);
    let alice = env.session(ALICE).await;
    let live = alice.send(text("live")).await.unwrap();

    let newest = alice.get_messages(2, None).await.unwrap();
    let ids: Vec<&str> = newest.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["d3", live.id.as_str()]);

    let older = alice.get_messages(2, Some("d3")).await.unwrap();
    let ids: Vec<&str> = older.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["d1", "d2"]);

    let default_page = alice.get_messages(0, None).await.unwrap();
    assert_eq!(default_page.len(), 4);

    let err = alice.get_messages(5, Some("nope")).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_buffered_copy_wins_over_durable_copy() {
    let env = TestEnvironment::new();
    let alice = env.session(ALICE).await;
    let sent = alice.send(text("original")).await.unwrap();

    // Durable holds a stale copy of the same id while the buffer has the edit.
    let mut stale = sent.clone();
    stale.content = "stale".into();
    env.seed_durable(vec![stale]);
    alice
        .update(
            &sent.id,
            MessagePatch {
                content: Some("edited".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let page = alice.get_messages(10, None).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].content, "edited");
    assert_eq!(alice.get_message_by_id(&sent.id).await.unwrap().content, "edited");
}

#[tokio::test]
async fn test_non_participant_cannot_open_session() {
    let env = TestEnvironment::new();

    let err = ChatSession::open(env.services.clone(), CHAT_ID, "mallory")
        .await
        .err()
        .unwrap();
    assert!(matches!(err, AppError::Unauthorized(_)));
}

#[tokio::test]
async fn test_close_is_idempotent_and_final() {
    let env = TestEnvironment::new();
    let alice = env.session(ALICE).await;
    let mut subscription = alice.subscribe();

    assert!(alice.close());
    assert!(!alice.close());
    assert!(alice.is_closed());

    let err = alice.send(text("too late")).await.unwrap_err();
    assert_eq!(err, AppError::Closed);

    let next = tokio::time::timeout(Duration::from_secs(1), subscription.recv())
        .await
        .unwrap();
    assert!(next.is_none());
}
