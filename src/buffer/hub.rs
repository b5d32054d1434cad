use super::{chat_id_from_channel, EVENTS_PATTERN};
use crate::models::ChatEvent;
use dashmap::DashMap;
use futures_util::StreamExt;
use redis_utils::RedisPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;

const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(2);

/// In-process fan-out: one bounded broadcast channel per chat with live subscribers.
///
/// A subscriber that falls more than `capacity` events behind loses the oldest
/// ones; publishers never wait on subscribers.
pub struct EventHub {
    channels: DashMap<String, broadcast::Sender<Arc<ChatEvent>>>,
    capacity: usize,
}

impl EventHub {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        })
    }

    pub fn subscribe(self: &Arc<Self>, chat_id: &str) -> Subscription {
        let receiver = self
            .channels
            .entry(chat_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        tracing::debug!(chat_id = %chat_id, "subscriber attached");

        Subscription {
            chat_id: chat_id.to_string(),
            receiver: Some(receiver),
            shutdown: None,
            hub: Arc::clone(self),
        }
    }

    /// Deliver to every local subscriber of the event's chat. Returns how many received it.
    pub fn dispatch(&self, event: ChatEvent) -> usize {
        match self.channels.get(&event.chat_id) {
            Some(sender) => sender.send(Arc::new(event)).unwrap_or(0),
            None => 0,
        }
    }

    pub fn subscriber_count(&self, chat_id: &str) -> usize {
        self.channels
            .get(chat_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    fn release(&self, chat_id: &str) {
        if self
            .channels
            .remove_if(chat_id, |_, sender| sender.receiver_count() == 0)
            .is_some()
        {
            tracing::debug!(chat_id = %chat_id, "removed idle chat channel");
        }
    }
}

/// Handle on one chat's event stream. Deregisters on `close()` or drop.
pub struct Subscription {
    chat_id: String,
    receiver: Option<broadcast::Receiver<Arc<ChatEvent>>>,
    shutdown: Option<watch::Receiver<bool>>,
    hub: Arc<EventHub>,
}

enum Step {
    Event(Result<Arc<ChatEvent>, RecvError>),
    Shutdown { sender_gone: bool },
}

impl Subscription {
    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    /// Close this handle as soon as `shutdown` flips to true (or its sender goes away).
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn is_closed(&self) -> bool {
        self.receiver.is_none()
    }

    /// Next event in publish order, or `None` once closed.
    pub async fn recv(&mut self) -> Option<Arc<ChatEvent>> {
        loop {
            if self.shutdown_requested() {
                self.close();
                return None;
            }

            let receiver = self.receiver.as_mut()?;
            let step = match self.shutdown.as_mut() {
                Some(shutdown) => tokio::select! {
                    res = receiver.recv() => Step::Event(res),
                    changed = shutdown.changed() => Step::Shutdown { sender_gone: changed.is_err() },
                },
                None => Step::Event(receiver.recv().await),
            };

            match step {
                Step::Event(Ok(event)) => return Some(event),
                Step::Event(Err(RecvError::Lagged(skipped))) => {
                    tracing::warn!(chat_id = %self.chat_id, skipped, "subscriber lagging, dropped oldest events");
                }
                Step::Event(Err(RecvError::Closed)) => {
                    self.close();
                    return None;
                }
                Step::Shutdown { sender_gone } => {
                    if sender_gone {
                        self.close();
                        return None;
                    }
                }
            }
        }
    }

    /// Idempotent.
    pub fn close(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            drop(receiver);
            self.hub.release(&self.chat_id);
            tracing::debug!(chat_id = %self.chat_id, "subscriber detached");
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(false)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Forward every `chat:*:events` publication into the local hub. Reconnects forever.
pub async fn start_psub_listener(pool: RedisPool, hub: Arc<EventHub>) {
    loop {
        if let Err(e) = listen_once(&pool, &hub).await {
            tracing::error!(error = %e, "redis pubsub listener failed");
        } else {
            tracing::warn!("redis pubsub stream ended");
        }
        tokio::time::sleep(LISTENER_RETRY_DELAY).await;
    }
}

async fn listen_once(pool: &RedisPool, hub: &EventHub) -> redis::RedisResult<()> {
    let mut pubsub = pool.pubsub().await?;
    pubsub.psubscribe(EVENTS_PATTERN).await?;
    tracing::info!(pattern = EVENTS_PATTERN, "redis pubsub listener subscribed");

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name().to_string();
        let Some(chat_id) = chat_id_from_channel(&channel) else {
            continue;
        };
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(chat_id = %chat_id, error = %e, "unreadable pubsub payload");
                continue;
            }
        };
        match serde_json::from_str::<ChatEvent>(&payload) {
            Ok(event) if event.chat_id == chat_id => {
                hub.dispatch(event);
            }
            Ok(_) => {
                tracing::warn!(chat_id = %chat_id, "event chat id does not match its channel");
            }
            Err(e) => {
                tracing::warn!(chat_id = %chat_id, error = %e, "malformed chat event");
            }
        }
    }
    Ok(())
}
