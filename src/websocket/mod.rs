use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::metrics;

pub mod events;
pub mod message_types;
pub mod session;

/// Unique identifier for a WebSocket subscriber
///
/// Each WebSocket connection gets a unique subscriber ID when it registers.
/// This allows for precise cleanup when connections close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// Fan-out seam used by the router. The in-process registry is one
/// implementation; a cross-process bus can be another.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Delivers `frame` to every session of the conversation. Returns the
    /// number of sessions that accepted it.
    async fn broadcast(&self, conversation_id: i64, frame: String) -> usize;

    /// Same as [`Broadcaster::broadcast`] but skips every session of `user_id`.
    async fn broadcast_except_user(&self, conversation_id: i64, user_id: Uuid, frame: String)
        -> usize;
}

/// Subscriber entry with ID and bounded channel
struct Subscriber {
    id: SubscriberId,
    user_id: Uuid,
    sender: mpsc::Sender<String>,
}

/// Connection registry for WebSocket subscribers
///
/// Tracks which sessions are subscribed to which conversations. Each
/// conversation's group is guarded on its own: fan-out holds that entry for
/// the whole delivery, so a join or leave lands entirely before or entirely
/// after any broadcast, and other conversations are not held up.
#[derive(Clone)]
pub struct ConnectionRegistry {
    // conversation_id -> list of subscribers
    inner: Arc<DashMap<i64, Vec<Subscriber>>>,
    buffer: usize,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ConnectionRegistry {
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Add a subscriber to a conversation
    ///
    /// The receiver yields every frame addressed to this session. It ends
    /// once the subscriber is removed or evicted.
    pub async fn add_subscriber(
        &self,
        conversation_id: i64,
        user_id: Uuid,
    ) -> (SubscriberId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let subscriber_id = SubscriberId::new();

        let mut subscribers = self.inner.entry(conversation_id).or_default();
        subscribers.push(Subscriber {
            id: subscriber_id,
            user_id,
            sender: tx,
        });

        tracing::debug!(
            ?subscriber_id,
            conversation_id,
            total = subscribers.len(),
            "subscriber added"
        );

        (subscriber_id, rx)
    }

    /// Remove a specific subscriber from a conversation
    ///
    /// Must be called when a WebSocket connection closes. Returns false if the
    /// subscriber was already gone (for example after an eviction).
    pub async fn remove_subscriber(&self, conversation_id: i64, subscriber_id: SubscriberId) -> bool {
        let removed = {
            let Some(mut subscribers) = self.inner.get_mut(&conversation_id) else {
                return false;
            };
            let before = subscribers.len();
            subscribers.retain(|s| s.id != subscriber_id);
            let removed = before != subscribers.len();

            if removed {
                tracing::debug!(
                    ?subscriber_id,
                    conversation_id,
                    remaining = subscribers.len(),
                    "subscriber removed"
                );
            }
            removed
        };
        self.prune(conversation_id);
        removed
    }

    /// Queues a frame for one session only (acks and error frames).
    pub async fn send_to(&self, conversation_id: i64, subscriber_id: SubscriberId, frame: String) -> bool {
        self.deliver(conversation_id, frame, |s| s.id == subscriber_id) > 0
    }

    /// Get subscriber count for a conversation
    pub async fn subscriber_count(&self, conversation_id: i64) -> usize {
        self.inner
            .get(&conversation_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Number of conversations with at least one live subscriber.
    pub fn active_conversations(&self) -> usize {
        self.inner.len()
    }

    fn prune(&self, conversation_id: i64) {
        self.inner
            .remove_if(&conversation_id, |_, subscribers| subscribers.is_empty());
    }

    /// Pushes `frame` to every matching subscriber without waiting. A full
    /// queue marks a slow consumer: it is dropped from the group, which ends
    /// its receiver and closes the session. Closed queues are pruned too.
    fn deliver<F>(&self, conversation_id: i64, frame: String, mut select: F) -> usize
    where
        F: FnMut(&Subscriber) -> bool,
    {
        let delivered = {
            let Some(mut subscribers) = self.inner.get_mut(&conversation_id) else {
                return 0;
            };

            let mut delivered = 0;
            subscribers.retain(|subscriber| {
                if !select(subscriber) {
                    return true;
                }
                match subscriber.sender.try_send(frame.clone()) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(TrySendError::Full(_)) => {
                        metrics::FANOUT_EVICTIONS.inc();
                        tracing::warn!(
                            subscriber_id = ?subscriber.id,
                            user_id = %subscriber.user_id,
                            conversation_id,
                            "outbound queue full, evicting slow consumer"
                        );
                        false
                    }
                    Err(TrySendError::Closed(_)) => false,
                }
            });
            delivered
        };
        self.prune(conversation_id);
        delivered
    }
}

#[async_trait]
impl Broadcaster for ConnectionRegistry {
    async fn broadcast(&self, conversation_id: i64, frame: String) -> usize {
        self.deliver(conversation_id, frame, |_| true)
    }

    async fn broadcast_except_user(
        &self,
        conversation_id: i64,
        user_id: Uuid,
        frame: String,
    ) -> usize {
        self.deliver(conversation_id, frame, |s| s.user_id != user_id)
    }
}
