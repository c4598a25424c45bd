use crate::error::AppResult;
use crate::store::MessageStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Ephemeral online and typing state.
///
/// Online state counts live sessions per (conversation, user). Typing state
/// is the persisted indicator row; liveness is decided by readers through
/// the TTL check, never by a sweeper.
pub struct PresenceTracker {
    store: Arc<dyn MessageStore>,
    online: DashMap<i64, HashMap<Uuid, usize>>,
    last_typing_broadcast: DashMap<(i64, Uuid), Instant>,
    typing_interval: Duration,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn MessageStore>, typing_interval: Duration) -> Self {
        Self {
            store,
            online: DashMap::new(),
            last_typing_broadcast: DashMap::new(),
            typing_interval,
        }
    }

    pub fn session_opened(&self, conversation_id: i64, user_id: Uuid) {
        *self
            .online
            .entry(conversation_id)
            .or_default()
            .entry(user_id)
            .or_insert(0) += 1;
    }

    pub fn session_closed(&self, conversation_id: i64, user_id: Uuid) {
        let emptied = match self.online.get_mut(&conversation_id) {
            Some(mut users) => {
                if let Some(count) = users.get_mut(&user_id) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        users.remove(&user_id);
                    }
                }
                users.is_empty()
            }
            None => false,
        };
        if emptied {
            self.online.remove_if(&conversation_id, |_, users| users.is_empty());
        }
        self.last_typing_broadcast.remove(&(conversation_id, user_id));
    }

    pub fn online_users(&self, conversation_id: i64) -> Vec<Uuid> {
        self.online
            .get(&conversation_id)
            .map(|users| users.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Persists the typing signal and reports whether it should be
    /// broadcast. Starts are throttled to one broadcast per interval per
    /// (conversation, user); stops always go out.
    pub async fn record_typing(
        &self,
        conversation_id: i64,
        user_id: Uuid,
        is_typing: bool,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let key = (conversation_id, user_id);
        if !is_typing {
            self.store.delete_typing(conversation_id, user_id).await?;
            self.last_typing_broadcast.remove(&key);
            return Ok(true);
        }

        self.store.upsert_typing(conversation_id, user_id, at).await?;

        let now = Instant::now();
        let mut broadcast = false;
        self.last_typing_broadcast
            .entry(key)
            .and_modify(|last| {
                if now.duration_since(*last) >= self.typing_interval {
                    *last = now;
                    broadcast = true;
                }
            })
            .or_insert_with(|| {
                broadcast = true;
                now
            });
        Ok(broadcast)
    }

    /// Users whose indicator is younger than the TTL at `now`.
    pub async fn active_typists(&self, conversation_id: i64, now: DateTime<Utc>) -> AppResult<Vec<Uuid>> {
        Ok(self
            .store
            .list_typing(conversation_id)
            .await?
            .into_iter()
            .filter(|t| t.is_active_at(now))
            .map(|t| t.user_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn tracker(interval_ms: u64) -> PresenceTracker {
        PresenceTracker::new(Arc::new(MemoryStore::new()), Duration::from_millis(interval_ms))
    }

    #[test]
    fn online_counts_sessions_per_user() {
        let presence = tracker(0);
        let user = Uuid::new_v4();

        presence.session_opened(1, user);
        presence.session_opened(1, user);
        presence.session_closed(1, user);
        assert_eq!(presence.online_users(1), vec![user]);

        presence.session_closed(1, user);
        assert!(presence.online_users(1).is_empty());
        // closing twice is harmless
        presence.session_closed(1, user);
    }

    #[tokio::test]
    async fn typing_starts_are_throttled_but_stops_are_not() {
        let presence = tracker(60_000);
        let user = Uuid::new_v4();
        let now = Utc::now();

        assert!(presence.record_typing(1, user, true, now).await.unwrap());
        assert!(!presence.record_typing(1, user, true, now).await.unwrap());
        assert!(presence.record_typing(1, user, false, now).await.unwrap());
        assert!(presence.record_typing(1, user, true, now).await.unwrap());
    }

    #[tokio::test]
    async fn stale_indicator_is_not_active_even_if_never_deleted() {
        let presence = tracker(0);
        let fresh = Uuid::new_v4();
        let stale = Uuid::new_v4();
        let now = Utc::now();

        presence
            .record_typing(1, stale, true, now - chrono::Duration::seconds(11))
            .await
            .unwrap();
        presence.record_typing(1, fresh, true, now).await.unwrap();

        assert_eq!(presence.active_typists(1, now).await.unwrap(), vec![fresh]);
        assert_eq!(presence.store.list_typing(1).await.unwrap().len(), 2);
    }
}
