use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Age after which a typing signal no longer counts as active.
pub const TYPING_TTL_SECS: i64 = 10;

/// Lightweight row refreshed on every typing signal. Stale rows are never
/// purged; readers filter with [`TypingIndicator::is_active_at`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypingIndicator {
    pub conversation_id: i64,
    pub user_id: Uuid,
    pub last_activity: DateTime<Utc>,
}

impl TypingIndicator {
    pub fn ttl() -> Duration {
        Duration::seconds(TYPING_TTL_SECS)
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        now - self.last_activity < Self::ttl()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indicator(last_activity: DateTime<Utc>) -> TypingIndicator {
        TypingIndicator {
            conversation_id: 1,
            user_id: Uuid::new_v4(),
            last_activity,
        }
    }

    #[test]
    fn fresh_indicator_is_active() {
        let now = Utc::now();
        assert!(indicator(now - Duration::seconds(3)).is_active_at(now));
    }

    #[test]
    fn indicator_older_than_ttl_is_inactive() {
        let now = Utc::now();
        assert!(!indicator(now - Duration::seconds(11)).is_active_at(now));
        assert!(!indicator(now - Duration::seconds(TYPING_TTL_SECS)).is_active_at(now));
    }
}
