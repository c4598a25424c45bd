use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Conversation row. `participants` is ordered, unique and never empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: i64,
    pub participants: Vec<Uuid>,
    pub subject: Option<String>,
    pub is_group: bool,
    pub organization_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn has_participant(&self, user_id: Uuid) -> bool {
        self.participants.contains(&user_id)
    }

    /// Most recent activity: last message or last update, whichever is later.
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        match self.last_message_at {
            Some(at) if at > self.updated_at => at,
            _ => self.updated_at,
        }
    }
}

/// Canonical key for a 1:1 pair, independent of argument order.
pub fn direct_key(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}

#[derive(Debug, Clone)]
pub struct NewConversation {
    pub participants: Vec<Uuid>,
    pub subject: Option<String>,
    pub is_group: bool,
    pub organization_id: Option<Uuid>,
}

impl NewConversation {
    /// Dedup key when this is a 1:1 conversation.
    pub fn direct_key(&self) -> Option<String> {
        match (self.is_group, self.participants.as_slice()) {
            (false, [a, b]) => Some(direct_key(*a, *b)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateConversationRequest {
    pub participants: Vec<Uuid>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub organization_id: Option<Uuid>,
}
