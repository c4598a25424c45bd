use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewMessage,
    Mention,
    Reply,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::NewMessage => "new_message",
            NotificationKind::Mention => "mention",
            NotificationKind::Reply => "reply",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new_message" => Some(NotificationKind::NewMessage),
            "mention" => Some(NotificationKind::Mention),
            "reply" => Some(NotificationKind::Reply),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryChannel {
    InApp,
    Email,
    Push,
}

impl DeliveryChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryChannel::InApp => "in_app",
            DeliveryChannel::Email => "email",
            DeliveryChannel::Push => "push",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_app" => Some(DeliveryChannel::InApp),
            "email" => Some(DeliveryChannel::Email),
            "push" => Some(DeliveryChannel::Push),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub id: i64,
    pub recipient_id: Uuid,
    pub message_id: i64,
    pub kind: NotificationKind,
    pub channel: DeliveryChannel,
    pub is_sent: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Notification to be written together with the message that triggers it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationDraft {
    pub recipient_id: Uuid,
    pub kind: NotificationKind,
    pub channel: DeliveryChannel,
}
