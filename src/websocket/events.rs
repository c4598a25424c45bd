//! Outbound WebSocket frames.
//!
//! Every broadcast frame has the same flat shape:
//! ```json
//! {
//!     "type": "chat_message",
//!     "timestamp": "2025-10-26T10:30:00Z",
//!     "conversation_id": 5,
//!     "user_id": "uuid",
//!     ...event fields
//! }
//! ```
//! `user_id` is the actor that caused the event.

use crate::models::{MessageView, ReactionAction};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebSocketEvent {
    ChatMessage {
        message_id: i64,
        message: MessageView,
    },
    TypingIndicator {
        is_typing: bool,
    },
    ReadReceipt {
        message_id: i64,
        read_at: DateTime<Utc>,
    },
    MessageReaction {
        message_id: i64,
        emoji: String,
        action: ReactionAction,
    },
    MessageEdit {
        message_id: i64,
        message: MessageView,
    },
    MessageDelete {
        message_id: i64,
        message: MessageView,
    },
    UserStatus {
        status: PresenceStatus,
        display_name: String,
    },
}

impl WebSocketEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ChatMessage { .. } => "chat_message",
            Self::TypingIndicator { .. } => "typing_indicator",
            Self::ReadReceipt { .. } => "read_receipt",
            Self::MessageReaction { .. } => "message_reaction",
            Self::MessageEdit { .. } => "message_edit",
            Self::MessageDelete { .. } => "message_delete",
            Self::UserStatus { .. } => "user_status",
        }
    }

    pub fn to_payload_value(
        &self,
        conversation_id: i64,
        user_id: Uuid,
        timestamp: DateTime<Utc>,
    ) -> Result<serde_json::Value, serde_json::Error> {
        let mut payload = serde_json::to_value(self)?;
        if let serde_json::Value::Object(map) = &mut payload {
            map.insert("timestamp".into(), serde_json::json!(timestamp.to_rfc3339()));
            map.insert("conversation_id".into(), serde_json::json!(conversation_id));
            map.insert("user_id".into(), serde_json::json!(user_id));
        }
        Ok(payload)
    }

    /// Serialized frame ready for fan-out.
    pub fn to_broadcast_payload(
        &self,
        conversation_id: i64,
        user_id: Uuid,
        timestamp: DateTime<Utc>,
    ) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_payload_value(conversation_id, user_id, timestamp)?)
    }
}

/// Success acknowledgment sent to the originating session only, after the
/// event's own broadcast.
#[derive(Debug, Clone, Serialize)]
pub struct AckFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ReactionAction>,
    pub timestamp: String,
}

impl AckFrame {
    pub fn new(event: &'static str) -> Self {
        Self {
            kind: "ack",
            event,
            message_id: None,
            action: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn with_message(mut self, message_id: i64) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn with_action(mut self, action: ReactionAction) -> Self {
        self.action = Some(action);
        self
    }
}
