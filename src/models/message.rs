use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Rendered in place of the content of a soft-deleted message.
pub const DELETED_PLACEHOLDER: &str = "this message has been deleted";

/// External blob reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub url: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Message row. `content` is retained after a soft delete; use
/// [`Message::display_content`] for anything leaving the process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub sender_id: Uuid,
    pub parent_message_id: Option<i64>,
    pub content: String,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<Uuid>,
    pub attachments: Vec<Attachment>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn display_content(&self) -> &str {
        if self.is_deleted {
            DELETED_PLACEHOLDER
        } else {
            &self.content
        }
    }

    pub fn is_thread_reply(&self) -> bool {
        self.parent_message_id.is_some()
    }

    pub fn view(&self, sender_name: Option<&str>) -> MessageView {
        MessageView {
            id: self.id,
            conversation_id: self.conversation_id,
            sender: SenderSummary {
                id: self.sender_id,
                display_name: sender_name.map(str::to_string),
            },
            parent_message_id: self.parent_message_id,
            is_thread_reply: self.is_thread_reply(),
            content: self.display_content().to_string(),
            is_edited: self.is_edited,
            edited_at: self.edited_at,
            is_deleted: self.is_deleted,
            deleted_at: self.deleted_at,
            attachments: if self.is_deleted {
                Vec::new()
            } else {
                self.attachments.clone()
            },
            is_read: self.is_read,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SenderSummary {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// External representation of a message. Deleted messages are already masked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageView {
    pub id: i64,
    pub conversation_id: i64,
    pub sender: SenderSummary,
    pub parent_message_id: Option<i64>,
    pub is_thread_reply: bool,
    pub content: String,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub attachments: Vec<Attachment>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: i64,
    pub sender_id: Uuid,
    pub parent_message_id: Option<i64>,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
}

/// One prior revision of a message's content. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EditRecord {
    pub id: i64,
    pub message_id: i64,
    pub previous_content: String,
    pub edited_by: Uuid,
    pub edited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reaction {
    pub message_id: i64,
    pub user_id: Uuid,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReactionAction {
    Added,
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadReceipt {
    pub message_id: i64,
    pub user_id: Uuid,
    pub read_at: DateTime<Utc>,
}
