//! Persistence layer for conversations, messages and everything a message owns.
//!
//! Every method is atomic on its own: a caller never observes half of a
//! send (message without notifications) or half of an edit (new content
//! without the history record).

use crate::error::AppResult;
use crate::models::{
    Conversation, EditRecord, Message, NewConversation, NewMessage, Notification,
    NotificationDraft, Reaction, ReactionAction, ReadReceipt, TypingIndicator,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Upper bound for a single history page.
pub const MAX_PAGE_SIZE: usize = 100;

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Inserts a conversation. For 1:1 conversations an existing row with the
    /// same participant pair is returned instead; the flag reports whether a
    /// new row was created.
    async fn create_conversation(&self, new: NewConversation) -> AppResult<(Conversation, bool)>;

    async fn find_direct_conversation(&self, a: Uuid, b: Uuid) -> AppResult<Option<Conversation>>;

    async fn get_conversation(&self, id: i64) -> AppResult<Option<Conversation>>;

    /// Conversations `user_id` participates in, most recently active first.
    async fn conversations_for(&self, user_id: Uuid) -> AppResult<Vec<Conversation>>;

    async fn get_message(&self, id: i64) -> AppResult<Option<Message>>;

    /// Persists the message, bumps the conversation's activity timestamp and
    /// writes one notification per draft.
    async fn insert_message(
        &self,
        new: NewMessage,
        notifications: Vec<NotificationDraft>,
    ) -> AppResult<Message>;

    /// Records the prior content in the edit history and replaces it.
    /// Fails with `Permission` unless `editor` sent the message and with
    /// `InvalidState` if it was soft-deleted.
    async fn update_message_content(
        &self,
        id: i64,
        editor: Uuid,
        content: String,
        at: DateTime<Utc>,
    ) -> AppResult<Message>;

    /// Flags the message deleted. The content column is left untouched.
    async fn soft_delete_message(
        &self,
        id: i64,
        requester: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<Message>;

    /// Newest first, strictly older than `before` when given.
    async fn list_messages(
        &self,
        conversation_id: i64,
        before: Option<i64>,
        limit: usize,
    ) -> AppResult<Vec<Message>>;

    /// Oldest revision first.
    async fn edit_history(&self, message_id: i64) -> AppResult<Vec<EditRecord>>;

    /// Adds the reaction, or removes it if the user already has it. Fails
    /// with `InvalidState` once the message is soft-deleted.
    async fn toggle_reaction(
        &self,
        message_id: i64,
        user_id: Uuid,
        emoji: &str,
        at: DateTime<Utc>,
    ) -> AppResult<ReactionAction>;

    async fn list_reactions(&self, message_id: i64) -> AppResult<Vec<Reaction>>;

    /// Returns the receipt when one was created, `None` if it already existed.
    /// The message's read flag is raised on the first receipt.
    async fn insert_read_receipt(
        &self,
        message_id: i64,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<Option<ReadReceipt>>;

    async fn list_read_receipts(&self, message_id: i64) -> AppResult<Vec<ReadReceipt>>;

    async fn upsert_typing(
        &self,
        conversation_id: i64,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<()>;

    async fn delete_typing(&self, conversation_id: i64, user_id: Uuid) -> AppResult<()>;

    /// All indicator rows, stale ones included.
    async fn list_typing(&self, conversation_id: i64) -> AppResult<Vec<TypingIndicator>>;

    async fn notifications_for(&self, user_id: Uuid) -> AppResult<Vec<Notification>>;

    async fn health_check(&self) -> AppResult<()>;
}
