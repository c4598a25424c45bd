use super::{MessageStore, MAX_PAGE_SIZE};
use crate::error::{AppError, AppResult};
use crate::models::conversation::direct_key;
use crate::models::{
    Conversation, EditRecord, Message, NewConversation, NewMessage, Notification,
    NotificationDraft, Reaction, ReactionAction, ReadReceipt, TypingIndicator,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    next_conversation_id: i64,
    next_message_id: i64,
    next_edit_id: i64,
    next_notification_id: i64,
    conversations: BTreeMap<i64, Conversation>,
    direct_index: HashMap<String, i64>,
    messages: BTreeMap<i64, Message>,
    edits: HashMap<i64, Vec<EditRecord>>,
    reactions: HashMap<i64, Vec<Reaction>>,
    receipts: HashMap<i64, Vec<ReadReceipt>>,
    typing: HashMap<(i64, Uuid), TypingIndicator>,
    notifications: Vec<Notification>,
}

impl Tables {
    fn next_id(counter: &mut i64) -> i64 {
        *counter += 1;
        *counter
    }

    fn message_mut(&mut self, id: i64) -> AppResult<&mut Message> {
        self.messages
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("message {id}")))
    }
}

/// Process-local store. One lock guards every table so each operation
/// commits atomically.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create_conversation(&self, new: NewConversation) -> AppResult<(Conversation, bool)> {
        let mut t = self.tables.write().await;

        let key = new.direct_key();
        if let Some(key) = &key {
            if let Some(existing) = t.direct_index.get(key).and_then(|id| t.conversations.get(id)) {
                return Ok((existing.clone(), false));
            }
        }

        let now = Utc::now();
        let conversation = Conversation {
            id: Tables::next_id(&mut t.next_conversation_id),
            participants: new.participants,
            subject: new.subject,
            is_group: new.is_group,
            organization_id: new.organization_id,
            created_at: now,
            updated_at: now,
            last_message_at: None,
        };
        if let Some(key) = key {
            t.direct_index.insert(key, conversation.id);
        }
        t.conversations.insert(conversation.id, conversation.clone());
        Ok((conversation, true))
    }

    async fn find_direct_conversation(&self, a: Uuid, b: Uuid) -> AppResult<Option<Conversation>> {
        let t = self.tables.read().await;
        Ok(t
            .direct_index
            .get(&direct_key(a, b))
            .and_then(|id| t.conversations.get(id))
            .cloned())
    }

    async fn get_conversation(&self, id: i64) -> AppResult<Option<Conversation>> {
        Ok(self.tables.read().await.conversations.get(&id).cloned())
    }

    async fn conversations_for(&self, user_id: Uuid) -> AppResult<Vec<Conversation>> {
        let t = self.tables.read().await;
        let mut out: Vec<Conversation> = t
            .conversations
            .values()
            .filter(|c| c.has_participant(user_id))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.last_activity_at()
                .cmp(&a.last_activity_at())
                .then(b.id.cmp(&a.id))
        });
        Ok(out)
    }

    async fn get_message(&self, id: i64) -> AppResult<Option<Message>> {
        Ok(self.tables.read().await.messages.get(&id).cloned())
    }

    async fn insert_message(
        &self,
        new: NewMessage,
        notifications: Vec<NotificationDraft>,
    ) -> AppResult<Message> {
        let mut t = self.tables.write().await;

        if !t.conversations.contains_key(&new.conversation_id) {
            return Err(AppError::NotFound(format!(
                "conversation {}",
                new.conversation_id
            )));
        }
        // A dangling parent loses its thread link rather than failing the send.
        let parent_message_id = new.parent_message_id.filter(|p| t.messages.contains_key(p));

        let message = Message {
            id: Tables::next_id(&mut t.next_message_id),
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            parent_message_id,
            content: new.content,
            is_edited: false,
            edited_at: None,
            is_deleted: false,
            deleted_at: None,
            deleted_by: None,
            attachments: new.attachments,
            is_read: false,
            created_at: new.created_at,
            updated_at: new.created_at,
        };

        if let Some(conv) = t.conversations.get_mut(&new.conversation_id) {
            conv.last_message_at = Some(new.created_at);
            conv.updated_at = new.created_at;
        }

        for draft in notifications {
            let id = Tables::next_id(&mut t.next_notification_id);
            t.notifications.push(Notification {
                id,
                recipient_id: draft.recipient_id,
                message_id: message.id,
                kind: draft.kind,
                channel: draft.channel,
                is_sent: false,
                sent_at: None,
                is_read: false,
                read_at: None,
                created_at: new.created_at,
            });
        }

        t.messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn update_message_content(
        &self,
        id: i64,
        editor: Uuid,
        content: String,
        at: DateTime<Utc>,
    ) -> AppResult<Message> {
        let mut t = self.tables.write().await;
        let edit_id = t.next_edit_id + 1;

        let message = t.message_mut(id)?;
        if message.sender_id != editor {
            return Err(AppError::Permission("only the sender may edit a message".into()));
        }
        if message.is_deleted {
            return Err(AppError::InvalidState("message has been deleted".into()));
        }

        let previous_content = std::mem::replace(&mut message.content, content);
        message.is_edited = true;
        message.edited_at = Some(at);
        message.updated_at = at;
        let updated = message.clone();

        t.next_edit_id = edit_id;
        t.edits.entry(id).or_default().push(EditRecord {
            id: edit_id,
            message_id: id,
            previous_content,
            edited_by: editor,
            edited_at: at,
        });
        Ok(updated)
    }

    async fn soft_delete_message(
        &self,
        id: i64,
        requester: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<Message> {
        let mut t = self.tables.write().await;
        let message = t.message_mut(id)?;
        if message.sender_id != requester {
            return Err(AppError::Permission(
                "only the sender may delete a message".into(),
            ));
        }
        if message.is_deleted {
            return Err(AppError::InvalidState("message already deleted".into()));
        }

        message.is_deleted = true;
        message.deleted_at = Some(at);
        message.deleted_by = Some(requester);
        message.updated_at = at;
        Ok(message.clone())
    }

    async fn list_messages(
        &self,
        conversation_id: i64,
        before: Option<i64>,
        limit: usize,
    ) -> AppResult<Vec<Message>> {
        let t = self.tables.read().await;
        let upper = before.unwrap_or(i64::MAX);
        Ok(t
            .messages
            .range(..upper)
            .rev()
            .map(|(_, m)| m)
            .filter(|m| m.conversation_id == conversation_id)
            .take(limit.min(MAX_PAGE_SIZE))
            .cloned()
            .collect())
    }

    async fn edit_history(&self, message_id: i64) -> AppResult<Vec<EditRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .edits
            .get(&message_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn toggle_reaction(
        &self,
        message_id: i64,
        user_id: Uuid,
        emoji: &str,
        at: DateTime<Utc>,
    ) -> AppResult<ReactionAction> {
        let mut t = self.tables.write().await;
        if t.message_mut(message_id)?.is_deleted {
            return Err(AppError::InvalidState(
                "cannot react to a deleted message".into(),
            ));
        }

        let reactions = t.reactions.entry(message_id).or_default();
        if let Some(pos) = reactions
            .iter()
            .position(|r| r.user_id == user_id && r.emoji == emoji)
        {
            reactions.remove(pos);
            return Ok(ReactionAction::Removed);
        }

        reactions.push(Reaction {
            message_id,
            user_id,
            emoji: emoji.to_string(),
            created_at: at,
        });
        Ok(ReactionAction::Added)
    }

    async fn list_reactions(&self, message_id: i64) -> AppResult<Vec<Reaction>> {
        Ok(self
            .tables
            .read()
            .await
            .reactions
            .get(&message_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_read_receipt(
        &self,
        message_id: i64,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<Option<ReadReceipt>> {
        let mut t = self.tables.write().await;
        let message = t.message_mut(message_id)?;
        if message.sender_id == user_id {
            return Ok(None);
        }
        message.is_read = true;

        let receipts = t.receipts.entry(message_id).or_default();
        if receipts.iter().any(|r| r.user_id == user_id) {
            return Ok(None);
        }
        let receipt = ReadReceipt {
            message_id,
            user_id,
            read_at: at,
        };
        receipts.push(receipt.clone());
        Ok(Some(receipt))
    }

    async fn list_read_receipts(&self, message_id: i64) -> AppResult<Vec<ReadReceipt>> {
        Ok(self
            .tables
            .read()
            .await
            .receipts
            .get(&message_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert_typing(
        &self,
        conversation_id: i64,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        self.tables.write().await.typing.insert(
            (conversation_id, user_id),
            TypingIndicator {
                conversation_id,
                user_id,
                last_activity: at,
            },
        );
        Ok(())
    }

    async fn delete_typing(&self, conversation_id: i64, user_id: Uuid) -> AppResult<()> {
        self.tables
            .write()
            .await
            .typing
            .remove(&(conversation_id, user_id));
        Ok(())
    }

    async fn list_typing(&self, conversation_id: i64) -> AppResult<Vec<TypingIndicator>> {
        Ok(self
            .tables
            .read()
            .await
            .typing
            .values()
            .filter(|t| t.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn notifications_for(&self, user_id: Uuid) -> AppResult<Vec<Notification>> {
        let t = self.tables.read().await;
        Ok(t
            .notifications
            .iter()
            .rev()
            .filter(|n| n.recipient_id == user_id)
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> AppResult<()> {
        Ok(())
    }
}
