use super::{MessageStore, MAX_PAGE_SIZE};
use crate::error::{AppError, AppResult};
use crate::models::conversation::direct_key;
use crate::models::{
    Attachment, Conversation, DeliveryChannel, EditRecord, Message, NewConversation, NewMessage,
    Notification, NotificationDraft, NotificationKind, Reaction, ReactionAction, ReadReceipt,
    TypingIndicator,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::types::Json;
use tokio_postgres::Row;
use uuid::Uuid;

const CONVERSATION_SELECT: &str = "
    SELECT c.id, c.subject, c.is_group, c.organization_id,
           c.created_at, c.updated_at, c.last_message_at,
           ARRAY(
               SELECT p.user_id FROM conversation_participants p
               WHERE p.conversation_id = c.id
               ORDER BY p.position
           ) AS participants
    FROM conversations c";

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, parent_message_id, content,
    is_edited, edited_at, is_deleted, deleted_at, deleted_by, attachments, is_read,
    created_at, updated_at";

fn conversation_from_row(row: &Row) -> Conversation {
    Conversation {
        id: row.get("id"),
        participants: row.get("participants"),
        subject: row.get("subject"),
        is_group: row.get("is_group"),
        organization_id: row.get("organization_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        last_message_at: row.get("last_message_at"),
    }
}

fn message_from_row(row: &Row) -> Message {
    let Json(attachments): Json<Vec<Attachment>> = row.get("attachments");
    Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        sender_id: row.get("sender_id"),
        parent_message_id: row.get("parent_message_id"),
        content: row.get("content"),
        is_edited: row.get("is_edited"),
        edited_at: row.get("edited_at"),
        is_deleted: row.get("is_deleted"),
        deleted_at: row.get("deleted_at"),
        deleted_by: row.get("deleted_by"),
        attachments,
        is_read: row.get("is_read"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn notification_from_row(row: &Row) -> AppResult<Notification> {
    let kind: String = row.get("kind");
    let channel: String = row.get("channel");
    Ok(Notification {
        id: row.get("id"),
        recipient_id: row.get("recipient_id"),
        message_id: row.get("message_id"),
        kind: NotificationKind::parse(&kind)
            .ok_or_else(|| AppError::Storage(format!("unknown notification kind {kind}")))?,
        channel: DeliveryChannel::parse(&channel)
            .ok_or_else(|| AppError::Storage(format!("unknown delivery channel {channel}")))?,
        is_sent: row.get("is_sent"),
        sent_at: row.get("sent_at"),
        is_read: row.get("is_read"),
        read_at: row.get("read_at"),
        created_at: row.get("created_at"),
    })
}

/// Postgres-backed store. Multi-row effects run inside one transaction.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn conversation_by_key(&self, key: &str) -> AppResult<Option<Conversation>> {
        let client = self.pool.get().await?;
        let sql = format!("{CONVERSATION_SELECT} WHERE c.direct_key = $1");
        let row = client.query_opt(sql.as_str(), &[&key]).await?;
        Ok(row.as_ref().map(conversation_from_row))
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn create_conversation(&self, new: NewConversation) -> AppResult<(Conversation, bool)> {
        let key = new.direct_key();
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let inserted = tx
            .query_opt(
                "INSERT INTO conversations (subject, is_group, organization_id, direct_key)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (direct_key) WHERE direct_key IS NOT NULL DO NOTHING
                 RETURNING id",
                &[&new.subject, &new.is_group, &new.organization_id, &key],
            )
            .await?;

        let Some(row) = inserted else {
            tx.rollback().await?;
            drop(client);
            let key = key.ok_or(AppError::Internal)?;
            let existing = self.conversation_by_key(&key).await?.ok_or_else(|| {
                AppError::Storage("direct conversation vanished after conflict".into())
            })?;
            return Ok((existing, false));
        };
        let id: i64 = row.get("id");

        tx.execute(
            "INSERT INTO conversation_participants (conversation_id, user_id, position)
             SELECT $1, t.user_id, t.ord
             FROM UNNEST($2::UUID[]) WITH ORDINALITY AS t(user_id, ord)",
            &[&id, &new.participants],
        )
        .await?;

        let sql = format!("{CONVERSATION_SELECT} WHERE c.id = $1");
        let row = tx.query_one(sql.as_str(), &[&id]).await?;
        tx.commit().await?;

        Ok((conversation_from_row(&row), true))
    }

    async fn find_direct_conversation(&self, a: Uuid, b: Uuid) -> AppResult<Option<Conversation>> {
        self.conversation_by_key(&direct_key(a, b)).await
    }

    async fn get_conversation(&self, id: i64) -> AppResult<Option<Conversation>> {
        let client = self.pool.get().await?;
        let sql = format!("{CONVERSATION_SELECT} WHERE c.id = $1");
        let row = client.query_opt(sql.as_str(), &[&id]).await?;
        Ok(row.as_ref().map(conversation_from_row))
    }

    async fn conversations_for(&self, user_id: Uuid) -> AppResult<Vec<Conversation>> {
        let client = self.pool.get().await?;
        let sql = format!(
            "{CONVERSATION_SELECT}
             WHERE EXISTS (
                 SELECT 1 FROM conversation_participants m
                 WHERE m.conversation_id = c.id AND m.user_id = $1
             )
             ORDER BY GREATEST(c.updated_at, COALESCE(c.last_message_at, c.updated_at)) DESC,
                      c.id DESC"
        );
        let rows = client.query(sql.as_str(), &[&user_id]).await?;
        Ok(rows.iter().map(conversation_from_row).collect())
    }

    async fn get_message(&self, id: i64) -> AppResult<Option<Message>> {
        let client = self.pool.get().await?;
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1");
        let row = client.query_opt(sql.as_str(), &[&id]).await?;
        Ok(row.as_ref().map(message_from_row))
    }

    async fn insert_message(
        &self,
        new: NewMessage,
        notifications: Vec<NotificationDraft>,
    ) -> AppResult<Message> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let sql = format!(
            "INSERT INTO messages
                 (conversation_id, sender_id, parent_message_id, content, attachments,
                  created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $6)
             RETURNING {MESSAGE_COLUMNS}"
        );
        let row = tx
            .query_one(
                sql.as_str(),
                &[
                    &new.conversation_id,
                    &new.sender_id,
                    &new.parent_message_id,
                    &new.content,
                    &Json(&new.attachments),
                    &new.created_at,
                ],
            )
            .await?;
        let message = message_from_row(&row);

        tx.execute(
            "UPDATE conversations SET last_message_at = $2, updated_at = $2 WHERE id = $1",
            &[&new.conversation_id, &new.created_at],
        )
        .await?;

        if !notifications.is_empty() {
            let stmt = tx
                .prepare(
                    "INSERT INTO notifications (recipient_id, message_id, kind, channel, created_at)
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .await?;
            for draft in &notifications {
                tx.execute(
                    &stmt,
                    &[
                        &draft.recipient_id,
                        &message.id,
                        &draft.kind.as_str(),
                        &draft.channel.as_str(),
                        &new.created_at,
                    ],
                )
                .await?;
            }
        }

        tx.commit().await?;
        Ok(message)
    }

    async fn update_message_content(
        &self,
        id: i64,
        editor: Uuid,
        content: String,
        at: DateTime<Utc>,
    ) -> AppResult<Message> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(
                "SELECT sender_id, is_deleted FROM messages WHERE id = $1 FOR UPDATE",
                &[&id],
            )
            .await?
            .ok_or_else(|| AppError::NotFound(format!("message {id}")))?;
        let sender_id: Uuid = row.get("sender_id");
        let is_deleted: bool = row.get("is_deleted");
        if sender_id != editor {
            return Err(AppError::Permission("only the sender may edit a message".into()));
        }
        if is_deleted {
            return Err(AppError::InvalidState("message has been deleted".into()));
        }

        tx.execute(
            "INSERT INTO message_edits (message_id, previous_content, edited_by, edited_at)
             SELECT id, content, $2, $3 FROM messages WHERE id = $1",
            &[&id, &editor, &at],
        )
        .await?;

        let sql = format!(
            "UPDATE messages
             SET content = $2, is_edited = TRUE, edited_at = $3, updated_at = $3
             WHERE id = $1
             RETURNING {MESSAGE_COLUMNS}"
        );
        let row = tx.query_one(sql.as_str(), &[&id, &content, &at]).await?;
        tx.commit().await?;

        Ok(message_from_row(&row))
    }

    async fn soft_delete_message(
        &self,
        id: i64,
        requester: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<Message> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(
                "SELECT sender_id, is_deleted FROM messages WHERE id = $1 FOR UPDATE",
                &[&id],
            )
            .await?
            .ok_or_else(|| AppError::NotFound(format!("message {id}")))?;
        let sender_id: Uuid = row.get("sender_id");
        let is_deleted: bool = row.get("is_deleted");
        if sender_id != requester {
            return Err(AppError::Permission(
                "only the sender may delete a message".into(),
            ));
        }
        if is_deleted {
            return Err(AppError::InvalidState("message already deleted".into()));
        }

        let sql = format!(
            "UPDATE messages
             SET is_deleted = TRUE, deleted_at = $2, deleted_by = $3, updated_at = $2
             WHERE id = $1
             RETURNING {MESSAGE_COLUMNS}"
        );
        let row = tx.query_one(sql.as_str(), &[&id, &at, &requester]).await?;
        tx.commit().await?;

        Ok(message_from_row(&row))
    }

    async fn list_messages(
        &self,
        conversation_id: i64,
        before: Option<i64>,
        limit: usize,
    ) -> AppResult<Vec<Message>> {
        let client = self.pool.get().await?;
        let limit = limit.min(MAX_PAGE_SIZE) as i64;
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = $1 AND ($2::BIGINT IS NULL OR id < $2)
             ORDER BY id DESC
             LIMIT $3"
        );
        let rows = client
            .query(sql.as_str(), &[&conversation_id, &before, &limit])
            .await?;
        Ok(rows.iter().map(message_from_row).collect())
    }

    async fn edit_history(&self, message_id: i64) -> AppResult<Vec<EditRecord>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT id, message_id, previous_content, edited_by, edited_at
                 FROM message_edits WHERE message_id = $1 ORDER BY id",
                &[&message_id],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| EditRecord {
                id: row.get("id"),
                message_id: row.get("message_id"),
                previous_content: row.get("previous_content"),
                edited_by: row.get("edited_by"),
                edited_at: row.get("edited_at"),
            })
            .collect())
    }

    async fn toggle_reaction(
        &self,
        message_id: i64,
        user_id: Uuid,
        emoji: &str,
        at: DateTime<Utc>,
    ) -> AppResult<ReactionAction> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(
                "SELECT is_deleted FROM messages WHERE id = $1 FOR UPDATE",
                &[&message_id],
            )
            .await?
            .ok_or_else(|| AppError::NotFound(format!("message {message_id}")))?;
        if row.get::<_, bool>("is_deleted") {
            return Err(AppError::InvalidState(
                "cannot react to a deleted message".into(),
            ));
        }

        let removed = tx
            .execute(
                "DELETE FROM message_reactions
                 WHERE message_id = $1 AND user_id = $2 AND emoji = $3",
                &[&message_id, &user_id, &emoji],
            )
            .await?;

        let action = if removed > 0 {
            ReactionAction::Removed
        } else {
            tx.execute(
                "INSERT INTO message_reactions (message_id, user_id, emoji, created_at)
                 VALUES ($1, $2, $3, $4)",
                &[&message_id, &user_id, &emoji, &at],
            )
            .await?;
            ReactionAction::Added
        };

        tx.commit().await?;
        Ok(action)
    }

    async fn list_reactions(&self, message_id: i64) -> AppResult<Vec<Reaction>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT message_id, user_id, emoji, created_at
                 FROM message_reactions WHERE message_id = $1 ORDER BY created_at",
                &[&message_id],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| Reaction {
                message_id: row.get("message_id"),
                user_id: row.get("user_id"),
                emoji: row.get("emoji"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn insert_read_receipt(
        &self,
        message_id: i64,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<Option<ReadReceipt>> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(
                "SELECT sender_id FROM messages WHERE id = $1 FOR UPDATE",
                &[&message_id],
            )
            .await?
            .ok_or_else(|| AppError::NotFound(format!("message {message_id}")))?;
        let sender_id: Uuid = row.get("sender_id");
        if sender_id == user_id {
            return Ok(None);
        }

        let inserted = tx
            .query_opt(
                "INSERT INTO read_receipts (message_id, user_id, read_at)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (message_id, user_id) DO NOTHING
                 RETURNING read_at",
                &[&message_id, &user_id, &at],
            )
            .await?;
        tx.execute(
            "UPDATE messages SET is_read = TRUE WHERE id = $1 AND NOT is_read",
            &[&message_id],
        )
        .await?;
        tx.commit().await?;

        Ok(inserted.map(|row| ReadReceipt {
            message_id,
            user_id,
            read_at: row.get("read_at"),
        }))
    }

    async fn list_read_receipts(&self, message_id: i64) -> AppResult<Vec<ReadReceipt>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT message_id, user_id, read_at
                 FROM read_receipts WHERE message_id = $1 ORDER BY read_at",
                &[&message_id],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| ReadReceipt {
                message_id: row.get("message_id"),
                user_id: row.get("user_id"),
                read_at: row.get("read_at"),
            })
            .collect())
    }

    async fn upsert_typing(
        &self,
        conversation_id: i64,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO typing_indicators (conversation_id, user_id, last_activity)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (conversation_id, user_id)
                 DO UPDATE SET last_activity = EXCLUDED.last_activity",
                &[&conversation_id, &user_id, &at],
            )
            .await?;
        Ok(())
    }

    async fn delete_typing(&self, conversation_id: i64, user_id: Uuid) -> AppResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "DELETE FROM typing_indicators WHERE conversation_id = $1 AND user_id = $2",
                &[&conversation_id, &user_id],
            )
            .await?;
        Ok(())
    }

    async fn list_typing(&self, conversation_id: i64) -> AppResult<Vec<TypingIndicator>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT conversation_id, user_id, last_activity
                 FROM typing_indicators WHERE conversation_id = $1",
                &[&conversation_id],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| TypingIndicator {
                conversation_id: row.get("conversation_id"),
                user_id: row.get("user_id"),
                last_activity: row.get("last_activity"),
            })
            .collect())
    }

    async fn notifications_for(&self, user_id: Uuid) -> AppResult<Vec<Notification>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT id, recipient_id, message_id, kind, channel, is_sent, sent_at,
                        is_read, read_at, created_at
                 FROM notifications WHERE recipient_id = $1
                 ORDER BY id DESC
                 LIMIT 200",
                &[&user_id],
            )
            .await?;
        rows.iter().map(notification_from_row).collect()
    }

    async fn health_check(&self) -> AppResult<()> {
        let client = self.pool.get().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }
}
