//! Message lifecycle events: validate, persist, broadcast.
//!
//! Each operation validates its input and membership before touching the
//! conversation lock. The lock is then held across exactly one store call
//! and a non-blocking fan-out, so broadcast order equals commit order within
//! a conversation while different conversations never wait on each other.

use crate::config::LimitsConfig;
use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthenticatedUser;
use crate::models::{
    Attachment, DeliveryChannel, Message, NewMessage, NotificationDraft, NotificationKind,
    ReactionAction, ReadReceipt,
};
use crate::services::conversation_service::ConversationRegistry;
use crate::services::presence::PresenceTracker;
use crate::store::MessageStore;
use crate::websocket::events::{PresenceStatus, WebSocketEvent};
use crate::websocket::Broadcaster;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

pub const MAX_EMOJI_BYTES: usize = 32;
pub const MAX_ATTACHMENTS: usize = 10;

pub struct MessageEventRouter {
    store: Arc<dyn MessageStore>,
    conversations: Arc<ConversationRegistry>,
    presence: Arc<PresenceTracker>,
    broadcaster: Arc<dyn Broadcaster>,
    limits: LimitsConfig,
    send_limiter: DefaultKeyedRateLimiter<Uuid>,
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

struct ConversationGuard<'a> {
    locks: &'a DashMap<i64, Arc<Mutex<()>>>,
    conversation_id: i64,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ConversationGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map's own reference left: nobody holds or awaits it.
        self.locks
            .remove_if(&self.conversation_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl MessageEventRouter {
    pub fn new(
        store: Arc<dyn MessageStore>,
        conversations: Arc<ConversationRegistry>,
        presence: Arc<PresenceTracker>,
        broadcaster: Arc<dyn Broadcaster>,
        limits: LimitsConfig,
    ) -> Self {
        let per_second = NonZeroU32::new(limits.message_rate_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(limits.message_rate_burst).unwrap_or(per_second);
        let quota = Quota::per_second(per_second).allow_burst(burst);

        Self {
            store,
            conversations,
            presence,
            broadcaster,
            limits,
            send_limiter: RateLimiter::keyed(quota),
            locks: DashMap::new(),
        }
    }

    /// Persists a new message with one notification per other participant,
    /// then broadcasts `chat_message` to every session, the sender's included.
    pub async fn send(
        &self,
        conversation_id: i64,
        sender: &AuthenticatedUser,
        content: String,
        parent_message_id: Option<i64>,
        attachments: Vec<Attachment>,
    ) -> AppResult<Message> {
        self.validate_content(&content)?;
        validate_attachments(&attachments)?;
        let participants = self.member_list(conversation_id, sender.id).await?;

        if self.send_limiter.check_key(&sender.id).is_err() {
            tracing::debug!(user_id = %sender.id, conversation_id, "send rate limited");
            return Err(AppError::RateLimited);
        }

        let parent = match parent_message_id {
            Some(parent_id) => match self.message_in(conversation_id, parent_id).await {
                Ok(parent) => Some(parent),
                Err(AppError::NotFound(_)) => {
                    return Err(AppError::Validation(
                        "parent message must belong to this conversation".into(),
                    ))
                }
                Err(e) => return Err(e),
            },
            None => None,
        };

        let drafts: Vec<NotificationDraft> = participants
            .iter()
            .copied()
            .filter(|p| *p != sender.id)
            .map(|recipient| NotificationDraft {
                recipient_id: recipient,
                kind: notification_kind(recipient, &content, parent.as_ref()),
                channel: DeliveryChannel::InApp,
            })
            .collect();

        let _ordered = self.lock_conversation(conversation_id).await;

        let now = Utc::now();
        let message = self
            .store
            .insert_message(
                NewMessage {
                    conversation_id,
                    sender_id: sender.id,
                    parent_message_id,
                    content,
                    attachments,
                    created_at: now,
                },
                drafts,
            )
            .await?;

        let event = WebSocketEvent::ChatMessage {
            message_id: message.id,
            message: message.view(Some(&sender.display_name)),
        };
        self.publish(conversation_id, sender.id, &event, now).await?;

        tracing::debug!(conversation_id, message_id = message.id, "message sent");
        Ok(message)
    }

    /// Only the sender may edit, and never after a soft delete. The prior
    /// content goes to the edit history in the same commit.
    pub async fn edit(
        &self,
        conversation_id: i64,
        editor: &AuthenticatedUser,
        message_id: i64,
        content: String,
    ) -> AppResult<Message> {
        self.validate_content(&content)?;
        self.ensure_member(conversation_id, editor.id).await?;
        self.message_in(conversation_id, message_id).await?;

        let _ordered = self.lock_conversation(conversation_id).await;

        let now = Utc::now();
        let message = self
            .store
            .update_message_content(message_id, editor.id, content, now)
            .await?;

        let event = WebSocketEvent::MessageEdit {
            message_id,
            message: message.view(Some(&editor.display_name)),
        };
        self.publish(conversation_id, editor.id, &event, now).await?;
        Ok(message)
    }

    pub async fn soft_delete(
        &self,
        conversation_id: i64,
        requester: &AuthenticatedUser,
        message_id: i64,
    ) -> AppResult<Message> {
        self.ensure_member(conversation_id, requester.id).await?;
        self.message_in(conversation_id, message_id).await?;

        let _ordered = self.lock_conversation(conversation_id).await;

        let now = Utc::now();
        let message = self
            .store
            .soft_delete_message(message_id, requester.id, now)
            .await?;

        let event = WebSocketEvent::MessageDelete {
            message_id,
            message: message.view(Some(&requester.display_name)),
        };
        self.publish(conversation_id, requester.id, &event, now).await?;
        Ok(message)
    }

    /// Toggles the (message, user, emoji) reaction.
    pub async fn react(
        &self,
        conversation_id: i64,
        user: &AuthenticatedUser,
        message_id: i64,
        emoji: &str,
    ) -> AppResult<ReactionAction> {
        let emoji = emoji.trim();
        if emoji.is_empty() {
            return Err(AppError::Validation("emoji must not be empty".into()));
        }
        if emoji.len() > MAX_EMOJI_BYTES {
            return Err(AppError::Validation(format!(
                "emoji must be at most {MAX_EMOJI_BYTES} bytes"
            )));
        }
        self.ensure_member(conversation_id, user.id).await?;
        let message = self.message_in(conversation_id, message_id).await?;
        if message.is_deleted {
            return Err(AppError::InvalidState(
                "cannot react to a deleted message".into(),
            ));
        }

        let _ordered = self.lock_conversation(conversation_id).await;

        let now = Utc::now();
        let action = self
            .store
            .toggle_reaction(message_id, user.id, emoji, now)
            .await?;

        let event = WebSocketEvent::MessageReaction {
            message_id,
            emoji: emoji.to_string(),
            action,
        };
        self.publish(conversation_id, user.id, &event, now).await?;
        Ok(action)
    }

    /// Reading your own message is a no-op, as is re-reading. Only a newly
    /// created receipt is broadcast.
    pub async fn mark_read(
        &self,
        conversation_id: i64,
        reader: &AuthenticatedUser,
        message_id: i64,
    ) -> AppResult<Option<ReadReceipt>> {
        self.ensure_member(conversation_id, reader.id).await?;
        let message = self.message_in(conversation_id, message_id).await?;
        if message.sender_id == reader.id {
            return Ok(None);
        }

        let _ordered = self.lock_conversation(conversation_id).await;

        let receipt = self
            .store
            .insert_read_receipt(message_id, reader.id, Utc::now())
            .await?;

        if let Some(receipt) = &receipt {
            let event = WebSocketEvent::ReadReceipt {
                message_id,
                read_at: receipt.read_at,
            };
            self.publish(conversation_id, reader.id, &event, receipt.read_at)
                .await?;
        }
        Ok(receipt)
    }

    /// Refreshes or clears the typing indicator and tells every other
    /// session. Returns whether a broadcast went out (starts are throttled).
    pub async fn set_typing(
        &self,
        conversation_id: i64,
        user: &AuthenticatedUser,
        is_typing: bool,
    ) -> AppResult<bool> {
        self.ensure_member(conversation_id, user.id).await?;

        let _ordered = self.lock_conversation(conversation_id).await;

        let now = Utc::now();
        let should_broadcast = self
            .presence
            .record_typing(conversation_id, user.id, is_typing, now)
            .await?;
        if !should_broadcast {
            return Ok(false);
        }

        let frame = WebSocketEvent::TypingIndicator { is_typing }
            .to_broadcast_payload(conversation_id, user.id, now)
            .map_err(serialization_error)?;
        self.broadcaster
            .broadcast_except_user(conversation_id, user.id, frame)
            .await;
        Ok(true)
    }

    /// Marks a session online and announces it to the conversation.
    pub async fn session_joined(&self, conversation_id: i64, user: &AuthenticatedUser) {
        self.presence.session_opened(conversation_id, user.id);
        self.announce(conversation_id, user, PresenceStatus::Online)
            .await;
    }

    /// Counterpart of [`MessageEventRouter::session_joined`]; call exactly once per session.
    pub async fn session_left(&self, conversation_id: i64, user: &AuthenticatedUser) {
        self.presence.session_closed(conversation_id, user.id);
        self.announce(conversation_id, user, PresenceStatus::Offline)
            .await;
    }

    async fn announce(&self, conversation_id: i64, user: &AuthenticatedUser, status: PresenceStatus) {
        let event = WebSocketEvent::UserStatus {
            status,
            display_name: user.display_name.clone(),
        };
        let _ordered = self.lock_conversation(conversation_id).await;
        if let Err(e) = self.publish(conversation_id, user.id, &event, Utc::now()).await {
            tracing::warn!(conversation_id, user_id = %user.id, error = %e, "presence broadcast failed");
        }
    }

    /// Serializes events within one conversation. The entry is dropped from
    /// the map when the last holder or waiter releases it.
    async fn lock_conversation(&self, conversation_id: i64) -> ConversationGuard<'_> {
        let lock = self
            .locks
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        ConversationGuard {
            locks: &self.locks,
            conversation_id,
            guard: Some(guard),
        }
    }

    async fn publish(
        &self,
        conversation_id: i64,
        actor: Uuid,
        event: &WebSocketEvent,
        at: DateTime<Utc>,
    ) -> AppResult<usize> {
        let frame = event
            .to_broadcast_payload(conversation_id, actor, at)
            .map_err(serialization_error)?;
        let delivered = self.broadcaster.broadcast(conversation_id, frame).await;
        tracing::debug!(
            conversation_id,
            event = event.event_type(),
            delivered,
            "event broadcast"
        );
        Ok(delivered)
    }

    async fn member_list(&self, conversation_id: i64, user_id: Uuid) -> AppResult<Arc<Vec<Uuid>>> {
        self.conversations
            .participants(conversation_id)
            .await?
            .filter(|members| members.contains(&user_id))
            .ok_or_else(|| AppError::NotFound(format!("conversation {conversation_id}")))
    }

    async fn ensure_member(&self, conversation_id: i64, user_id: Uuid) -> AppResult<()> {
        self.member_list(conversation_id, user_id).await.map(|_| ())
    }

    /// The message, provided it lives in `conversation_id`.
    async fn message_in(&self, conversation_id: i64, message_id: i64) -> AppResult<Message> {
        match self.store.get_message(message_id).await? {
            Some(message) if message.conversation_id == conversation_id => Ok(message),
            _ => Err(AppError::NotFound(format!("message {message_id}"))),
        }
    }

    fn validate_content(&self, content: &str) -> AppResult<()> {
        if content.trim().is_empty() {
            return Err(AppError::Validation(
                "message content must not be empty".into(),
            ));
        }
        if content.chars().count() > self.limits.max_message_length {
            return Err(AppError::Validation(format!(
                "message content exceeds {} characters",
                self.limits.max_message_length
            )));
        }
        Ok(())
    }
}

fn validate_attachments(attachments: &[Attachment]) -> AppResult<()> {
    if attachments.len() > MAX_ATTACHMENTS {
        return Err(AppError::Validation(format!(
            "at most {MAX_ATTACHMENTS} attachments per message"
        )));
    }
    if attachments.iter().any(|a| a.url.trim().is_empty()) {
        return Err(AppError::Validation("attachment url must not be empty".into()));
    }
    Ok(())
}

fn notification_kind(recipient: Uuid, content: &str, parent: Option<&Message>) -> NotificationKind {
    if parent.is_some_and(|p| p.sender_id == recipient) {
        NotificationKind::Reply
    } else if content.contains(&format!("@{recipient}")) {
        NotificationKind::Mention
    } else {
        NotificationKind::NewMessage
    }
}

fn serialization_error(e: serde_json::Error) -> AppError {
    tracing::error!(error = %e, "failed to serialize event");
    AppError::Internal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::conversation::CreateConversationRequest;
    use crate::models::{
        Conversation, EditRecord, NewConversation, Notification, Reaction, TypingIndicator,
    };
    use crate::store::MemoryStore;
    use crate::websocket::ConnectionRegistry;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;

    struct Fixture {
        router: MessageEventRouter,
        store: Arc<dyn MessageStore>,
        registry: ConnectionRegistry,
        conversation: Conversation,
        alice: AuthenticatedUser,
        bob: AuthenticatedUser,
    }

    fn user(name: &str) -> AuthenticatedUser {
        AuthenticatedUser {
            id: Uuid::new_v4(),
            display_name: name.into(),
            email: None,
        }
    }

    async fn fixture_with(store: Arc<dyn MessageStore>, limits: LimitsConfig) -> Fixture {
        let registry = ConnectionRegistry::new(64);
        let conversations = Arc::new(ConversationRegistry::new(store.clone(), 16));
        let presence = Arc::new(PresenceTracker::new(
            store.clone(),
            limits.typing_broadcast_interval,
        ));
        let alice = user("alice");
        let bob = user("bob");
        let (conversation, _) = conversations
            .create(
                alice.id,
                CreateConversationRequest {
                    participants: vec![bob.id],
                    subject: None,
                    is_group: false,
                    organization_id: None,
                },
            )
            .await
            .unwrap();
        let router = MessageEventRouter::new(
            store.clone(),
            conversations,
            presence,
            Arc::new(registry.clone()),
            limits,
        );
        Fixture {
            router,
            store,
            registry,
            conversation,
            alice,
            bob,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryStore::new()), LimitsConfig::default()).await
    }

    fn next_frame(rx: &mut Receiver<String>) -> serde_json::Value {
        let frame = rx.try_recv().expect("expected a queued frame");
        serde_json::from_str(&frame).unwrap()
    }

    #[tokio::test]
    async fn empty_content_creates_nothing_and_broadcasts_nothing() {
        let f = fixture().await;
        let (_, mut rx) = f.registry.add_subscriber(f.conversation.id, f.bob.id).await;

        for content in ["", "   \n\t"] {
            let err = f
                .router
                .send(f.conversation.id, &f.alice, content.into(), None, vec![])
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::Validation(_)));
        }
        assert!(f.store.list_messages(f.conversation.id, None, 10).await.unwrap().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_notifies_other_participants_with_kind() {
        let f = fixture().await;
        let first = f
            .router
            .send(f.conversation.id, &f.bob, "question".into(), None, vec![])
            .await
            .unwrap();
        f.router
            .send(f.conversation.id, &f.alice, "answer".into(), Some(first.id), vec![])
            .await
            .unwrap();
        f.router
            .send(
                f.conversation.id,
                &f.alice,
                format!("ping @{}", f.bob.id),
                None,
                vec![],
            )
            .await
            .unwrap();

        let kinds: Vec<_> = f
            .store
            .notifications_for(f.bob.id)
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.kind)
            .collect();
        assert_eq!(kinds, vec![NotificationKind::Mention, NotificationKind::Reply]);
        assert_eq!(f.store.notifications_for(f.alice.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn parent_from_another_conversation_is_rejected() {
        let f = fixture().await;
        let carol = user("carol");
        let conversations = ConversationRegistry::new(f.store.clone(), 16);
        let (other, _) = conversations
            .create(
                f.alice.id,
                CreateConversationRequest {
                    participants: vec![carol.id],
                    subject: None,
                    is_group: false,
                    organization_id: None,
                },
            )
            .await
            .unwrap();
        let elsewhere = f
            .router
            .send(other.id, &f.alice, "elsewhere".into(), None, vec![])
            .await
            .unwrap();

        let err = f
            .router
            .send(f.conversation.id, &f.alice, "reply".into(), Some(elsewhere.id), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn non_member_cannot_send() {
        let f = fixture().await;
        let err = f
            .router
            .send(f.conversation.id, &user("mallory"), "hi".into(), None, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn foreign_edit_fails_without_history_or_broadcast() {
        let f = fixture().await;
        let msg = f
            .router
            .send(f.conversation.id, &f.alice, "mine".into(), None, vec![])
            .await
            .unwrap();
        let (_, mut rx) = f.registry.add_subscriber(f.conversation.id, f.alice.id).await;

        let err = f
            .router
            .edit(f.conversation.id, &f.bob, msg.id, "theirs".into())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Permission(_)));
        assert!(f.store.edit_history(msg.id).await.unwrap().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn each_edit_appends_one_history_record() {
        let f = fixture().await;
        let msg = f
            .router
            .send(f.conversation.id, &f.alice, "v1".into(), None, vec![])
            .await
            .unwrap();
        let (_, mut rx) = f.registry.add_subscriber(f.conversation.id, f.bob.id).await;

        f.router
            .edit(f.conversation.id, &f.alice, msg.id, "v2".into())
            .await
            .unwrap();
        let frame = next_frame(&mut rx);
        assert_eq!(frame["type"], "message_edit");
        assert_eq!(frame["message"]["content"], "v2");
        assert_eq!(frame["message"]["is_edited"], true);

        let history = f.store.edit_history(msg.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].previous_content, "v1");
    }

    #[tokio::test]
    async fn soft_delete_masks_broadcast_and_blocks_edits() {
        let f = fixture().await;
        let msg = f
            .router
            .send(f.conversation.id, &f.alice, "oops".into(), None, vec![])
            .await
            .unwrap();
        let (_, mut rx) = f.registry.add_subscriber(f.conversation.id, f.bob.id).await;

        let err = f
            .router
            .soft_delete(f.conversation.id, &f.bob, msg.id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Permission(_)));

        f.router
            .soft_delete(f.conversation.id, &f.alice, msg.id)
            .await
            .unwrap();
        let frame = next_frame(&mut rx);
        assert_eq!(frame["type"], "message_delete");
        assert_eq!(frame["message"]["content"], crate::models::DELETED_PLACEHOLDER);

        let err = f
            .router
            .edit(f.conversation.id, &f.alice, msg.id, "fix".into())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
        assert_eq!(f.store.get_message(msg.id).await.unwrap().unwrap().content, "oops");
    }

    #[tokio::test]
    async fn message_from_other_conversation_is_not_found() {
        let f = fixture().await;
        let msg = f
            .router
            .send(f.conversation.id, &f.alice, "x".into(), None, vec![])
            .await
            .unwrap();
        let err = f
            .router
            .react(f.conversation.id + 1, &f.alice, msg.id, "👍")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn reaction_toggle_three_times_leaves_one() {
        let f = fixture().await;
        let msg = f
            .router
            .send(f.conversation.id, &f.alice, "x".into(), None, vec![])
            .await
            .unwrap();

        let mut actions = Vec::new();
        for _ in 0..3 {
            actions.push(
                f.router
                    .react(f.conversation.id, &f.bob, msg.id, "👍")
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(
            actions,
            vec![ReactionAction::Added, ReactionAction::Removed, ReactionAction::Added]
        );
        assert_eq!(f.store.list_reactions(msg.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn oversized_or_blank_emoji_is_rejected() {
        let f = fixture().await;
        let msg = f
            .router
            .send(f.conversation.id, &f.alice, "x".into(), None, vec![])
            .await
            .unwrap();
        let oversized = "x".repeat(MAX_EMOJI_BYTES + 1);
        for emoji in ["", "  ", oversized.as_str()] {
            let err = f
                .router
                .react(f.conversation.id, &f.bob, msg.id, emoji)
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::Validation(_)));
        }
    }

    #[tokio::test]
    async fn own_message_read_is_a_silent_noop() {
        let f = fixture().await;
        let msg = f
            .router
            .send(f.conversation.id, &f.alice, "x".into(), None, vec![])
            .await
            .unwrap();
        let (_, mut rx) = f.registry.add_subscriber(f.conversation.id, f.bob.id).await;

        assert!(f
            .router
            .mark_read(f.conversation.id, &f.alice, msg.id)
            .await
            .unwrap()
            .is_none());
        assert!(f.store.list_read_receipts(msg.id).await.unwrap().is_empty());
        assert!(rx.try_recv().is_err());

        assert!(f
            .router
            .mark_read(f.conversation.id, &f.bob, msg.id)
            .await
            .unwrap()
            .is_some());
        assert!(f
            .router
            .mark_read(f.conversation.id, &f.bob, msg.id)
            .await
            .unwrap()
            .is_none());
        assert_eq!(next_frame(&mut rx)["type"], "read_receipt");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn typing_is_not_echoed_and_starts_are_throttled() {
        let f = fixture_with(
            Arc::new(MemoryStore::new()),
            LimitsConfig {
                typing_broadcast_interval: Duration::from_secs(60),
                ..LimitsConfig::default()
            },
        )
        .await;
        let (_, mut alice_rx) = f.registry.add_subscriber(f.conversation.id, f.alice.id).await;
        let (_, mut bob_rx) = f.registry.add_subscriber(f.conversation.id, f.bob.id).await;

        assert!(f.router.set_typing(f.conversation.id, &f.alice, true).await.unwrap());
        assert!(!f.router.set_typing(f.conversation.id, &f.alice, true).await.unwrap());
        assert!(f.router.set_typing(f.conversation.id, &f.alice, false).await.unwrap());

        let start = next_frame(&mut bob_rx);
        assert_eq!(start["type"], "typing_indicator");
        assert_eq!(start["is_typing"], true);
        assert_eq!(next_frame(&mut bob_rx)["is_typing"], false);
        assert!(bob_rx.try_recv().is_err());
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_rate_is_limited_per_user() {
        let f = fixture_with(
            Arc::new(MemoryStore::new()),
            LimitsConfig {
                message_rate_per_second: 1,
                message_rate_burst: 2,
                ..LimitsConfig::default()
            },
        )
        .await;

        for _ in 0..2 {
            f.router
                .send(f.conversation.id, &f.alice, "spam".into(), None, vec![])
                .await
                .unwrap();
        }
        let err = f
            .router
            .send(f.conversation.id, &f.alice, "spam".into(), None, vec![])
            .await
            .unwrap_err();
        assert_eq!(err, AppError::RateLimited);

        // other users have their own budget
        f.router
            .send(f.conversation.id, &f.bob, "hi".into(), None, vec![])
            .await
            .unwrap();
    }

    /// Delegates to an in-memory store but fails every reaction write.
    struct FlakyReactions(MemoryStore);

    #[async_trait]
    impl MessageStore for FlakyReactions {
        async fn create_conversation(&self, new: NewConversation) -> AppResult<(Conversation, bool)> {
            self.0.create_conversation(new).await
        }
        async fn find_direct_conversation(&self, a: Uuid, b: Uuid) -> AppResult<Option<Conversation>> {
            self.0.find_direct_conversation(a, b).await
        }
        async fn get_conversation(&self, id: i64) -> AppResult<Option<Conversation>> {
            self.0.get_conversation(id).await
        }
        async fn conversations_for(&self, user_id: Uuid) -> AppResult<Vec<Conversation>> {
            self.0.conversations_for(user_id).await
        }
        async fn get_message(&self, id: i64) -> AppResult<Option<Message>> {
            self.0.get_message(id).await
        }
        async fn insert_message(
            &self,
            new: NewMessage,
            notifications: Vec<NotificationDraft>,
        ) -> AppResult<Message> {
            self.0.insert_message(new, notifications).await
        }
        async fn update_message_content(
            &self,
            id: i64,
            editor: Uuid,
            content: String,
            at: DateTime<Utc>,
        ) -> AppResult<Message> {
            self.0.update_message_content(id, editor, content, at).await
        }
        async fn soft_delete_message(
            &self,
            id: i64,
            requester: Uuid,
            at: DateTime<Utc>,
        ) -> AppResult<Message> {
            self.0.soft_delete_message(id, requester, at).await
        }
        async fn list_messages(
            &self,
            conversation_id: i64,
            before: Option<i64>,
            limit: usize,
        ) -> AppResult<Vec<Message>> {
            self.0.list_messages(conversation_id, before, limit).await
        }
        async fn edit_history(&self, message_id: i64) -> AppResult<Vec<EditRecord>> {
            self.0.edit_history(message_id).await
        }
        async fn toggle_reaction(
            &self,
            _message_id: i64,
            _user_id: Uuid,
            _emoji: &str,
            _at: DateTime<Utc>,
        ) -> AppResult<ReactionAction> {
            Err(AppError::Storage("connection reset by peer".into()))
        }
        async fn list_reactions(&self, message_id: i64) -> AppResult<Vec<Reaction>> {
            self.0.list_reactions(message_id).await
        }
        async fn insert_read_receipt(
            &self,
            message_id: i64,
            user_id: Uuid,
            at: DateTime<Utc>,
        ) -> AppResult<Option<ReadReceipt>> {
            self.0.insert_read_receipt(message_id, user_id, at).await
        }
        async fn list_read_receipts(&self, message_id: i64) -> AppResult<Vec<ReadReceipt>> {
            self.0.list_read_receipts(message_id).await
        }
        async fn upsert_typing(&self, conversation_id: i64, user_id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
            self.0.upsert_typing(conversation_id, user_id, at).await
        }
        async fn delete_typing(&self, conversation_id: i64, user_id: Uuid) -> AppResult<()> {
            self.0.delete_typing(conversation_id, user_id).await
        }
        async fn list_typing(&self, conversation_id: i64) -> AppResult<Vec<TypingIndicator>> {
            self.0.list_typing(conversation_id).await
        }
        async fn notifications_for(&self, user_id: Uuid) -> AppResult<Vec<Notification>> {
            self.0.notifications_for(user_id).await
        }
        async fn health_check(&self) -> AppResult<()> {
            self.0.health_check().await
        }
    }

    #[tokio::test]
    async fn storage_failure_reports_error_and_broadcasts_nothing() {
        let f = fixture_with(
            Arc::new(FlakyReactions(MemoryStore::new())),
            LimitsConfig::default(),
        )
        .await;
        let msg = f
            .router
            .send(f.conversation.id, &f.alice, "x".into(), None, vec![])
            .await
            .unwrap();
        let (_, mut rx) = f.registry.add_subscriber(f.conversation.id, f.bob.id).await;

        let err = f
            .router
            .react(f.conversation.id, &f.bob, msg.id, "👍")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(rx.try_recv().is_err());
        assert!(f.store.list_reactions(msg.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lock_entries_are_released_after_each_event() {
        let f = fixture().await;
        let msg = f
            .router
            .send(f.conversation.id, &f.alice, "x".into(), None, vec![])
            .await
            .unwrap();
        f.router.react(f.conversation.id, &f.bob, msg.id, "👍").await.unwrap();
        f.router.mark_read(f.conversation.id, &f.bob, msg.id).await.unwrap();
        f.router.soft_delete(f.conversation.id, &f.alice, msg.id).await.unwrap();

        assert!(f.router.locks.is_empty());
    }

    #[tokio::test]
    async fn lock_entry_survives_while_another_event_waits() {
        let f = fixture().await;
        let held = f.router.lock_conversation(f.conversation.id).await;

        let waiter = {
            let lock = f.router.locks.get(&f.conversation.id).unwrap().clone();
            tokio::spawn(async move {
                let _ordered = lock.lock_owned().await;
            })
        };
        drop(held);
        // The spawned task still references the entry.
        assert_eq!(f.router.locks.len(), 1);
        waiter.await.unwrap();

        let _again = f.router.lock_conversation(f.conversation.id).await;
        assert_eq!(f.router.locks.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn busy_conversation_does_not_block_another() {
        let f = fixture().await;
        let (other, _) = f
            .router
            .conversations
            .create(
                f.alice.id,
                CreateConversationRequest {
                    participants: vec![f.bob.id, user("carol").id],
                    subject: Some("team".into()),
                    is_group: true,
                    organization_id: None,
                },
            )
            .await
            .unwrap();
        let (_, mut rx) = f.registry.add_subscriber(other.id, f.bob.id).await;

        let _held = f.router.lock_conversation(f.conversation.id).await;
        let sent = tokio::time::timeout(
            Duration::from_secs(1),
            f.router.send(other.id, &f.alice, "elsewhere".into(), None, vec![]),
        )
        .await
        .expect("send to another conversation must not wait on the held lock")
        .unwrap();

        let frame = next_frame(&mut rx);
        assert_eq!(frame["message_id"], sent.id);

        let blocked = tokio::time::timeout(
            Duration::from_millis(100),
            f.router.send(f.conversation.id, &f.alice, "queued".into(), None, vec![]),
        )
        .await;
        assert!(blocked.is_err());
    }
}
