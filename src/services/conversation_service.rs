use crate::error::{AppError, AppResult};
use crate::models::conversation::CreateConversationRequest;
use crate::models::{Conversation, NewConversation};
use crate::store::MessageStore;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Conversation membership authority.
///
/// Participant sets never change after creation, so they are cached per
/// conversation once loaded.
pub struct ConversationRegistry {
    store: Arc<dyn MessageStore>,
    max_group_participants: usize,
    members: DashMap<i64, Arc<Vec<Uuid>>>,
}

impl ConversationRegistry {
    pub fn new(store: Arc<dyn MessageStore>, max_group_participants: usize) -> Self {
        Self {
            store,
            max_group_participants,
            members: DashMap::new(),
        }
    }

    /// Start or resume a conversation. The creator is always a participant.
    ///
    /// For a non-group conversation between exactly two people an existing one
    /// with the same pair is returned and the flag is false. Any other shape is
    /// always created fresh.
    pub async fn create(
        &self,
        creator: Uuid,
        req: CreateConversationRequest,
    ) -> AppResult<(Conversation, bool)> {
        if req.participants.is_empty() {
            return Err(AppError::Validation("participants must not be empty".into()));
        }

        let mut participants = Vec::with_capacity(req.participants.len() + 1);
        for user in std::iter::once(creator).chain(req.participants) {
            if !participants.contains(&user) {
                participants.push(user);
            }
        }

        if participants.len() > self.max_group_participants {
            return Err(AppError::Validation(format!(
                "conversations are limited to {} participants",
                self.max_group_participants
            )));
        }

        // Only a true pair is deduplicated; larger non-group conversations are always new.
        if !req.is_group && participants.len() == 2 {
            if let Some(existing) = self
                .store
                .find_direct_conversation(participants[0], participants[1])
                .await?
            {
                tracing::debug!(conversation_id = existing.id, "resuming direct conversation");
                return Ok((existing, false));
            }
        }

        let subject = req
            .subject
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let (conversation, created) = self
            .store
            .create_conversation(NewConversation {
                participants,
                subject,
                is_group: req.is_group,
                organization_id: req.organization_id,
            })
            .await?;

        self.members.insert(
            conversation.id,
            Arc::new(conversation.participants.clone()),
        );
        if created {
            tracing::info!(
                conversation_id = conversation.id,
                creator = %creator,
                is_group = conversation.is_group,
                participants = conversation.participants.len(),
                "conversation created"
            );
        }
        Ok((conversation, created))
    }

    pub async fn list_for(&self, user_id: Uuid) -> AppResult<Vec<Conversation>> {
        self.store.conversations_for(user_id).await
    }

    pub async fn get(&self, conversation_id: i64) -> AppResult<Option<Conversation>> {
        self.store.get_conversation(conversation_id).await
    }

    /// Participant list, `None` if the conversation does not exist.
    pub async fn participants(&self, conversation_id: i64) -> AppResult<Option<Arc<Vec<Uuid>>>> {
        if let Some(cached) = self.members.get(&conversation_id) {
            return Ok(Some(cached.clone()));
        }
        let Some(conversation) = self.store.get_conversation(conversation_id).await? else {
            return Ok(None);
        };
        let members = Arc::new(conversation.participants);
        self.members.insert(conversation_id, members.clone());
        Ok(Some(members))
    }

    /// Fails closed: an absent conversation or a storage error is a "no".
    pub async fn membership_check(&self, conversation_id: i64, user_id: Uuid) -> bool {
        match self.participants(conversation_id).await {
            Ok(Some(members)) => members.contains(&user_id),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(conversation_id, user_id = %user_id, error = %e, "membership check failed");
                false
            }
        }
    }
}
