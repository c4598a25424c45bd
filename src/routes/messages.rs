use crate::{
    error::AppError,
    middleware::guards::{ConversationMember, User},
    models::{EditRecord, MessageView, DELETED_PLACEHOLDER},
    state::AppState,
    store::MAX_PAGE_SIZE,
};
use actix_web::{get, web, HttpResponse};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub before: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct ReactionCount {
    pub emoji: String,
    pub count: usize,
    pub user_reacted: bool, // whether the caller has this reaction
}

#[derive(Serialize)]
pub struct ReactionsResponse {
    pub message_id: i64,
    pub reactions: Vec<ReactionCount>,
}

/// GET /conversations/{id}/messages?before=&limit=
/// Newest first; deleted messages carry the placeholder
#[get("/conversations/{id}/messages")]
pub async fn list_messages(
    state: web::Data<AppState>,
    conversation_id: web::Path<i64>,
    query: web::Query<HistoryQuery>,
    user: User,
) -> Result<HttpResponse, AppError> {
    let member =
        ConversationMember::verify(&state.conversations, user.0, conversation_id.into_inner())
            .await?;
    let limit = query.limit.unwrap_or(50).clamp(1, MAX_PAGE_SIZE);

    let messages = state
        .store
        .list_messages(member.conversation.id, query.before, limit)
        .await?;
    let views: Vec<MessageView> = messages.iter().map(|m| m.view(None)).collect();

    Ok(HttpResponse::Ok().json(views))
}

/// GET /messages/{id}/history
/// Prior revisions, oldest first
#[get("/messages/{id}/history")]
pub async fn get_edit_history(
    state: web::Data<AppState>,
    message_id: web::Path<i64>,
    user: User,
) -> Result<HttpResponse, AppError> {
    let message_id = message_id.into_inner();
    let message = state
        .store
        .get_message(message_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("message {message_id}")))?;
    ConversationMember::verify(&state.conversations, user.0, message.conversation_id).await?;

    let mut history: Vec<EditRecord> = state.store.edit_history(message_id).await?;
    if message.is_deleted {
        for record in &mut history {
            record.previous_content = DELETED_PLACEHOLDER.to_string();
        }
    }
    Ok(HttpResponse::Ok().json(history))
}

/// GET /messages/{id}/reactions
/// Reaction counts per emoji and whether the caller reacted
#[get("/messages/{id}/reactions")]
pub async fn get_reactions(
    state: web::Data<AppState>,
    message_id: web::Path<i64>,
    user: User,
) -> Result<HttpResponse, AppError> {
    let message_id = message_id.into_inner();
    let message = state
        .store
        .get_message(message_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("message {message_id}")))?;
    let member =
        ConversationMember::verify(&state.conversations, user.0, message.conversation_id).await?;

    let mut counts: BTreeMap<String, ReactionCount> = BTreeMap::new();
    for reaction in state.store.list_reactions(message_id).await? {
        let entry = counts
            .entry(reaction.emoji.clone())
            .or_insert_with(|| ReactionCount {
                emoji: reaction.emoji.clone(),
                count: 0,
                user_reacted: false,
            });
        entry.count += 1;
        entry.user_reacted |= reaction.user_id == member.user.id;
    }

    let mut reactions: Vec<ReactionCount> = counts.into_values().collect();
    reactions.sort_by(|a, b| b.count.cmp(&a.count));

    Ok(HttpResponse::Ok().json(ReactionsResponse {
        message_id,
        reactions,
    }))
}

/// GET /notifications
/// Caller's notifications, newest first
#[get("/notifications")]
pub async fn list_notifications(
    state: web::Data<AppState>,
    user: User,
) -> Result<HttpResponse, AppError> {
    let notifications = state.store.notifications_for(user.0.id).await?;
    Ok(HttpResponse::Ok().json(notifications))
}
