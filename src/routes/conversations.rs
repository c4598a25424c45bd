use crate::{
    error::AppError,
    middleware::guards::{ConversationMember, User},
    models::conversation::CreateConversationRequest,
    state::AppState,
};
use actix_web::{get, post, web, HttpResponse};
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

#[derive(Serialize)]
pub struct PresenceResponse {
    pub conversation_id: i64,
    pub online: Vec<Uuid>,
    pub typing: Vec<Uuid>,
}

/// POST /conversations
/// Start a conversation, or resume the existing 1:1 with the same participant
#[post("/conversations")]
pub async fn create_conversation(
    state: web::Data<AppState>,
    user: User,
    body: web::Json<CreateConversationRequest>,
) -> Result<HttpResponse, AppError> {
    let (conversation, created) = state
        .conversations
        .create(user.0.id, body.into_inner())
        .await?;

    if created {
        Ok(HttpResponse::Created().json(conversation))
    } else {
        Ok(HttpResponse::Ok().json(conversation))
    }
}

/// GET /conversations
/// Caller's conversations, most recently active first
#[get("/conversations")]
pub async fn list_conversations(
    state: web::Data<AppState>,
    user: User,
) -> Result<HttpResponse, AppError> {
    let conversations = state.conversations.list_for(user.0.id).await?;
    Ok(HttpResponse::Ok().json(conversations))
}

/// GET /conversations/{id}/presence
/// Online users and users typing within the TTL
#[get("/conversations/{id}/presence")]
pub async fn get_presence(
    state: web::Data<AppState>,
    conversation_id: web::Path<i64>,
    user: User,
) -> Result<HttpResponse, AppError> {
    let member =
        ConversationMember::verify(&state.conversations, user.0, conversation_id.into_inner())
            .await?;
    let conversation_id = member.conversation.id;

    let typing = state
        .presence
        .active_typists(conversation_id, Utc::now())
        .await?;

    Ok(HttpResponse::Ok().json(PresenceResponse {
        conversation_id,
        online: state.presence.online_users(conversation_id),
        typing,
    }))
}
