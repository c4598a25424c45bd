//! Request extractors that enforce authentication and membership at the type level.

use std::future::Future;
use std::pin::Pin;

use crate::error::AppError;
use crate::middleware::auth::{extract_token, AuthenticatedUser};
use crate::models::Conversation;
use crate::services::ConversationRegistry;
use crate::state::AppState;
use actix_web::{web, Error, FromRequest, HttpRequest};

/// Authenticated caller of a REST endpoint (bearer token).
#[derive(Debug, Clone)]
pub struct User(pub AuthenticatedUser);

impl FromRequest for User {
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self, Self::Error>>>>;

    fn from_request(req: &HttpRequest, _payload: &mut actix_web::dev::Payload) -> Self::Future {
        let state = req.app_data::<web::Data<AppState>>().cloned();
        let token = extract_token(req, None);

        Box::pin(async move {
            let state = state.ok_or(AppError::Internal)?;
            let token = token.ok_or(AppError::Unauthorized)?;
            let user = state.identity.authenticate(&token).await?;
            Ok(User(user))
        })
    }
}

/// A conversation the caller is verified to participate in.
#[derive(Debug, Clone)]
pub struct ConversationMember {
    pub user: AuthenticatedUser,
    pub conversation: Conversation,
}

impl ConversationMember {
    /// Non-participants get `NotFound` so conversation ids do not leak.
    pub async fn verify(
        conversations: &ConversationRegistry,
        user: AuthenticatedUser,
        conversation_id: i64,
    ) -> Result<Self, AppError> {
        let conversation = conversations
            .get(conversation_id)
            .await?
            .filter(|c| c.has_participant(user.id))
            .ok_or_else(|| AppError::NotFound(format!("conversation {conversation_id}")))?;
        Ok(Self { user, conversation })
    }
}
