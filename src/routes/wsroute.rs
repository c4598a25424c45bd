use crate::middleware::auth::extract_token;
use crate::state::AppState;
use crate::websocket::session::WsSession;
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// GET /ws/{conversation_id}
///
/// The upgrade only happens for an authenticated participant: 401 without a
/// valid token, 403 for anyone outside the conversation.
#[get("/ws/{conversation_id}")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    conversation_id: web::Path<i64>,
    query: web::Query<WsParams>,
) -> Result<HttpResponse, Error> {
    let conversation_id = conversation_id.into_inner();

    // Authentication
    let Some(token) = extract_token(&req, query.token.as_deref()) else {
        tracing::debug!(conversation_id, "websocket rejected: missing token");
        return Ok(HttpResponse::Unauthorized().finish());
    };
    let user = match state.identity.authenticate(&token).await {
        Ok(user) => user,
        Err(e) => {
            tracing::debug!(conversation_id, error = %e, "websocket rejected: invalid token");
            return Ok(HttpResponse::Unauthorized().finish());
        }
    };

    // Authorization
    if !state
        .conversations
        .membership_check(conversation_id, user.id)
        .await
    {
        tracing::warn!(
            conversation_id,
            user_id = %user.id,
            "websocket rejected: not a participant"
        );
        return Ok(HttpResponse::Forbidden().finish());
    }

    let (subscriber_id, outbound) = state.registry.add_subscriber(conversation_id, user.id).await;

    let session = WsSession::new(
        conversation_id,
        user,
        subscriber_id,
        outbound,
        state.as_ref().clone(),
    );

    match ws::start(session, &req, stream) {
        Ok(resp) => Ok(resp),
        Err(e) => {
            state
                .registry
                .remove_subscriber(conversation_id, subscriber_id)
                .await;
            Err(e)
        }
    }
}
