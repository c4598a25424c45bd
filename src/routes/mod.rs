pub mod conversations;
pub mod messages;
pub mod wsroute;

use crate::error::AppError;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use actix_web::{web, HttpResponse};

/// Registers every HTTP and WebSocket endpoint.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(conversations::create_conversation)
        .service(conversations::list_conversations)
        .service(conversations::get_presence)
        .service(messages::list_messages)
        .service(messages::get_edit_history)
        .service(messages::get_reactions)
        .service(messages::list_notifications)
        .service(wsroute::ws_handler)
        .route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics_handler));
}

async fn health(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    state.store.health_check().await?;
    Ok(HttpResponse::Ok().body("OK"))
}
