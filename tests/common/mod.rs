#![allow(dead_code)]

use std::env;
use std::sync::Arc;

use jsonwebtoken::{encode, EncodingKey, Header};
use realtime_messaging::config::Config;
use realtime_messaging::middleware::auth::{AuthenticatedUser, Claims};
use realtime_messaging::models::conversation::CreateConversationRequest;
use realtime_messaging::state::AppState;
use realtime_messaging::store::MemoryStore;
use uuid::Uuid;

pub const TEST_SECRET: &str = "test-secret";

pub fn test_database_url() -> Option<String> {
    env::var("TEST_DATABASE_URL").ok()
}

pub fn memory_state() -> AppState {
    AppState::with_jwt(
        Arc::new(Config::test_defaults()),
        Arc::new(MemoryStore::new()),
    )
}

pub fn user(name: &str) -> AuthenticatedUser {
    AuthenticatedUser {
        id: Uuid::new_v4(),
        display_name: name.to_string(),
        email: Some(format!("{}@example.com", name.to_lowercase())),
    }
}

/// HS256 token accepted by `Config::test_defaults`.
pub fn token_for(user: &AuthenticatedUser) -> String {
    let claims = Claims {
        sub: user.id.to_string(),
        name: Some(user.display_name.clone()),
        email: user.email.clone(),
        exp: chrono::Utc::now().timestamp() + 3600,
        iss: None,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .expect("encode test token")
}

/// Direct conversation between `a` and `b`, returning its id.
pub async fn direct_conversation(
    state: &AppState,
    a: &AuthenticatedUser,
    b: &AuthenticatedUser,
) -> i64 {
    let (conversation, _) = state
        .conversations
        .create(
            a.id,
            CreateConversationRequest {
                participants: vec![b.id],
                subject: None,
                is_group: false,
                organization_id: None,
            },
        )
        .await
        .expect("create conversation");
    conversation.id
}

/// Drains every frame currently queued on a subscriber as JSON values.
pub fn drain(rx: &mut tokio::sync::mpsc::Receiver<String>) -> Vec<serde_json::Value> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(serde_json::from_str(&frame).expect("frame is json"));
    }
    frames
}
