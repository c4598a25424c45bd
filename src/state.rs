use crate::{
    config::Config,
    middleware::auth::{IdentityProvider, JwtIdentityProvider},
    services::{ConversationRegistry, MessageEventRouter, PresenceTracker},
    store::MessageStore,
    websocket::ConnectionRegistry,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn MessageStore>,
    pub identity: Arc<dyn IdentityProvider>,
    pub registry: ConnectionRegistry,
    pub conversations: Arc<ConversationRegistry>,
    pub presence: Arc<PresenceTracker>,
    pub router: Arc<MessageEventRouter>,
}

impl AppState {
    /// Wires the services over `store`, fanning out through the in-process
    /// connection registry.
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn MessageStore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let registry = ConnectionRegistry::new(config.ws_outbound_buffer);
        let conversations = Arc::new(ConversationRegistry::new(
            store.clone(),
            config.limits.max_group_participants,
        ));
        let presence = Arc::new(PresenceTracker::new(
            store.clone(),
            config.limits.typing_broadcast_interval,
        ));
        let router = Arc::new(MessageEventRouter::new(
            store.clone(),
            conversations.clone(),
            presence.clone(),
            Arc::new(registry.clone()),
            config.limits.clone(),
        ));

        Self {
            config,
            store,
            identity,
            registry,
            conversations,
            presence,
            router,
        }
    }

    /// State with JWT identity taken from the configuration.
    pub fn with_jwt(config: Arc<Config>, store: Arc<dyn MessageStore>) -> Self {
        let identity = Arc::new(JwtIdentityProvider::new(&config.jwt));
        Self::new(config, store, identity)
    }
}
