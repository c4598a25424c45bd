pub mod conversation_service;
pub mod message_router;
pub mod presence;

pub use conversation_service::ConversationRegistry;
pub use message_router::MessageEventRouter;
pub use presence::PresenceTracker;
