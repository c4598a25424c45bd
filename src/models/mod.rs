pub mod conversation;
pub mod message;
pub mod notification;
pub mod typing;

pub use conversation::{Conversation, NewConversation};
pub use message::{
    Attachment, EditRecord, Message, MessageView, NewMessage, Reaction, ReactionAction,
    ReadReceipt, DELETED_PLACEHOLDER,
};
pub use notification::{DeliveryChannel, Notification, NotificationDraft, NotificationKind};
pub use typing::TypingIndicator;
