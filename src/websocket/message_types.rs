use crate::error::{AppError, AppResult};
use crate::models::Attachment;
use serde::Deserialize;
use serde_json::Value;

/// Inbound WebSocket events from client to server
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    ChatMessage {
        content: String,
        #[serde(default)]
        parent_message_id: Option<i64>,
        #[serde(default)]
        attachments: Vec<Attachment>,
    },
    TypingIndicator {
        is_typing: bool,
    },
    ReadReceipt {
        message_id: i64,
    },
    MessageReaction {
        message_id: i64,
        emoji: String,
    },
    MessageEdit {
        message_id: i64,
        content: String,
    },
    MessageDelete {
        message_id: i64,
    },
}

const KNOWN_TYPES: [&str; 6] = [
    "chat_message",
    "typing_indicator",
    "read_receipt",
    "message_reaction",
    "message_edit",
    "message_delete",
];

impl ClientEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ChatMessage { .. } => "chat_message",
            Self::TypingIndicator { .. } => "typing_indicator",
            Self::ReadReceipt { .. } => "read_receipt",
            Self::MessageReaction { .. } => "message_reaction",
            Self::MessageEdit { .. } => "message_edit",
            Self::MessageDelete { .. } => "message_delete",
        }
    }

    fn implicit_chat(content: String) -> Self {
        Self::ChatMessage {
            content,
            parent_message_id: None,
            attachments: Vec::new(),
        }
    }
}

/// Decodes one text frame.
///
/// Protocol leniency rule: a frame that is not a JSON object and does not
/// look like one (plain text, or a bare JSON scalar) is an implicit
/// `chat_message` whose content is that text. Objects with an unknown
/// `type` yield `UnsupportedEvent`; known types with bad fields, broken
/// JSON objects and arrays yield `Validation`.
pub fn parse_client_frame(text: &str) -> AppResult<ClientEvent> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation("empty frame".into()));
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => {
            let event_type = match map.get("type") {
                Some(Value::String(t)) => t.clone(),
                Some(_) => return Err(AppError::Validation("event type must be a string".into())),
                None => return Err(AppError::Validation("missing event type".into())),
            };
            if !KNOWN_TYPES.contains(&event_type.as_str()) {
                return Err(AppError::UnsupportedEvent(event_type));
            }
            serde_json::from_value(Value::Object(map))
                .map_err(|e| AppError::Validation(format!("invalid {event_type} payload: {e}")))
        }
        Ok(Value::Array(_)) => Err(AppError::Validation("event must be a JSON object".into())),
        Ok(Value::String(s)) => Ok(ClientEvent::implicit_chat(s)),
        Ok(_) => Ok(ClientEvent::implicit_chat(text.to_string())),
        Err(_) if trimmed.starts_with('{') || trimmed.starts_with('[') => {
            Err(AppError::Validation("malformed payload".into()))
        }
        Err(_) => Ok(ClientEvent::implicit_chat(text.to_string())),
    }
}
