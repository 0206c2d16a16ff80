// Models shared between the client core and the store backends.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An ephemeral room. Rooms are never deleted; once `expires_at` passes
/// they simply stop matching the join query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatRoom {
    pub id: String,
    pub pin: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    File,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::File => "file",
        }
    }

    /// Parse the stored column value. Unknown values fall back to `Text`
    /// so one bad row cannot poison a whole snapshot load.
    pub fn parse(s: &str) -> Self {
        match s {
            "image" => MessageType::Image,
            "file" => MessageType::File,
            _ => MessageType::Text,
        }
    }

    pub fn is_attachment(&self) -> bool {
        matches!(self, MessageType::Image | MessageType::File)
    }
}

/// Lightweight pointer to the message being replied to. Not a foreign
/// key: the preview and sender are denormalized at send time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyRef {
    pub id: String,
    pub preview: String,
    pub sender: String,
}

/// Preview length used for reply references.
pub const REPLY_PREVIEW_LEN: usize = 50;

impl ReplyRef {
    /// Build a reference to `message`, truncating its content for display.
    pub fn to_message(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            preview: truncate(&message.content, REPLY_PREVIEW_LEN),
            sender: message.sender.clone(),
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}...", cut)
}

/// One immutable message as read back from the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub room_id: String,
    pub sender: String,
    pub content: String,
    pub message_type: MessageType,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub reply_to: Option<ReplyRef>,
    pub created_at: DateTime<Utc>,
}

/// What the client hands to `send_message`. The store assigns id and
/// creation timestamp.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub content: String,
    pub message_type: Option<MessageType>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub reply_to: Option<ReplyRef>,
}

impl OutgoingMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            message_type: Some(MessageType::Text),
            ..Default::default()
        }
    }

    pub fn kind(&self) -> MessageType {
        self.message_type.unwrap_or(MessageType::Text)
    }
}

/// One entry of the active-user view. Decays out of the list when
/// `last_seen` leaves the trailing window; never explicitly removed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveUser {
    pub nickname: String,
    pub is_typing: bool,
}
