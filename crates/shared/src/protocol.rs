use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{Chat, ChatId, Message, MessageId, MessageKind, UserId};

// HTTP bodies, all under /api/v1.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginUser {
    pub id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub message: String,
    pub token: String,
    pub user: LoginUser,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredUser {
    pub username: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    #[serde(default)]
    pub message: String,
    pub user: RegisteredUser,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatsResponse {
    pub chats: Vec<Chat>,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessagesResponse {
    pub chat_id: ChatId,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub chat_id: ChatId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    #[serde(default)]
    pub message: String,
    pub data: Message,
}

/// Best-effort shape of a server error body.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

// Realtime frames: `{"type": "...", "payload": {...}}`.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundFrame {
    Join { chat_id: ChatId },
    Chat { content: String, chat_id: ChatId },
    Typing { chat_id: ChatId, typing: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub content: String,
    pub username: String,
    #[serde(default)]
    pub sender_id: Option<UserId>,
    #[serde(default)]
    pub id: Option<MessageId>,
    #[serde(default)]
    pub chat_id: Option<ChatId>,
    #[serde(default)]
    pub is_history: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub username: String,
    pub typing: bool,
    #[serde(default)]
    pub chat_id: Option<ChatId>,
}

/// Envelope as it arrives, before the payload is bound to a shape.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Chat(ChatPayload),
    Typing(TypingPayload),
    Status(Value),
    Unknown { kind: String },
}

impl InboundFrame {
    /// Decodes one text frame. Unrecognized `type` tags are not an error.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        let raw: RawFrame = serde_json::from_str(text)?;
        Ok(match raw.kind.as_str() {
            "chat" => Self::Chat(serde_json::from_value(raw.payload)?),
            "typing" => Self::Typing(serde_json::from_value(raw.payload)?),
            "status" => Self::Status(raw.payload),
            _ => Self::Unknown { kind: raw.kind },
        })
    }
}

impl OutboundFrame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
