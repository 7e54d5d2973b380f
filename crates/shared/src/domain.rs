use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ChatId);
id_newtype!(MessageId);

/// Reserved for the client-local system sender and system messages.
pub const SYSTEM_ID: i64 = 0;
/// Client-local messages without a server id draw from this half-open range.
pub const SYNTHETIC_MESSAGE_IDS: std::ops::Range<i64> = 1000..9999;

pub const MAX_MESSAGE_CHARS: usize = 2000;
pub const MAX_MESSAGE_BYTES: usize = 1500;
pub const MIN_USERNAME_CHARS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    #[default]
    Online,
    Away,
    Busy,
    /// Never sent by the server; marks the local system sender.
    System,
    #[serde(other)]
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    Voice,
    Location,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::Voice => "voice",
            Self::Location => "location",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Group,
    Private,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(
        default,
        deserialize_with = "empty_string_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub avatar: Option<String>,
    #[serde(default)]
    pub status: UserStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl User {
    /// Identity known only by id and name, as handed out by login and live frames.
    pub fn placeholder(id: UserId, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            email: String::new(),
            avatar: None,
            status: UserStatus::Online,
            created_at: Utc::now(),
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    pub sender: User,
    pub chat_id: ChatId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    #[serde(default)]
    pub is_edited: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Client-local message pinned above the history of a chat.
    pub fn system(chat_id: ChatId, content: impl Into<String>) -> Self {
        let mut sender = User::placeholder(UserId(SYSTEM_ID), "System");
        sender.status = UserStatus::System;
        Self {
            id: MessageId(SYSTEM_ID),
            content: content.into(),
            kind: MessageKind::Text,
            sender,
            chat_id,
            reply_to_id: None,
            is_edited: false,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    pub fn is_client_local(&self) -> bool {
        self.id.0 == SYSTEM_ID || SYNTHETIC_MESSAGE_IDS.contains(&self.id.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    #[serde(default)]
    pub participants: Vec<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
    #[serde(default)]
    pub unread_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Chat {
    pub fn is_group(&self) -> bool {
        self.kind == ChatKind::Group
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContentError {
    #[error("message is empty")]
    Empty,
    #[error("message has {count} characters, limit is {max}")]
    TooManyChars { count: usize, max: usize },
    #[error("message is {count} bytes, limit is {max}")]
    TooManyBytes { count: usize, max: usize },
}

/// Trims outgoing content and checks both size limits independently.
pub fn validate_message_content(content: &str) -> Result<&str, ContentError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ContentError::Empty);
    }
    let chars = trimmed.chars().count();
    if chars > MAX_MESSAGE_CHARS {
        return Err(ContentError::TooManyChars {
            count: chars,
            max: MAX_MESSAGE_CHARS,
        });
    }
    let bytes = trimmed.len();
    if bytes > MAX_MESSAGE_BYTES {
        return Err(ContentError::TooManyBytes {
            count: bytes,
            max: MAX_MESSAGE_BYTES,
        });
    }
    Ok(trimmed)
}

fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_content_over_char_limit() {
        let content = "a".repeat(MAX_MESSAGE_CHARS + 1);
        assert_eq!(
            validate_message_content(&content),
            Err(ContentError::TooManyChars {
                count: 2001,
                max: MAX_MESSAGE_CHARS
            })
        );
    }

    #[test]
    fn byte_limit_applies_under_char_limit() {
        let content = "ж".repeat(750);
        assert!(validate_message_content(&content).is_ok());

        let content = "€".repeat(MAX_MESSAGE_CHARS);
        assert_eq!(content.len(), 6000);
        assert_eq!(
            validate_message_content(&content),
            Err(ContentError::TooManyBytes {
                count: 6000,
                max: MAX_MESSAGE_BYTES
            })
        );
    }

    #[test]
    fn trims_before_counting() {
        let padded = format!("  {}  \n", "a".repeat(1500));
        assert_eq!(validate_message_content(&padded).map(str::len), Ok(1500));
        assert_eq!(validate_message_content(" \t\n"), Err(ContentError::Empty));
    }

    #[test]
    fn decodes_server_user_with_empty_avatar_and_unknown_status() {
        let user: User = serde_json::from_str(
            r#"{"id":4,"username":"mira","email":"m@x.io","avatar":"","status":"invisible",
                "created_at":"2024-03-01T10:00:00.123456789+03:00","updated_at":"2024-03-01T10:00:00Z"}"#,
        )
        .expect("user");
        assert_eq!(user.id, UserId(4));
        assert_eq!(user.avatar, None);
        assert_eq!(user.status, UserStatus::Offline);
        assert!(user.updated_at.is_some());
    }

    #[test]
    fn decodes_message_and_chat_wire_names() {
        let chat: Chat = serde_json::from_str(
            r#"{"id":1,"name":"General","type":"group","participants":[],"unread_count":2,
                "created_at":"2024-03-01T10:00:00Z",
                "last_message":{"id":9,"content":"hi","type":"image","chat_id":1,"is_edited":false,
                  "sender":{"id":2,"username":"li","created_at":"2024-03-01T10:00:00Z"},
                  "created_at":"2024-03-01T10:00:01Z"}}"#,
        )
        .expect("chat");
        assert!(chat.is_group());
        let last = chat.last_message.expect("last message");
        assert_eq!(last.kind, MessageKind::Image);
        assert_eq!(last.sender.username, "li");
        assert_eq!(last.reply_to_id, None);
    }

    #[test]
    fn ids_honor_format_width() {
        assert_eq!(format!("{:>5}", ChatId(7)), "    7");
        assert_eq!(format!("{:<4}|", UserId(42)), "42  |");
    }

    #[test]
    fn system_status_round_trips() {
        let encoded = serde_json::to_string(&UserStatus::System).expect("encode");
        assert_eq!(encoded, r#""system""#);
        let decoded: UserStatus = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, UserStatus::System);
    }

    #[test]
    fn system_message_uses_reserved_ids() {
        let message = Message::system(ChatId(1), "welcome");
        assert_eq!(message.id, MessageId(SYSTEM_ID));
        assert_eq!(message.sender.status, UserStatus::System);
        assert!(message.is_client_local());
    }
}
