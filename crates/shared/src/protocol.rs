use serde::{Deserialize, Serialize};

use crate::{
    domain::ChatId,
    error::{ApiError, ErrorCode},
};

/// Frames a client may send. Fields default to empty so that a frame with a
/// known type but missing fields still parses and can be rejected with a
/// validation error instead of being dropped as malformed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Signup {
        #[serde(default)]
        from: String,
        #[serde(default)]
        password: String,
        #[serde(default)]
        first_name: String,
        #[serde(default)]
        last_name: String,
    },
    Signin {
        #[serde(default)]
        from: String,
        #[serde(default)]
        password: String,
    },
    Message {
        #[serde(default)]
        to: String,
        #[serde(default)]
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    History {
        #[serde(default)]
        to: String,
    },
    UserSearch {
        #[serde(default)]
        query: String,
    },
    StartChat {
        #[serde(default)]
        to: String,
    },
    CreateGroup {
        #[serde(default)]
        name: String,
        #[serde(default)]
        participants: Vec<String>,
    },
    /// Any type this server does not know about; ignored once authenticated.
    #[serde(other)]
    Unrecognized,
}

impl ClientFrame {
    pub fn parse(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatPreview {
    pub chat_id: ChatId,
    /// Peer username for private chats, the chat id as text for groups.
    pub peer: String,
    /// Peer display name for private chats, the title for groups.
    pub display_name: String,
    #[serde(default)]
    pub is_group: bool,
    pub last_msg: String,
    pub last_ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSummary {
    pub username: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageFrame {
    pub chat_id: ChatId,
    pub from: String,
    pub to: String,
    pub content: String,
    pub display_name: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    SignupOk {
        content: String,
    },
    LoginOk {
        content: String,
        display_name: String,
    },
    Error {
        code: ErrorCode,
        content: String,
    },
    Message(MessageFrame),
    Chatlist {
        chats: Vec<ChatPreview>,
    },
    UserSearchResult {
        users: Vec<UserSummary>,
    },
    ChatCreated {
        chat: ChatPreview,
    },
    GroupCreated {
        chat: ChatPreview,
    },
}

impl From<ApiError> for ServerEvent {
    fn from(value: ApiError) -> Self {
        Self::Error {
            code: value.code,
            content: value.message,
        }
    }
}
