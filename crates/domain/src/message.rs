use serde::{Deserialize, Serialize};

use crate::value_objects::{Identity, MessageContent, Timestamp};

/// 系统通知：新会话建立
pub const SESSION_STARTED_NOTICE: &str = "Chat session started.";
/// 系统通知：握手时会话已关闭
pub const CHAT_CLOSED_NOTICE: &str = "This chat has been closed by the admin.";
/// 系统通知：管理员关闭会话时广播
pub const CHAT_CLOSING_NOTICE: &str =
    "This chat has been closed by the admin. Please refresh the Page";
pub const INVALID_PAYLOAD_NOTICE: &str = "Invalid message payload";
pub const PERSISTENCE_FAILED_NOTICE: &str = "Message could not be saved, please retry";

pub(crate) const ADMIN_TAG: &str = "Admin";
pub(crate) const SYSTEM_TAG: &str = "System";

/// 消息发送方角色标签。
///
/// 线上格式是单个字符串：参与者身份、`"Admin"` 或 `"System"`。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageSender {
    Participant(String),
    Admin,
    System,
}

impl MessageSender {
    pub fn participant(identity: &Identity) -> Self {
        Self::Participant(identity.as_str().to_owned())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Participant(identity) => identity,
            Self::Admin => ADMIN_TAG,
            Self::System => SYSTEM_TAG,
        }
    }
}

impl From<String> for MessageSender {
    fn from(value: String) -> Self {
        match value.as_str() {
            ADMIN_TAG => Self::Admin,
            SYSTEM_TAG => Self::System,
            _ => Self::Participant(value),
        }
    }
}

impl From<MessageSender> for String {
    fn from(value: MessageSender) -> Self {
        match value {
            MessageSender::Participant(identity) => identity,
            other => other.as_str().to_owned(),
        }
    }
}

/// 会话内的一条消息，创建后不可变。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: MessageSender,
    #[serde(rename = "message")]
    pub text: String,
    pub timestamp: Timestamp,
}

impl ChatMessage {
    pub fn new(sender: MessageSender, content: MessageContent, timestamp: Timestamp) -> Self {
        Self {
            sender,
            text: content.into_inner(),
            timestamp,
        }
    }

    pub fn system(text: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            sender: MessageSender::System,
            text: text.into(),
            timestamp,
        }
    }
}
