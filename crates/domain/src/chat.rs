use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::message::ChatMessage;
use crate::value_objects::{ChatId, Identity, Timestamp};

/// 会话生命周期状态：Active → Ended，Ended 为终态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatStatus {
    Active,
    Ended,
}

impl ChatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Ended => "ended",
        }
    }
}

impl fmt::Display for ChatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "ended" => Ok(Self::Ended),
            other => Err(DomainError::invalid_argument(
                "status",
                format!("unknown chat status `{other}`"),
            )),
        }
    }
}

/// 持久化的会话文档，消息内嵌在文档中。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub chat_id: ChatId,
    #[serde(rename = "userEmail")]
    pub owner_identity: String,
    pub status: ChatStatus,
    pub messages: Vec<ChatMessage>,
    pub last_message: Option<ChatMessage>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Chat {
    pub fn new_active(chat_id: ChatId, owner: &Identity, now: Timestamp) -> Self {
        Self {
            chat_id,
            owner_identity: owner.as_str().to_owned(),
            status: ChatStatus::Active,
            messages: Vec::new(),
            last_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.status == ChatStatus::Ended
    }

    /// 追加消息并刷新 `last_message` 缓存；已结束的会话拒绝追加。
    pub fn append(&mut self, message: ChatMessage) -> Result<(), DomainError> {
        if self.is_ended() {
            return Err(DomainError::ChatEnded);
        }
        self.updated_at = message.timestamp;
        self.last_message = Some(message.clone());
        self.messages.push(message);
        Ok(())
    }

    /// 进入 Ended 状态，返回本次调用是否发生了状态迁移。
    pub fn end(&mut self, now: Timestamp) -> bool {
        if self.is_ended() {
            return false;
        }
        self.status = ChatStatus::Ended;
        self.updated_at = now;
        true
    }

    pub fn summary(&self) -> ChatSummary {
        ChatSummary {
            chat_id: self.chat_id.clone(),
            owner_identity: self.owner_identity.clone(),
            status: self.status,
            last_message: self.last_message.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// 列表查询使用的会话摘要（不含完整历史）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub chat_id: ChatId,
    #[serde(rename = "userEmail")]
    pub owner_identity: String,
    pub status: ChatStatus,
    pub last_message: Option<ChatMessage>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// "不存在则创建" 的结果：当前文档状态以及本次调用是否完成了创建。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsuredChat {
    pub summary: ChatSummary,
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// 会话已结束，消息未写入
    ChatEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// 本次调用把会话从 Active 迁移到 Ended
    Closed,
    AlreadyEnded,
    NotFound,
}

impl CloseOutcome {
    pub fn transitioned(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageSender;
    use chrono::{Duration, Utc};

    fn owner() -> Identity {
        Identity::parse("alice@example.com").unwrap()
    }

    #[test]
    fn new_chat_is_active_and_empty() {
        let chat = Chat::new_active(ChatId::parse("c-1").unwrap(), &owner(), Utc::now());
        assert_eq!(chat.status, ChatStatus::Active);
        assert!(chat.messages.is_empty());
        assert!(chat.last_message.is_none());
    }

    #[test]
    fn append_updates_last_message_cache() {
        let now = Utc::now();
        let mut chat = Chat::new_active(ChatId::parse("c-1").unwrap(), &owner(), now);
        let first = ChatMessage::system("one", now);
        let second = ChatMessage {
            sender: MessageSender::Admin,
            text: "two".into(),
            timestamp: now + Duration::seconds(1),
        };
        chat.append(first).unwrap();
        chat.append(second.clone()).unwrap();

        assert_eq!(chat.messages.len(), 2);
        assert_eq!(chat.last_message, Some(second.clone()));
        assert_eq!(chat.updated_at, second.timestamp);
    }

    #[test]
    fn ended_is_terminal() {
        let now = Utc::now();
        let mut chat = Chat::new_active(ChatId::parse("c-1").unwrap(), &owner(), now);
        assert!(chat.end(now));
        assert!(!chat.end(now));
        assert_eq!(
            chat.append(ChatMessage::system("late", now)),
            Err(DomainError::ChatEnded)
        );
        assert!(chat.messages.is_empty());
    }

    #[test]
    fn status_parses_persisted_form() {
        assert_eq!("active".parse::<ChatStatus>().unwrap(), ChatStatus::Active);
        assert_eq!("ended".parse::<ChatStatus>().unwrap(), ChatStatus::Ended);
        assert!("closed".parse::<ChatStatus>().is_err());
    }

    #[test]
    fn summary_serializes_owner_as_user_email() {
        let chat = Chat::new_active(ChatId::parse("c-1").unwrap(), &owner(), Utc::now());
        let json = serde_json::to_value(chat.summary()).unwrap();
        assert_eq!(json["chatId"], "c-1");
        assert_eq!(json["userEmail"], "alice@example.com");
        assert_eq!(json["status"], "active");
        assert!(json["lastMessage"].is_null());
    }
}
