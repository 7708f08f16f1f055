use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;
use crate::message::{ADMIN_TAG, SYSTEM_TAG};

/// 统一的时间戳类型，全部由服务端分配。
pub type Timestamp = DateTime<Utc>;

/// 会话唯一标识。
///
/// 可以由客户端提供，也可以由服务端生成（UUID v4 字符串）。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(String);

impl ChatId {
    pub const MAX_LEN: usize = 128;

    pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into().trim().to_owned();
        if value.is_empty() {
            return Err(DomainError::invalid_argument("chatId", "cannot be empty"));
        }
        if value.len() > Self::MAX_LEN {
            return Err(DomainError::invalid_argument("chatId", "too long"));
        }
        Ok(Self(value))
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// 握手时解析会话标识：缺省或空白时生成新的标识。
    pub fn resolve(value: Option<&str>) -> Result<Self, DomainError> {
        match value.map(str::trim) {
            None | Some("") => Ok(Self::generate()),
            Some(raw) => Self::parse(raw),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 参与者身份（通常是邮箱）。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub const MAX_LEN: usize = 254;

    pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into().trim().to_owned();
        if value.is_empty() {
            return Err(DomainError::invalid_argument(
                "senderIdentity",
                "cannot be empty",
            ));
        }
        if value.len() > Self::MAX_LEN {
            return Err(DomainError::invalid_argument("senderIdentity", "too long"));
        }
        Ok(Self(value))
    }

    /// 参与者身份不能占用发送方角色标签，否则消息会被当成管理员或系统发出
    pub fn participant(value: impl Into<String>) -> Result<Self, DomainError> {
        let identity = Self::parse(value)?;
        if [ADMIN_TAG, SYSTEM_TAG]
            .iter()
            .any(|tag| identity.0.eq_ignore_ascii_case(tag))
        {
            return Err(DomainError::invalid_argument(
                "senderIdentity",
                "reserved sender tag",
            ));
        }
        Ok(identity)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 经过验证的消息正文。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageContent(String);

impl MessageContent {
    pub const MAX_LEN: usize = 4000;

    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(DomainError::invalid_argument("message", "cannot be empty"));
        }
        if trimmed.len() > Self::MAX_LEN {
            return Err(DomainError::invalid_argument("message", "too long"));
        }
        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}
