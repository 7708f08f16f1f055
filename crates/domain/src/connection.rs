use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;

/// 在线连接唯一标识（仅存在于内存中）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 连接角色。管理员观察所有会话。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionRole {
    Participant,
    Administrator,
}

impl ConnectionRole {
    /// 解析握手中的角色标签，缺省为参与者。客户端不能声明为 `System`。
    pub fn parse(tag: Option<&str>) -> Result<Self, DomainError> {
        match tag.map(str::trim) {
            None | Some("") => Ok(Self::Participant),
            Some(tag) if tag.eq_ignore_ascii_case("participant") => Ok(Self::Participant),
            Some(tag) if tag.eq_ignore_ascii_case("admin") => Ok(Self::Administrator),
            Some(tag) if tag.eq_ignore_ascii_case("system") => Err(DomainError::invalid_argument(
                "role",
                "clients cannot act as System",
            )),
            Some(other) => Err(DomainError::invalid_argument(
                "role",
                format!("unknown role `{other}`"),
            )),
        }
    }

    pub fn is_administrator(&self) -> bool {
        matches!(self, Self::Administrator)
    }
}
