use domain::{ChatId, DomainError, RepositoryError};
use thiserror::Error;

use crate::broadcaster::BroadcastError;
use crate::registry::RegistryError;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("broadcast error: {0}")]
    Broadcast(#[from] BroadcastError),
}

impl ApplicationError {
    pub fn is_chat_ended(&self) -> bool {
        matches!(self, Self::Domain(DomainError::ChatEnded))
    }
}

/// 握手失败。任何变体都意味着连接被丢弃且不会进入注册表。
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("malformed handshake: {0}")]
    Malformed(#[from] DomainError),
    #[error("chat {0} has ended")]
    ChatEnded(ChatId),
    #[error("store unavailable during handshake: {0}")]
    Store(#[from] RepositoryError),
    #[error("registry unavailable during handshake: {0}")]
    Registry(#[from] RegistryError),
}
