use std::sync::Arc;

use domain::{Chat, ChatId, ChatStatus, ChatSummary, DomainError};

use crate::{error::ApplicationError, repository::ChatRepository};

/// 只读查询：会话历史与按状态的会话列表
pub struct HistoryService {
    chat_repository: Arc<dyn ChatRepository>,
}

impl HistoryService {
    pub fn new(chat_repository: Arc<dyn ChatRepository>) -> Self {
        Self { chat_repository }
    }

    pub async fn history(&self, chat_id: &ChatId) -> Result<Chat, ApplicationError> {
        self.chat_repository
            .find_by_id(chat_id)
            .await?
            .ok_or_else(|| DomainError::ChatNotFound.into())
    }

    pub async fn active_chats(
        &self,
        owner_identity: Option<String>,
    ) -> Result<Vec<ChatSummary>, ApplicationError> {
        Ok(self
            .chat_repository
            .list_by_status(ChatStatus::Active, owner_identity)
            .await?)
    }

    pub async fn ended_chats(
        &self,
        owner_identity: Option<String>,
    ) -> Result<Vec<ChatSummary>, ApplicationError> {
        Ok(self
            .chat_repository
            .list_by_status(ChatStatus::Ended, owner_identity)
            .await?)
    }
}
