use async_trait::async_trait;
use domain::{
    AppendOutcome, Chat, ChatId, ChatMessage, ChatStatus, ChatSummary, CloseOutcome, EnsuredChat,
    RepositoryError, Timestamp,
};

/// 会话存储适配器契约。
///
/// 每个写操作对单个会话文档都是原子的：
/// - `create_if_absent` 只在文档不存在时插入，已存在时不修改任何字段；
/// - `append_message` 只在会话未结束时追加，文档缺失时以 Active 状态连同该消息一起创建；
/// - `mark_ended` 无条件进入 Ended，并报告本次调用是否发生了状态迁移。
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn create_if_absent(&self, chat: Chat) -> Result<EnsuredChat, RepositoryError>;

    async fn find_status(&self, chat_id: &ChatId) -> Result<Option<ChatStatus>, RepositoryError>;

    async fn append_message(
        &self,
        chat_id: &ChatId,
        owner_identity: &str,
        message: ChatMessage,
    ) -> Result<AppendOutcome, RepositoryError>;

    /// 最后一条消息的时间戳，用于初始化会话的写入通道
    async fn last_message_at(
        &self,
        chat_id: &ChatId,
    ) -> Result<Option<Timestamp>, RepositoryError>;

    async fn mark_ended(
        &self,
        chat_id: &ChatId,
        at: Timestamp,
    ) -> Result<CloseOutcome, RepositoryError>;

    async fn find_by_id(&self, chat_id: &ChatId) -> Result<Option<Chat>, RepositoryError>;

    /// 按状态列出会话，`owner_identity` 为 `None` 时不按所有者过滤。
    /// 结果按最近更新时间倒序。
    async fn list_by_status(
        &self,
        status: ChatStatus,
        owner_identity: Option<String>,
    ) -> Result<Vec<ChatSummary>, RepositoryError>;
}

pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    /// 进程内会话存储，用于开发环境和测试。
    #[derive(Default)]
    pub struct InMemoryChatRepository {
        chats: RwLock<HashMap<ChatId, Chat>>,
    }

    impl InMemoryChatRepository {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl ChatRepository for InMemoryChatRepository {
        async fn create_if_absent(&self, chat: Chat) -> Result<EnsuredChat, RepositoryError> {
            let mut chats = self.chats.write().await;
            if let Some(existing) = chats.get(&chat.chat_id) {
                return Ok(EnsuredChat {
                    summary: existing.summary(),
                    created: false,
                });
            }
            let summary = chat.summary();
            chats.insert(chat.chat_id.clone(), chat);
            Ok(EnsuredChat {
                summary,
                created: true,
            })
        }

        async fn find_status(
            &self,
            chat_id: &ChatId,
        ) -> Result<Option<ChatStatus>, RepositoryError> {
            let chats = self.chats.read().await;
            Ok(chats.get(chat_id).map(|chat| chat.status))
        }

        async fn append_message(
            &self,
            chat_id: &ChatId,
            owner_identity: &str,
            message: ChatMessage,
        ) -> Result<AppendOutcome, RepositoryError> {
            let mut chats = self.chats.write().await;
            let chat = chats.entry(chat_id.clone()).or_insert_with(|| Chat {
                chat_id: chat_id.clone(),
                owner_identity: owner_identity.to_owned(),
                status: ChatStatus::Active,
                messages: Vec::new(),
                last_message: None,
                created_at: message.timestamp,
                updated_at: message.timestamp,
            });
            match chat.append(message) {
                Ok(()) => Ok(AppendOutcome::Appended),
                Err(_) => Ok(AppendOutcome::ChatEnded),
            }
        }

        async fn last_message_at(
            &self,
            chat_id: &ChatId,
        ) -> Result<Option<Timestamp>, RepositoryError> {
            let chats = self.chats.read().await;
            Ok(chats
                .get(chat_id)
                .and_then(|chat| chat.last_message.as_ref())
                .map(|message| message.timestamp))
        }

        async fn mark_ended(
            &self,
            chat_id: &ChatId,
            at: Timestamp,
        ) -> Result<CloseOutcome, RepositoryError> {
            let mut chats = self.chats.write().await;
            Ok(match chats.get_mut(chat_id) {
                Some(chat) => {
                    if chat.end(at) {
                        CloseOutcome::Closed
                    } else {
                        CloseOutcome::AlreadyEnded
                    }
                }
                None => CloseOutcome::NotFound,
            })
        }

        async fn find_by_id(&self, chat_id: &ChatId) -> Result<Option<Chat>, RepositoryError> {
            let chats = self.chats.read().await;
            Ok(chats.get(chat_id).cloned())
        }

        async fn list_by_status(
            &self,
            status: ChatStatus,
            owner_identity: Option<String>,
        ) -> Result<Vec<ChatSummary>, RepositoryError> {
            let chats = self.chats.read().await;
            let mut items: Vec<ChatSummary> = chats
                .values()
                .filter(|chat| chat.status == status)
                .filter(|chat| {
                    owner_identity
                        .as_deref()
                        .map_or(true, |owner| chat.owner_identity == owner)
                })
                .map(Chat::summary)
                .collect();
            items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            Ok(items)
        }
    }

}
