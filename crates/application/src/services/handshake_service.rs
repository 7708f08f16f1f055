use std::sync::Arc;

use domain::{
    Chat, ChatId, ChatStatus, ConnectionRole, Identity, CHAT_CLOSED_NOTICE,
    SESSION_STARTED_NOTICE,
};
use tracing::{info, warn};

use crate::{
    broadcaster::MessageBroadcast,
    clock::Clock,
    error::HandshakeError,
    registry::{ConnectionEndpoint, ConnectionHandle, ConnectionRegistry},
    repository::ChatRepository,
};

const DEFAULT_ADMIN_IDENTITY: &str = "Admin";

/// 连接上的第一帧
#[derive(Debug, Clone, Default)]
pub struct HandshakeRequest {
    pub chat_id: Option<String>,
    pub identity: Option<String>,
    pub role: Option<String>,
}

pub struct HandshakeServiceDependencies {
    pub chat_repository: Arc<dyn ChatRepository>,
    pub registry: ConnectionRegistry,
    pub clock: Arc<dyn Clock>,
}

/// 握手协议：解析或创建会话身份并把连接绑定进注册表
pub struct HandshakeService {
    deps: HandshakeServiceDependencies,
}

impl HandshakeService {
    pub fn new(deps: HandshakeServiceDependencies) -> Self {
        Self { deps }
    }

    /// 完成握手。成功时连接已注册，确认消息已放入其出站通道。
    ///
    /// 失败时连接不会留在注册表中，调用方负责丢弃连接；
    /// `ChatEnded` 时应先发送 [`HandshakeService::closed_notice`]。
    pub async fn accept(
        &self,
        request: HandshakeRequest,
        endpoint: ConnectionEndpoint,
    ) -> Result<ConnectionHandle, HandshakeError> {
        let role = ConnectionRole::parse(request.role.as_deref())?;
        let handle = match role {
            ConnectionRole::Participant => self.bind_participant(request, endpoint).await?,
            ConnectionRole::Administrator => self.bind_administrator(request, endpoint).await?,
        };

        self.deps.registry.register(handle.clone()).await?;

        // 注册前后之间可能有关闭请求提交，注册后再确认一次状态
        if let Some(chat_id) = handle.chat_id.clone() {
            match self.deps.chat_repository.find_status(&chat_id).await {
                Ok(Some(ChatStatus::Ended)) => {
                    self.deps.registry.unregister(handle.id).await?;
                    return Err(HandshakeError::ChatEnded(chat_id));
                }
                Ok(_) => {}
                Err(err) => {
                    self.deps.registry.unregister(handle.id).await?;
                    return Err(HandshakeError::Store(err));
                }
            }
        }

        // 复核通过后才确认，被拒绝的握手只会收到一条终止通知
        let confirmation = MessageBroadcast::system(
            handle.chat_id.clone(),
            SESSION_STARTED_NOTICE,
            self.deps.clock.now(),
        );
        if let Err(err) = handle.try_deliver(confirmation) {
            warn!(connection_id = %handle.id, error = %err, "握手确认入队失败");
        }

        info!(
            connection_id = %handle.id,
            chat_id = ?handle.chat_id.as_ref().map(ChatId::as_str),
            role = ?handle.role,
            "握手完成"
        );
        Ok(handle)
    }

    /// 拒绝已结束会话时发送的终止通知
    pub fn closed_notice(&self, chat_id: &ChatId) -> MessageBroadcast {
        MessageBroadcast::system(
            Some(chat_id.clone()),
            CHAT_CLOSED_NOTICE,
            self.deps.clock.now(),
        )
    }

    async fn bind_participant(
        &self,
        request: HandshakeRequest,
        endpoint: ConnectionEndpoint,
    ) -> Result<ConnectionHandle, HandshakeError> {
        let identity = Identity::participant(request.identity.unwrap_or_default())?;
        let chat_id = ChatId::resolve(request.chat_id.as_deref())?;

        let chat = Chat::new_active(chat_id.clone(), &identity, self.deps.clock.now());
        let ensured = self.deps.chat_repository.create_if_absent(chat).await?;
        if ensured.summary.status == ChatStatus::Ended {
            info!(chat_id = %chat_id, "会话已关闭，拒绝握手");
            return Err(HandshakeError::ChatEnded(chat_id));
        }
        if ensured.created {
            info!(chat_id = %chat_id, owner = %identity, "新会话已创建");
        }

        Ok(ConnectionHandle::bind(
            endpoint,
            Some(chat_id),
            ConnectionRole::Participant,
            identity.into_inner(),
        ))
    }

    /// 管理员可以不指定会话（只观察全部消息）；指定会话时不替其创建文档
    async fn bind_administrator(
        &self,
        request: HandshakeRequest,
        endpoint: ConnectionEndpoint,
    ) -> Result<ConnectionHandle, HandshakeError> {
        let identity = match request.identity.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_ADMIN_IDENTITY.to_owned(),
            Some(raw) => Identity::parse(raw)?.into_inner(),
        };

        let chat_id = match request.chat_id.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(ChatId::parse(raw)?),
        };

        if let Some(chat_id) = &chat_id {
            let status = self.deps.chat_repository.find_status(chat_id).await?;
            if status == Some(ChatStatus::Ended) {
                info!(chat_id = %chat_id, "会话已关闭，拒绝管理员握手");
                return Err(HandshakeError::ChatEnded(chat_id.clone()));
            }
        }

        Ok(ConnectionHandle::bind(
            endpoint,
            chat_id,
            ConnectionRole::Administrator,
            identity,
        ))
    }
}
