//! 连接注册表
//!
//! 单个 actor 任务独占 `ConnectionId → ConnectionHandle` 映射，所有注册、注销、
//! 查询和清理请求都经由 mpsc 通道串行处理。注册表句柄可以随意克隆注入。

use std::collections::HashMap;
use std::time::Duration;

use domain::{ChatId, ConnectionId, ConnectionRole};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broadcaster::MessageBroadcast;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection registry has shut down")]
    Closed,
}

/// 单个连接的投递失败，调用方据此把该连接视为死连接
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("connection outbound channel is closed")]
    Closed,
    #[error("delivery timed out")]
    Timeout,
}

/// 尚未绑定会话的连接端点：出站帧通道和取消信号
#[derive(Debug, Clone)]
pub struct ConnectionEndpoint {
    outbound: mpsc::Sender<MessageBroadcast>,
    cancel: CancellationToken,
}

impl ConnectionEndpoint {
    /// 创建出站通道，取消信号挂在 `parent` 之下（通常是进程级关停信号）
    pub fn channel(
        buffer: usize,
        parent: &CancellationToken,
    ) -> (Self, mpsc::Receiver<MessageBroadcast>) {
        let (outbound, receiver) = mpsc::channel(buffer.max(1));
        let endpoint = Self {
            outbound,
            cancel: parent.child_token(),
        };
        (endpoint, receiver)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// 已完成握手的在线连接
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    /// 绑定的会话；未指定会话的管理员连接为 `None`
    pub chat_id: Option<ChatId>,
    pub role: ConnectionRole,
    pub identity: String,
    outbound: mpsc::Sender<MessageBroadcast>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn bind(
        endpoint: ConnectionEndpoint,
        chat_id: Option<ChatId>,
        role: ConnectionRole,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            chat_id,
            role,
            identity: identity.into(),
            outbound: endpoint.outbound,
            cancel: endpoint.cancel,
        }
    }

    pub fn is_bound_to(&self, chat_id: &ChatId) -> bool {
        self.chat_id.as_ref() == Some(chat_id)
    }

    /// 在限定时间内把一帧放入该连接的出站通道
    pub async fn deliver(
        &self,
        frame: MessageBroadcast,
        timeout: Duration,
    ) -> Result<(), DeliveryError> {
        if self.cancel.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        self.outbound
            .send_timeout(frame, timeout)
            .await
            .map_err(|err| match err {
                mpsc::error::SendTimeoutError::Timeout(_) => DeliveryError::Timeout,
                mpsc::error::SendTimeoutError::Closed(_) => DeliveryError::Closed,
            })
    }

    /// 不等待地入队，供握手确认等只能发生在空通道上的场景使用
    pub fn try_deliver(&self, frame: MessageBroadcast) -> Result<(), DeliveryError> {
        self.outbound.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Timeout,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// 通知连接任务关闭（写任务会先发完已入队的帧）
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

enum RegistryCommand {
    Register {
        handle: ConnectionHandle,
        reply: oneshot::Sender<()>,
    },
    Unregister {
        id: ConnectionId,
        reply: oneshot::Sender<Option<ConnectionHandle>>,
    },
    Matching {
        chat_id: ChatId,
        reply: oneshot::Sender<Vec<ConnectionHandle>>,
    },
    Administrators {
        reply: oneshot::Sender<Vec<ConnectionHandle>>,
    },
    Recipients {
        chat_id: ChatId,
        reply: oneshot::Sender<Vec<ConnectionHandle>>,
    },
    PurgeChat {
        chat_id: ChatId,
        reply: oneshot::Sender<Vec<ConnectionHandle>>,
    },
    Len {
        reply: oneshot::Sender<usize>,
    },
}

/// 连接注册表句柄
#[derive(Clone)]
pub struct ConnectionRegistry {
    commands: mpsc::Sender<RegistryCommand>,
}

impl ConnectionRegistry {
    /// 启动注册表 actor。所有句柄被丢弃后 actor 自动退出。
    pub fn spawn(buffer: usize) -> Self {
        let (commands, receiver) = mpsc::channel(buffer.max(1));
        let actor = RegistryActor {
            connections: HashMap::new(),
            commands: receiver,
        };
        tokio::spawn(actor.run());
        Self { commands }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, RegistryError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| RegistryError::Closed)?;
        response.await.map_err(|_| RegistryError::Closed)
    }

    pub async fn register(&self, handle: ConnectionHandle) -> Result<(), RegistryError> {
        self.request(|reply| RegistryCommand::Register { handle, reply })
            .await
    }

    /// 幂等：注销不存在的连接返回 `None`
    pub async fn unregister(
        &self,
        id: ConnectionId,
    ) -> Result<Option<ConnectionHandle>, RegistryError> {
        self.request(|reply| RegistryCommand::Unregister { id, reply })
            .await
    }

    /// 绑定到该会话的全部连接（参与者以及指定了该会话的管理员）
    pub async fn matching(&self, chat_id: &ChatId) -> Result<Vec<ConnectionHandle>, RegistryError> {
        let chat_id = chat_id.clone();
        self.request(|reply| RegistryCommand::Matching { chat_id, reply })
            .await
    }

    pub async fn administrators(&self) -> Result<Vec<ConnectionHandle>, RegistryError> {
        self.request(|reply| RegistryCommand::Administrators { reply })
            .await
    }

    /// `matching(chat_id) ∪ administrators()` 的一致快照，已去重
    pub async fn recipients(
        &self,
        chat_id: &ChatId,
    ) -> Result<Vec<ConnectionHandle>, RegistryError> {
        let chat_id = chat_id.clone();
        self.request(|reply| RegistryCommand::Recipients { chat_id, reply })
            .await
    }

    /// 移除并返回所有绑定到该会话的连接
    pub async fn purge_chat(
        &self,
        chat_id: &ChatId,
    ) -> Result<Vec<ConnectionHandle>, RegistryError> {
        let chat_id = chat_id.clone();
        self.request(|reply| RegistryCommand::PurgeChat { chat_id, reply })
            .await
    }

    pub async fn len(&self) -> Result<usize, RegistryError> {
        self.request(|reply| RegistryCommand::Len { reply }).await
    }

    pub async fn is_empty(&self) -> Result<bool, RegistryError> {
        Ok(self.len().await? == 0)
    }
}

struct RegistryActor {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    commands: mpsc::Receiver<RegistryCommand>,
}

impl RegistryActor {
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            self.handle(command);
        }
        debug!(
            remaining = self.connections.len(),
            "connection registry stopped"
        );
    }

    // 调用方可能已放弃等待，回复失败可以忽略
    fn handle(&mut self, command: RegistryCommand) {
        match command {
            RegistryCommand::Register { handle, reply } => {
                info!(
                    connection_id = %handle.id,
                    chat_id = ?handle.chat_id.as_ref().map(ChatId::as_str),
                    role = ?handle.role,
                    "连接已注册"
                );
                self.connections.insert(handle.id, handle);
                let _ = reply.send(());
            }
            RegistryCommand::Unregister { id, reply } => {
                let removed = self.connections.remove(&id);
                if removed.is_some() {
                    debug!(connection_id = %id, "连接已注销");
                }
                let _ = reply.send(removed);
            }
            RegistryCommand::Matching { chat_id, reply } => {
                let _ = reply.send(self.select(|handle| handle.is_bound_to(&chat_id)));
            }
            RegistryCommand::Administrators { reply } => {
                let _ = reply.send(self.select(|handle| handle.role.is_administrator()));
            }
            RegistryCommand::Recipients { chat_id, reply } => {
                let _ = reply.send(self.select(|handle| {
                    handle.is_bound_to(&chat_id) || handle.role.is_administrator()
                }));
            }
            RegistryCommand::PurgeChat { chat_id, reply } => {
                let ids: Vec<ConnectionId> = self
                    .connections
                    .values()
                    .filter(|handle| handle.is_bound_to(&chat_id))
                    .map(|handle| handle.id)
                    .collect();
                let purged: Vec<ConnectionHandle> = ids
                    .iter()
                    .filter_map(|id| self.connections.remove(id))
                    .collect();
                info!(chat_id = %chat_id, purged = purged.len(), "会话连接已清理");
                let _ = reply.send(purged);
            }
            RegistryCommand::Len { reply } => {
                let _ = reply.send(self.connections.len());
            }
        }
    }

    fn select(&self, predicate: impl Fn(&ConnectionHandle) -> bool) -> Vec<ConnectionHandle> {
        self.connections
            .values()
            .filter(|handle| predicate(handle))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn connect(
        chat: Option<&str>,
        role: ConnectionRole,
    ) -> (ConnectionHandle, mpsc::Receiver<MessageBroadcast>) {
        let root = CancellationToken::new();
        let (endpoint, receiver) = ConnectionEndpoint::channel(4, &root);
        let handle = ConnectionHandle::bind(
            endpoint,
            chat.map(|id| ChatId::parse(id).unwrap()),
            role,
            "tester",
        );
        (handle, receiver)
    }

    fn ids(handles: &[ConnectionHandle]) -> HashSet<ConnectionId> {
        handles.iter().map(|handle| handle.id).collect()
    }

    #[tokio::test]
    async fn matching_and_administrators_partition_connections() {
        let registry = ConnectionRegistry::spawn(16);
        let (alice, _rx1) = connect(Some("c-1"), ConnectionRole::Participant);
        let (bob, _rx2) = connect(Some("c-2"), ConnectionRole::Participant);
        let (admin, _rx3) = connect(None, ConnectionRole::Administrator);

        for handle in [&alice, &bob, &admin] {
            registry.register(handle.clone()).await.unwrap();
        }

        let c1 = ChatId::parse("c-1").unwrap();
        assert_eq!(ids(&registry.matching(&c1).await.unwrap()), HashSet::from([alice.id]));
        assert_eq!(
            ids(&registry.administrators().await.unwrap()),
            HashSet::from([admin.id])
        );
        assert_eq!(
            ids(&registry.recipients(&c1).await.unwrap()),
            HashSet::from([alice.id, admin.id])
        );
        assert_eq!(registry.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn recipients_do_not_duplicate_admins_bound_to_the_chat() {
        let registry = ConnectionRegistry::spawn(16);
        let (admin, _rx) = connect(Some("c-1"), ConnectionRole::Administrator);
        registry.register(admin.clone()).await.unwrap();

        let c1 = ChatId::parse("c-1").unwrap();
        assert_eq!(registry.recipients(&c1).await.unwrap().len(), 1);
        assert_eq!(registry.matching(&c1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = ConnectionRegistry::spawn(16);
        let (alice, _rx) = connect(Some("c-1"), ConnectionRole::Participant);
        registry.register(alice.clone()).await.unwrap();

        assert!(registry.unregister(alice.id).await.unwrap().is_some());
        assert!(registry.unregister(alice.id).await.unwrap().is_none());
        assert!(registry.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn purge_removes_participants_and_bound_admins_only() {
        let registry = ConnectionRegistry::spawn(16);
        let (alice, _rx1) = connect(Some("c-1"), ConnectionRole::Participant);
        let (bound_admin, _rx2) = connect(Some("c-1"), ConnectionRole::Administrator);
        let (roaming_admin, _rx3) = connect(None, ConnectionRole::Administrator);
        let (bob, _rx4) = connect(Some("c-2"), ConnectionRole::Participant);
        for handle in [&alice, &bound_admin, &roaming_admin, &bob] {
            registry.register(handle.clone()).await.unwrap();
        }

        let c1 = ChatId::parse("c-1").unwrap();
        let purged = registry.purge_chat(&c1).await.unwrap();
        assert_eq!(ids(&purged), HashSet::from([alice.id, bound_admin.id]));
        assert!(registry.matching(&c1).await.unwrap().is_empty());
        assert_eq!(
            ids(&registry.administrators().await.unwrap()),
            HashSet::from([roaming_admin.id])
        );
        assert!(registry.purge_chat(&c1).await.unwrap().is_empty());
        assert_eq!(registry.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn deliver_reports_closed_and_full_channels() {
        let (handle, receiver) = connect(Some("c-1"), ConnectionRole::Participant);
        let frame = MessageBroadcast::system(None, "ping", chrono::Utc::now());

        for _ in 0..4 {
            handle
                .deliver(frame.clone(), Duration::from_millis(10))
                .await
                .unwrap();
        }
        assert_eq!(
            handle.deliver(frame.clone(), Duration::from_millis(10)).await,
            Err(DeliveryError::Timeout)
        );

        drop(receiver);
        assert_eq!(
            handle.deliver(frame, Duration::from_millis(10)).await,
            Err(DeliveryError::Closed)
        );
    }

    #[tokio::test]
    async fn child_token_follows_process_shutdown() {
        let root = CancellationToken::new();
        let (endpoint, _rx) = ConnectionEndpoint::channel(1, &root);
        let handle = ConnectionHandle::bind(endpoint, None, ConnectionRole::Administrator, "ops");
        assert!(!handle.is_closed());
        root.cancel();
        assert!(handle.is_closed());
    }
}
