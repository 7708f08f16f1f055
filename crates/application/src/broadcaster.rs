use std::time::Duration;

use async_trait::async_trait;
use domain::{ChatId, ChatMessage, Timestamp};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::registry::{ConnectionHandle, ConnectionRegistry, RegistryError};

/// 发往客户端的一帧：`{chatId, sender, message, timestamp}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBroadcast {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub chat_id: Option<ChatId>,
    #[serde(flatten)]
    pub message: ChatMessage,
}

impl MessageBroadcast {
    pub fn chat(chat_id: ChatId, message: ChatMessage) -> Self {
        Self {
            chat_id: Some(chat_id),
            message,
        }
    }

    pub fn system(chat_id: Option<ChatId>, text: impl Into<String>, at: Timestamp) -> Self {
        Self {
            chat_id,
            message: ChatMessage::system(text, at),
        }
    }
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("broadcast failed: {0}")]
    Registry(#[from] RegistryError),
}

/// 一次扇出的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// 因投递失败被移出注册表的连接数
    pub pruned: usize,
}

#[async_trait]
pub trait MessageBroadcaster: Send + Sync {
    /// 投递给绑定到该会话的连接以及全部管理员连接
    async fn broadcast(
        &self,
        chat_id: &ChatId,
        frame: MessageBroadcast,
    ) -> Result<BroadcastReport, BroadcastError>;
}

/// 基于本进程连接注册表的广播器
///
/// 先在注册表中取收件人快照，然后在注册表之外并发投递，每次投递受超时约束。
/// 投递失败的连接立即注销并关闭，不影响其他收件人。
#[derive(Clone)]
pub struct LocalMessageBroadcaster {
    registry: ConnectionRegistry,
    delivery_timeout: Duration,
}

impl LocalMessageBroadcaster {
    pub fn new(registry: ConnectionRegistry, delivery_timeout: Duration) -> Self {
        Self {
            registry,
            delivery_timeout,
        }
    }

    async fn deliver_all(
        &self,
        recipients: Vec<ConnectionHandle>,
        frame: &MessageBroadcast,
    ) -> Result<BroadcastReport, BroadcastError> {
        let timeout = self.delivery_timeout;
        let attempts = recipients.iter().map(|connection| {
            let frame = frame.clone();
            async move { (connection, connection.deliver(frame, timeout).await) }
        });

        let mut report = BroadcastReport::default();
        for (connection, result) in join_all(attempts).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    warn!(
                        connection_id = %connection.id,
                        error = %err,
                        "投递失败，移除死连接"
                    );
                    self.registry.unregister(connection.id).await?;
                    connection.close();
                    report.pruned += 1;
                }
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl MessageBroadcaster for LocalMessageBroadcaster {
    async fn broadcast(
        &self,
        chat_id: &ChatId,
        frame: MessageBroadcast,
    ) -> Result<BroadcastReport, BroadcastError> {
        let recipients = self.registry.recipients(chat_id).await?;
        let report = self.deliver_all(recipients, &frame).await?;
        debug!(
            chat_id = %chat_id,
            delivered = report.delivered,
            pruned = report.pruned,
            "广播完成"
        );
        Ok(report)
    }
}
