use std::sync::Arc;

use domain::{ChatId, CloseOutcome, CHAT_CLOSING_NOTICE};
use tracing::info;

use crate::{
    broadcaster::{BroadcastReport, MessageBroadcast, MessageBroadcaster},
    clock::Clock,
    error::ApplicationError,
    registry::ConnectionRegistry,
    repository::ChatRepository,
    sequencer::ChatSequencer,
};

pub struct LifecycleServiceDependencies {
    pub chat_repository: Arc<dyn ChatRepository>,
    pub registry: ConnectionRegistry,
    pub broadcaster: Arc<dyn MessageBroadcaster>,
    pub sequencer: Arc<ChatSequencer>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReport {
    pub outcome: CloseOutcome,
    /// 关闭通知的投递结果，仅在本次调用完成状态迁移时存在
    pub notified: Option<BroadcastReport>,
    pub disconnected: usize,
}

/// 会话生命周期：Active → Ended
pub struct LifecycleService {
    deps: LifecycleServiceDependencies,
}

impl LifecycleService {
    pub fn new(deps: LifecycleServiceDependencies) -> Self {
        Self { deps }
    }

    /// 关闭会话。幂等：重复关闭或关闭不存在的会话都直接成功，
    /// 只在本次调用完成迁移时广播关闭通知，随后断开所有绑定到该会话的连接。
    pub async fn close(&self, chat_id: &ChatId) -> Result<CloseReport, ApplicationError> {
        // 等待正在写入的消息完成，关闭通知排在其后
        let slot = self.deps.sequencer.acquire(chat_id).await;
        let now = slot.next_timestamp(self.deps.clock.now());
        let outcome = self.deps.chat_repository.mark_ended(chat_id, now).await?;

        let notified = if outcome.transitioned() {
            let notice = MessageBroadcast::system(Some(chat_id.clone()), CHAT_CLOSING_NOTICE, now);
            Some(self.deps.broadcaster.broadcast(chat_id, notice).await?)
        } else {
            None
        };
        drop(slot);

        let purged = self.deps.registry.purge_chat(chat_id).await?;
        for connection in &purged {
            connection.close();
        }

        info!(
            chat_id = %chat_id,
            outcome = ?outcome,
            disconnected = purged.len(),
            "会话已关闭"
        );
        Ok(CloseReport {
            outcome,
            notified,
            disconnected: purged.len(),
        })
    }
}
