use std::sync::Arc;

use domain::{
    AppendOutcome, ChatMessage, ConnectionRole, DomainError, Identity, MessageContent,
    MessageSender,
};
use tracing::{debug, warn};

use crate::{
    broadcaster::{BroadcastReport, MessageBroadcast, MessageBroadcaster},
    clock::Clock,
    error::ApplicationError,
    registry::ConnectionHandle,
    repository::ChatRepository,
    sequencer::ChatSequencer,
};

pub struct MessageServiceDependencies {
    pub chat_repository: Arc<dyn ChatRepository>,
    pub broadcaster: Arc<dyn MessageBroadcaster>,
    pub sequencer: Arc<ChatSequencer>,
    pub clock: Arc<dyn Clock>,
}

/// 已写入并完成扇出的消息
#[derive(Debug, Clone)]
pub struct PostedMessage {
    pub message: ChatMessage,
    pub report: BroadcastReport,
}

/// 消息中继：先持久化，成功后再广播
pub struct MessageService {
    deps: MessageServiceDependencies,
}

impl MessageService {
    pub fn new(deps: MessageServiceDependencies) -> Self {
        Self { deps }
    }

    /// 发送方由连接决定，客户端自报的发送者字段不参与。
    ///
    /// 写入失败时不广播任何内容；会话已结束时返回 `DomainError::ChatEnded`。
    pub async fn post(
        &self,
        connection: &ConnectionHandle,
        text: &str,
    ) -> Result<PostedMessage, ApplicationError> {
        let chat_id = connection.chat_id.clone().ok_or_else(|| {
            DomainError::invalid_argument("chatId", "connection is not bound to a chat")
        })?;
        let content = MessageContent::new(text)?;
        let sender = match connection.role {
            ConnectionRole::Participant => {
                MessageSender::participant(&Identity::participant(connection.identity.as_str())?)
            }
            ConnectionRole::Administrator => MessageSender::Admin,
        };

        let mut slot = self.deps.sequencer.acquire(&chat_id).await;
        if slot.is_unseeded() {
            slot.seed(self.deps.chat_repository.last_message_at(&chat_id).await?);
        }
        let timestamp = slot.next_timestamp(self.deps.clock.now());
        let message = ChatMessage::new(sender, content, timestamp);

        let outcome = self
            .deps
            .chat_repository
            .append_message(&chat_id, &connection.identity, message.clone())
            .await
            .map_err(|err| {
                warn!(chat_id = %chat_id, error = %err, "消息写入失败");
                err
            })?;
        if outcome == AppendOutcome::ChatEnded {
            debug!(chat_id = %chat_id, "会话已结束，消息被拒绝");
            return Err(DomainError::ChatEnded.into());
        }
        slot.commit(timestamp);

        // 广播在持有写入通道期间完成，保证各收件人看到的顺序与存储一致
        let report = self
            .deps
            .broadcaster
            .broadcast(&chat_id, MessageBroadcast::chat(chat_id.clone(), message.clone()))
            .await?;
        drop(slot);

        debug!(
            chat_id = %chat_id,
            connection_id = %connection.id,
            delivered = report.delivered,
            "消息已中继"
        );
        Ok(PostedMessage { message, report })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MockChatRepository;
    use crate::services::test_support::{chat_id, drain, Harness};
    use domain::RepositoryError;

    #[tokio::test]
    async fn participant_message_is_persisted_then_fanned_out() {
        let harness = Harness::new();
        let (alice, mut alice_inbox) = harness
            .attach(Some("c-1"), ConnectionRole::Participant, "alice@example.com")
            .await;
        let (_admin, mut admin_inbox) = harness
            .attach(None, ConnectionRole::Administrator, "Admin")
            .await;
        let (_other, mut other_inbox) = harness
            .attach(Some("c-2"), ConnectionRole::Participant, "bob@example.com")
            .await;

        let posted = harness.messages.post(&alice, "  hello  ").await.unwrap();
        assert_eq!(posted.message.text, "hello");
        assert_eq!(posted.report.delivered, 2);

        let stored = harness
            .repository
            .find_by_id(&chat_id("c-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.messages, vec![posted.message.clone()]);
        assert_eq!(stored.owner_identity, "alice@example.com");

        let echoed = drain(&mut alice_inbox);
        assert_eq!(echoed.len(), 1);
        assert_eq!(
            echoed[0].message.sender,
            MessageSender::Participant("alice@example.com".into())
        );
        assert_eq!(drain(&mut admin_inbox)[0].chat_id, Some(chat_id("c-1")));
        assert!(drain(&mut other_inbox).is_empty());
    }

    #[tokio::test]
    async fn admin_messages_are_tagged_admin() {
        let harness = Harness::new();
        let (admin, _inbox) = harness
            .attach(Some("c-1"), ConnectionRole::Administrator, "ops@example.com")
            .await;

        let posted = harness.messages.post(&admin, "we are on it").await.unwrap();
        assert_eq!(posted.message.sender, MessageSender::Admin);
    }

    #[tokio::test]
    async fn unbound_admin_cannot_post() {
        let harness = Harness::new();
        let (admin, _inbox) = harness
            .attach(None, ConnectionRole::Administrator, "Admin")
            .await;

        let err = harness.messages.post(&admin, "hello").await.unwrap_err();
        assert!(matches!(
            err,
            ApplicationError::Domain(DomainError::InvalidArgument { field: "chatId", .. })
        ));
    }

    #[tokio::test]
    async fn blank_message_is_rejected_without_side_effects() {
        let harness = Harness::new();
        let (alice, mut inbox) = harness
            .attach(Some("c-1"), ConnectionRole::Participant, "alice@example.com")
            .await;

        assert!(harness.messages.post(&alice, "   ").await.is_err());
        assert!(drain(&mut inbox).is_empty());
        assert!(harness
            .repository
            .find_by_id(&chat_id("c-1"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn ended_chat_rejects_message() {
        let harness = Harness::new();
        let (alice, mut inbox) = harness
            .attach(Some("c-1"), ConnectionRole::Participant, "alice@example.com")
            .await;
        harness.messages.post(&alice, "first").await.unwrap();
        harness
            .repository
            .mark_ended(&chat_id("c-1"), harness.clock.now())
            .await
            .unwrap();
        drain(&mut inbox);

        let err = harness.messages.post(&alice, "late").await.unwrap_err();
        assert!(err.is_chat_ended());
        assert!(drain(&mut inbox).is_empty());
    }

    #[tokio::test]
    async fn store_failure_suppresses_broadcast() {
        let mut repository = MockChatRepository::new();
        repository.expect_last_message_at().returning(|_| Ok(None));
        repository
            .expect_append_message()
            .returning(|_, _, _| Err(RepositoryError::storage("connection reset")));
        let harness = Harness::with_repository(Arc::new(repository));
        let (alice, mut inbox) = harness
            .attach(Some("c-1"), ConnectionRole::Participant, "alice@example.com")
            .await;
        let (_admin, mut admin_inbox) = harness
            .attach(None, ConnectionRole::Administrator, "Admin")
            .await;

        let err = harness.messages.post(&alice, "hello").await.unwrap_err();
        assert!(matches!(err, ApplicationError::Repository(_)));
        assert!(drain(&mut inbox).is_empty());
        assert!(drain(&mut admin_inbox).is_empty());
    }

    #[tokio::test]
    async fn timestamps_stay_monotonic_when_clock_steps_back() {
        let harness = Harness::new();
        let (alice, _inbox) = harness
            .attach(Some("c-1"), ConnectionRole::Participant, "alice@example.com")
            .await;

        let first = harness.messages.post(&alice, "one").await.unwrap();
        harness.clock.advance(chrono::Duration::seconds(-10));
        // 两次发送之间通道已被回收，下界来自存储中的最后一条消息
        let second = harness.messages.post(&alice, "two").await.unwrap();
        assert_eq!(second.message.timestamp, first.message.timestamp);
    }

    #[tokio::test]
    async fn concurrent_posts_keep_store_and_broadcast_order_aligned() {
        let harness = Harness::new();
        let (alice, _alice_inbox) = harness
            .attach(Some("c-1"), ConnectionRole::Participant, "alice@example.com")
            .await;
        let (admin, _admin_own) = harness
            .attach(Some("c-1"), ConnectionRole::Administrator, "Admin")
            .await;
        let (_watcher, mut watcher_inbox) = harness
            .attach(None, ConnectionRole::Administrator, "Admin")
            .await;

        let posts = (0..10).map(|i| {
            let connection = if i % 2 == 0 { &alice } else { &admin };
            let text = format!("message {i}");
            let messages = &harness.messages;
            async move { messages.post(connection, &text).await }
        });
        for result in futures::future::join_all(posts).await {
            result.unwrap();
        }

        let stored = harness
            .repository
            .find_by_id(&chat_id("c-1"))
            .await
            .unwrap()
            .unwrap();
        let observed: Vec<ChatMessage> = drain(&mut watcher_inbox)
            .into_iter()
            .map(|frame| frame.message)
            .collect();
        assert_eq!(stored.messages.len(), 10);
        assert_eq!(observed, stored.messages);
        assert!(stored
            .messages
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp));
    }
}
