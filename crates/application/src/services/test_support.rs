//! 服务单元测试共用的装配工具

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use domain::{ChatId, ConnectionRole, Timestamp};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    broadcaster::{LocalMessageBroadcaster, MessageBroadcast},
    clock::Clock,
    registry::{ConnectionEndpoint, ConnectionHandle, ConnectionRegistry},
    repository::{memory::InMemoryChatRepository, ChatRepository},
    sequencer::ChatSequencer,
    services::{
        HandshakeService, HandshakeServiceDependencies, LifecycleService,
        LifecycleServiceDependencies, MessageService, MessageServiceDependencies,
    },
};

/// 可手动拨动的时钟
pub struct FixedClock {
    now: Mutex<Timestamp>,
}

impl FixedClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> Timestamp {
        *self.now.lock().unwrap()
    }
}

pub struct Harness {
    pub repository: Arc<dyn ChatRepository>,
    pub registry: ConnectionRegistry,
    pub clock: Arc<FixedClock>,
    pub shutdown: CancellationToken,
    pub handshake: HandshakeService,
    pub messages: MessageService,
    pub lifecycle: LifecycleService,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_repository(Arc::new(InMemoryChatRepository::new()))
    }

    pub fn with_repository(repository: Arc<dyn ChatRepository>) -> Self {
        let registry = ConnectionRegistry::spawn(64);
        let clock = Arc::new(FixedClock::new());
        let sequencer = Arc::new(ChatSequencer::new());
        let broadcaster = Arc::new(LocalMessageBroadcaster::new(
            registry.clone(),
            Duration::from_millis(50),
        ));

        let handshake = HandshakeService::new(HandshakeServiceDependencies {
            chat_repository: repository.clone(),
            registry: registry.clone(),
            clock: clock.clone(),
        });
        let messages = MessageService::new(MessageServiceDependencies {
            chat_repository: repository.clone(),
            broadcaster: broadcaster.clone(),
            sequencer: sequencer.clone(),
            clock: clock.clone(),
        });
        let lifecycle = LifecycleService::new(LifecycleServiceDependencies {
            chat_repository: repository.clone(),
            registry: registry.clone(),
            broadcaster,
            sequencer,
            clock: clock.clone(),
        });

        Self {
            repository,
            registry,
            clock,
            shutdown: CancellationToken::new(),
            handshake,
            messages,
            lifecycle,
        }
    }

    pub fn endpoint(&self) -> (ConnectionEndpoint, mpsc::Receiver<MessageBroadcast>) {
        ConnectionEndpoint::channel(16, &self.shutdown)
    }

    /// 直接把连接放进注册表，绕过握手
    pub async fn attach(
        &self,
        chat_id: Option<&str>,
        role: ConnectionRole,
        identity: &str,
    ) -> (ConnectionHandle, mpsc::Receiver<MessageBroadcast>) {
        let (endpoint, inbox) = self.endpoint();
        let handle = ConnectionHandle::bind(
            endpoint,
            chat_id.map(|id| ChatId::parse(id).unwrap()),
            role,
            identity,
        );
        self.registry.register(handle.clone()).await.unwrap();
        (handle, inbox)
    }
}

pub fn chat_id(raw: &str) -> ChatId {
    ChatId::parse(raw).unwrap()
}

pub fn drain(inbox: &mut mpsc::Receiver<MessageBroadcast>) -> Vec<MessageBroadcast> {
    let mut frames = Vec::new();
    while let Ok(frame) = inbox.try_recv() {
        frames.push(frame);
    }
    frames
}
