use std::sync::Arc;

use application::{
    ChatRepository, ChatSequencer, Clock, ConnectionRegistry, HandshakeService,
    HandshakeServiceDependencies, HistoryService, LifecycleService, LifecycleServiceDependencies,
    LocalMessageBroadcaster, MessageBroadcaster, MessageService, MessageServiceDependencies,
    SystemClock,
};
use config::{AppConfig, RelayConfig};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub handshake_service: Arc<HandshakeService>,
    pub message_service: Arc<MessageService>,
    pub lifecycle_service: Arc<LifecycleService>,
    pub history_service: Arc<HistoryService>,
    pub registry: ConnectionRegistry,
    pub clock: Arc<dyn Clock>,
    pub relay: RelayConfig,
    pub cors_origins: Vec<String>,
    /// 进程级关停信号，所有连接的取消信号都挂在它下面
    pub shutdown: CancellationToken,
}

impl AppState {
    /// 装配注册表、广播器、写入通道与各用例服务。需要在 tokio 运行时内调用。
    pub fn new(
        chat_repository: Arc<dyn ChatRepository>,
        config: &AppConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let relay = config.relay.clone();
        let registry = ConnectionRegistry::spawn(relay.registry_buffer);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let sequencer = Arc::new(ChatSequencer::new());
        let broadcaster: Arc<dyn MessageBroadcaster> = Arc::new(LocalMessageBroadcaster::new(
            registry.clone(),
            relay.delivery_timeout(),
        ));

        let handshake_service = HandshakeService::new(HandshakeServiceDependencies {
            chat_repository: chat_repository.clone(),
            registry: registry.clone(),
            clock: clock.clone(),
        });
        let message_service = MessageService::new(MessageServiceDependencies {
            chat_repository: chat_repository.clone(),
            broadcaster: broadcaster.clone(),
            sequencer: sequencer.clone(),
            clock: clock.clone(),
        });
        let lifecycle_service = LifecycleService::new(LifecycleServiceDependencies {
            chat_repository: chat_repository.clone(),
            registry: registry.clone(),
            broadcaster,
            sequencer,
            clock: clock.clone(),
        });
        let history_service = HistoryService::new(chat_repository);

        Self {
            handshake_service: Arc::new(handshake_service),
            message_service: Arc::new(message_service),
            lifecycle_service: Arc::new(lifecycle_service),
            history_service: Arc::new(history_service),
            registry,
            clock,
            relay,
            cors_origins: config.server.cors_origins.clone(),
            shutdown,
        }
    }
}
