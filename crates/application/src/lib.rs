//! 应用层实现。
//!
//! 围绕领域模型提供实时中继的用例服务：握手、消息持久化、会话生命周期、
//! 广播扇出，以及对外部适配器（会话存储、时钟）的抽象。

pub mod broadcaster;
pub mod clock;
pub mod error;
pub mod registry;
pub mod repository;
pub mod sequencer;
pub mod services;

pub use broadcaster::{
    BroadcastError, BroadcastReport, LocalMessageBroadcaster, MessageBroadcast,
    MessageBroadcaster,
};
pub use clock::{Clock, SystemClock};
pub use error::{ApplicationError, HandshakeError};
pub use registry::{
    ConnectionEndpoint, ConnectionHandle, ConnectionRegistry, DeliveryError, RegistryError,
};
pub use repository::{memory::InMemoryChatRepository, ChatRepository};
pub use sequencer::ChatSequencer;
pub use services::{
    CloseReport, HandshakeRequest, HandshakeService, HandshakeServiceDependencies,
    HistoryService, LifecycleService, LifecycleServiceDependencies, MessageService,
    MessageServiceDependencies, PostedMessage,
};
