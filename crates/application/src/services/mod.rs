mod handshake_service;
mod history_service;
mod lifecycle_service;
mod message_service;

#[cfg(test)]
mod test_support;

pub use handshake_service::{HandshakeRequest, HandshakeService, HandshakeServiceDependencies};
pub use history_service::HistoryService;
pub use lifecycle_service::{CloseReport, LifecycleService, LifecycleServiceDependencies};
pub use message_service::{MessageService, MessageServiceDependencies, PostedMessage};
