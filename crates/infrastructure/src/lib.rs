//! 基础设施层实现。
//!
//! 提供 PostgreSQL 会话存储适配器，实现应用层定义的 `ChatRepository` 契约。

pub mod builder;
pub mod migrations;
pub mod repository;

pub use builder::{Infrastructure, InfrastructureConfig, InfrastructureError};
pub use migrations::MIGRATOR;
pub use repository::{create_pg_pool, PgChatRepository};
