//! 客服聊天中继的核心领域模型
//!
//! 包含会话（Chat）、消息、连接角色等实体，以及生命周期状态机的规则。

pub mod chat;
pub mod connection;
pub mod errors;
pub mod message;
pub mod value_objects;

// 重新导出常用类型
pub use chat::*;
pub use connection::*;
pub use errors::*;
pub use message::*;
pub use value_objects::*;
