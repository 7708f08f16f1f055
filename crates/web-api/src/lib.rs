//! Web API 层。
//!
//! 提供 Axum 路由：会话 WebSocket 与会话管理 HTTP 接口，委托给应用层的用例服务。

mod error;
mod routes;
mod state;
mod ws_connection;

pub use error::{ApiError, ErrorBody};
pub use routes::router;
pub use state::AppState;
