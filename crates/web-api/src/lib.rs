//! Web API 层。
//!
//! 提供 Axum 路由：健康检查、长连接升级和历史消息查询，
//! 将请求委托给应用层的会话和用例服务。

mod error;
mod identity;
mod routes;
mod state;
mod transport;

pub use error::{ApiError, ErrorBody};
pub use identity::{AuthenticatedUser, USER_ID_HEADER};
pub use routes::router;
pub use state::AppState;
pub use transport::WsTransport;
