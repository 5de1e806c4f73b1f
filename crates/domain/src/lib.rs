//! 聊天网关核心领域模型
//!
//! 包含用户标识、点对点消息、会话对键以及在线状态事件。

pub mod errors;
pub mod message;
pub mod presence;
pub mod value_objects;

// 重新导出常用类型
pub use errors::*;
pub use message::*;
pub use presence::*;
pub use value_objects::*;
