//! 应用层实现。
//!
//! 这里提供围绕领域模型的用例服务：消息 ID 生成、发送消息、历史分页、
//! 在线状态，以及每条连接的会话状态机。所有外部依赖（数据库、缓存、
//! 消息代理）都抽象成能力 trait，并在 `memory` 子模块中提供内存实现。

pub mod broker;
pub mod clock;
pub mod dto;
pub mod error;
pub mod id_generator;
pub mod presence;
pub mod repository;
pub mod services;
pub mod session;

pub use broker::{
    Acknowledger, BrokerConsumer, BrokerError, BrokerPublisher, BrokerSubscription, Delivery,
    PresenceBus,
};
pub use clock::{Clock, SystemClock};
pub use dto::{ClientFrame, MessageFrame, ServerFrame};
pub use error::ApplicationError;
pub use id_generator::{IdGenerator, IdGeneratorError, SnowflakeGenerator};
pub use presence::{ConnectionId, PresenceError, PresenceService, PresenceStore};
pub use repository::MessageStore;
pub use services::{
    MessageHistoryService, SendMessageCommand, SendMessageDependencies, SendMessageUseCase,
};
pub use session::{
    CloseReason, ConnectionSession, GatewayContext, SessionSettings, SessionState, WireFrame,
};
