//! 基础设施层实现。
//!
//! 提供 PostgreSQL 消息存储、Redis 在线状态存储、Redis Streams 聊天消息代理
//! 以及 Redis Pub/Sub 在线状态扇出，实现应用层定义的能力接口。

pub mod builder;
pub mod migrations;
pub mod presence_storage;
pub mod messaging;
pub mod repository;
pub mod retry;

pub use builder::{Infrastructure, InfrastructureError};
pub use migrations::MIGRATOR;
pub use presence_storage::RedisPresenceStore;
pub use messaging::{RedisPresenceBus, RedisStreamBroker, StreamBrokerSettings};
pub use repository::{create_pg_pool, PgMessageStore};
pub use retry::{retry_async, Backoff, RetryConfig};
