//! Redis 消息代理适配器
//!
//! - [`RedisStreamBroker`]：每个用户一个 Stream 作为持久收件队列，经消费者组读取和确认；
//! - [`RedisPresenceBus`]：在线状态事件走 Pub/Sub 频道，每个订阅独占一条连接。

pub mod error;
pub mod pubsub;
pub mod streams;

pub use error::*;
pub use pubsub::RedisPresenceBus;
pub use streams::{RedisStreamBroker, StreamBrokerSettings};
