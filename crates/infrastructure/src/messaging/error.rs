//! Redis 错误到应用层错误的转换

use application::{BrokerError, PresenceError};

/// 消费者组已存在时 `XGROUP CREATE` 返回的错误码
pub const BUSY_GROUP: &str = "BUSYGROUP";

pub fn connection_error(context: &str, err: redis::RedisError) -> BrokerError {
    BrokerError::Connection(format!("{context}: {err}"))
}

pub fn publish_error(context: &str, err: redis::RedisError) -> BrokerError {
    BrokerError::Publish(format!("{context}: {err}"))
}

pub fn consume_error(context: &str, err: redis::RedisError) -> BrokerError {
    BrokerError::Consume(format!("{context}: {err}"))
}

pub fn ack_error(context: &str, err: redis::RedisError) -> BrokerError {
    BrokerError::Ack(format!("{context}: {err}"))
}

pub fn presence_error(context: &str, err: redis::RedisError) -> PresenceError {
    PresenceError::Store(format!("{context}: {err}"))
}

pub fn is_busy_group(err: &redis::RedisError) -> bool {
    err.code() == Some(BUSY_GROUP) || err.to_string().contains(BUSY_GROUP)
}
