use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// 统一的时间戳类型。
pub type Timestamp = DateTime<Utc>;

/// 消息正文的最大字符数。
pub const MAX_CONTENT_CHARS: usize = 4000;

/// 用户唯一标识，由外部认证层解析后交给网关。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl UserId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for UserId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<UserId> for u64 {
    fn from(value: UserId) -> Self {
        value.0
    }
}

impl FromStr for UserId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|err| DomainError::invalid_argument("user_id", err.to_string()))
    }
}

/// 消息唯一标识。
///
/// 由服务端按时间有序地生成，数值大小即消息的因果顺序。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl MessageId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for MessageId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<MessageId> for u64 {
    fn from(value: MessageId) -> Self {
        value.0
    }
}

/// 会话对键：两个参与者按数值从小到大排列。
///
/// A→B 与 B→A 的消息落在同一个分区。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PairKey {
    low: UserId,
    high: UserId,
}

impl PairKey {
    pub fn new(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn low(&self) -> UserId {
        self.low
    }

    pub fn high(&self) -> UserId {
        self.high
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.low == user_id || self.high == user_id
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.low, self.high)
    }
}

/// 消息正文内容。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageContent(String);

impl MessageContent {
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::invalid_argument(
                "content",
                "cannot be empty",
            ));
        }
        if value.chars().count() > MAX_CONTENT_CHARS {
            return Err(DomainError::invalid_argument(
                "content",
                format!("exceeds {MAX_CONTENT_CHARS} characters"),
            ));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for MessageContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_key_is_order_independent() {
        for (a, b) in [(1, 2), (2, 1), (7, 7), (0, u64::MAX), (42, 3)] {
            let forward = PairKey::new(UserId(a), UserId(b));
            let backward = PairKey::new(UserId(b), UserId(a));
            assert_eq!(forward, backward);
            assert_eq!(forward.to_string(), backward.to_string());
            assert!(forward.low() <= forward.high());
        }
    }

    #[test]
    fn pair_key_formats_low_then_high() {
        let key = PairKey::new(UserId(20), UserId(3));
        assert_eq!(key.to_string(), "3.20");
        assert!(key.contains(UserId(20)));
        assert!(!key.contains(UserId(4)));
    }

    #[test]
    fn content_rejects_blank_and_oversized() {
        assert!(MessageContent::new("hi").is_ok());
        assert!(MessageContent::new("   ").is_err());
        assert!(MessageContent::new("x".repeat(MAX_CONTENT_CHARS)).is_ok());
        assert!(MessageContent::new("x".repeat(MAX_CONTENT_CHARS + 1)).is_err());
    }

    #[test]
    fn user_id_parses_from_header_text() {
        assert_eq!(" 42 ".parse::<UserId>().unwrap(), UserId(42));
        assert!("abc".parse::<UserId>().is_err());
        assert!("-1".parse::<UserId>().is_err());
    }
}
