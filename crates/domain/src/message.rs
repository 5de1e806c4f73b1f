//! 点对点聊天消息

use serde::{Deserialize, Serialize};

use crate::value_objects::{MessageContent, MessageId, PairKey, Timestamp, UserId};

/// 已持久化的一条私聊消息。
///
/// 序列化格式即历史接口和投递到收件人的负载格式：
/// `{"id", "from", "to", "content", "createdAt"}`。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(rename = "from")]
    pub from_id: UserId,
    #[serde(rename = "to")]
    pub to_id: UserId,
    pub content: MessageContent,
    #[serde(rename = "createdAt")]
    pub created_at: Timestamp,
}

impl Message {
    pub fn new(
        id: MessageId,
        from_id: UserId,
        to_id: UserId,
        content: MessageContent,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            from_id,
            to_id,
            content,
            created_at,
        }
    }

    /// 消息所属的会话对。
    pub fn pair_key(&self) -> PairKey {
        PairKey::new(self.from_id, self.to_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample() -> Message {
        Message::new(
            MessageId(9),
            UserId(5),
            UserId(2),
            MessageContent::new("hello").unwrap(),
            Utc.with_ymd_and_hms(2024, 6, 13, 8, 0, 0).unwrap(),
        )
    }

    #[test]
    fn message_serializes_with_wire_field_names() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["id"], 9);
        assert_eq!(value["from"], 5);
        assert_eq!(value["to"], 2);
        assert_eq!(value["content"], "hello");
        assert!(value["createdAt"].as_str().unwrap().starts_with("2024-06-13T08:00:00"));
    }

    #[test]
    fn message_pair_key_is_sorted() {
        assert_eq!(sample().pair_key().to_string(), "2.5");
    }

    #[test]
    fn message_deserializes_back() {
        let text = serde_json::to_string(&sample()).unwrap();
        let parsed: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, sample());
    }
}
