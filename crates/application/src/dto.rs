//! 连接上收发的 JSON 帧

use domain::{Message, MessageId, PresenceEvent, Timestamp, UserId};
use serde::{Deserialize, Serialize};

/// 客户端发来的发送请求，发送方由服务端根据认证身份填充
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientFrame {
    pub to: UserId,
    pub content: String,
}

/// 下发给客户端的聊天消息，历史查询返回的也是这个格式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFrame {
    pub id: MessageId,
    pub from: UserId,
    pub content: String,
    #[serde(rename = "createdAt")]
    pub created_at: Timestamp,
}

impl From<&Message> for MessageFrame {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            from: message.from_id,
            content: message.content.as_str().to_owned(),
            created_at: message.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Message(MessageFrame),
    Presence(PresenceEvent),
    Error { error: String },
}

impl ServerFrame {
    pub fn error(text: impl Into<String>) -> Self {
        ServerFrame::Error { error: text.into() }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use domain::MessageContent;

    #[test]
    fn message_frame_omits_recipient() {
        let message = Message::new(
            MessageId(11),
            UserId(1),
            UserId(2),
            MessageContent::new("hi").unwrap(),
            Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap(),
        );
        let json = ServerFrame::Message(MessageFrame::from(&message))
            .to_json()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["id"], 11);
        assert_eq!(value["from"], 1);
        assert_eq!(value["content"], "hi");
        assert_eq!(value["createdAt"], "2024-07-01T12:00:00Z");
        assert!(value.get("to").is_none());
    }

    #[test]
    fn error_and_presence_frames() {
        assert_eq!(
            ServerFrame::error("boom").to_json().unwrap(),
            r#"{"error":"boom"}"#
        );
        assert_eq!(
            ServerFrame::Presence(PresenceEvent::offline(UserId(4)))
                .to_json()
                .unwrap(),
            r#"{"status":"offline","userId":4}"#
        );
    }

    #[test]
    fn client_frame_parses() {
        let frame: ClientFrame = serde_json::from_str(r#"{"to":2,"content":"hi"}"#).unwrap();
        assert_eq!(frame.to, UserId(2));
        assert!(serde_json::from_str::<ClientFrame>(r#"{"content":"hi"}"#).is_err());
    }
}
