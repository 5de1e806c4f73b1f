//! 在线状态

use serde::{Deserialize, Serialize};

use crate::value_objects::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// 广播给所有在线连接的状态变化事件。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub status: PresenceStatus,
    #[serde(rename = "userId")]
    pub user_id: UserId,
}

impl PresenceEvent {
    pub fn online(user_id: UserId) -> Self {
        Self {
            status: PresenceStatus::Online,
            user_id,
        }
    }

    pub fn offline(user_id: UserId) -> Self {
        Self {
            status: PresenceStatus::Offline,
            user_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_event_wire_shape() {
        let json = serde_json::to_string(&PresenceEvent::online(UserId(3))).unwrap();
        assert_eq!(json, r#"{"status":"online","userId":3}"#);

        let parsed: PresenceEvent =
            serde_json::from_str(r#"{"status":"offline","userId":7}"#).unwrap();
        assert_eq!(parsed, PresenceEvent::offline(UserId(7)));
    }
}
