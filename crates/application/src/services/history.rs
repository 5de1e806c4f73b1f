use std::sync::Arc;

use domain::{Message, MessageId, UserId};

use crate::{error::ApplicationError, repository::MessageStore};

/// 历史消息分页查询，每页条数有上限
pub struct MessageHistoryService {
    store: Arc<dyn MessageStore>,
    page_size: u32,
}

impl MessageHistoryService {
    pub fn new(store: Arc<dyn MessageStore>, page_size: u32) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// 调用方与对端之间 `before_id` 之前的一页消息，按 ID 升序
    pub async fn list(
        &self,
        caller: UserId,
        peer: UserId,
        before_id: Option<MessageId>,
    ) -> Result<Vec<Message>, ApplicationError> {
        let page = self
            .store
            .list_messages(caller, peer, before_id, self.page_size)
            .await
            .map_err(|err| {
                tracing::error!(caller = %caller, peer = %peer, error = %err, "history query failed");
                err
            })?;
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::MemoryMessageStore;
    use crate::repository::MessageStore;
    use chrono::Utc;
    use domain::MessageContent;

    #[tokio::test]
    async fn list_is_bounded_by_page_size() {
        let store = Arc::new(MemoryMessageStore::new());
        for id in 1..=25 {
            let message = Message::new(
                MessageId(id),
                UserId(1),
                UserId(2),
                MessageContent::new("x").unwrap(),
                Utc::now(),
            );
            store.insert_message(&message).await.unwrap();
        }
        let service = MessageHistoryService::new(store, 10);

        let latest = service.list(UserId(2), UserId(1), None).await.unwrap();
        assert_eq!(latest.len(), 10);
        assert_eq!(latest.first().unwrap().id, MessageId(16));
        assert_eq!(latest.last().unwrap().id, MessageId(25));

        let older = service
            .list(UserId(1), UserId(2), Some(MessageId(16)))
            .await
            .unwrap();
        assert_eq!(older.last().unwrap().id, MessageId(15));
    }
}
