use async_trait::async_trait;
use domain::{Message, MessageId, RepositoryError, UserId};

/// 持久化的会话消息日志
///
/// 按会话对分区、按消息 ID 排序。分页是向前翻的游标分页：
/// 不带 `before_id` 时返回最近 `limit` 条，否则返回 `id < before_id` 的最近 `limit` 条，
/// 页内按 ID 升序排列。
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert_message(&self, message: &Message) -> Result<(), RepositoryError>;

    async fn list_messages(
        &self,
        user_a: UserId,
        user_b: UserId,
        before_id: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<Message>, RepositoryError>;
}

/// 内存实现（用于测试）
pub mod memory {
    use super::*;
    use domain::PairKey;
    use std::collections::{BTreeMap, HashMap};
    use tokio::sync::RwLock;

    #[derive(Default)]
    pub struct MemoryMessageStore {
        conversations: RwLock<HashMap<PairKey, BTreeMap<MessageId, Message>>>,
    }

    impl MemoryMessageStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn len(&self) -> usize {
            self.conversations
                .read()
                .await
                .values()
                .map(BTreeMap::len)
                .sum()
        }

        pub async fn is_empty(&self) -> bool {
            self.len().await == 0
        }
    }

    #[async_trait]
    impl MessageStore for MemoryMessageStore {
        async fn insert_message(&self, message: &Message) -> Result<(), RepositoryError> {
            let mut conversations = self.conversations.write().await;
            let log = conversations.entry(message.pair_key()).or_default();
            if log.contains_key(&message.id) {
                return Err(RepositoryError::Conflict);
            }
            log.insert(message.id, message.clone());
            Ok(())
        }

        async fn list_messages(
            &self,
            user_a: UserId,
            user_b: UserId,
            before_id: Option<MessageId>,
            limit: u32,
        ) -> Result<Vec<Message>, RepositoryError> {
            let conversations = self.conversations.read().await;
            let Some(log) = conversations.get(&PairKey::new(user_a, user_b)) else {
                return Ok(Vec::new());
            };

            let mut page: Vec<Message> = match before_id {
                Some(before) => log.range(..before).rev(),
                None => log.range(..).rev(),
            }
            .take(limit as usize)
            .map(|(_, message)| message.clone())
            .collect();
            page.reverse();
            Ok(page)
        }
    }

}
