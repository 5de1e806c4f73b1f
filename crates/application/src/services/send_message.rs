use std::sync::Arc;

use domain::{Message, MessageContent, UserId};

use crate::{
    broker::BrokerPublisher, clock::Clock, error::ApplicationError, id_generator::IdGenerator,
    repository::MessageStore,
};

#[derive(Debug, Clone)]
pub struct SendMessageCommand {
    pub from: UserId,
    pub to: UserId,
    pub content: String,
}

pub struct SendMessageDependencies {
    pub id_generator: Arc<dyn IdGenerator>,
    pub message_store: Arc<dyn MessageStore>,
    pub publisher: Arc<dyn BrokerPublisher>,
    pub clock: Arc<dyn Clock>,
}

/// 发送一条私聊消息：分配 ID、落库、投递到收件人队列。
///
/// 落库与投递不是原子的。落库成功而投递失败时返回
/// [`ApplicationError::PublishAfterStore`]，消息仍可通过历史查询获取，
/// 但不会再实时推送给收件人。
pub struct SendMessageUseCase {
    deps: SendMessageDependencies,
}

impl SendMessageUseCase {
    pub fn new(deps: SendMessageDependencies) -> Self {
        Self { deps }
    }

    pub async fn execute(&self, command: SendMessageCommand) -> Result<Message, ApplicationError> {
        let content = MessageContent::new(command.content)?;
        let id = self.deps.id_generator.next_id()?;
        let message = Message::new(id, command.from, command.to, content, self.deps.clock.now());

        self.deps.message_store.insert_message(&message).await?;

        if let Err(source) = self.deps.publisher.publish(&message).await {
            tracing::error!(
                message_id = %message.id,
                to = %message.to_id,
                error = %source,
                "message stored but publish failed"
            );
            return Err(ApplicationError::PublishAfterStore {
                message_id: message.id,
                source,
            });
        }

        tracing::debug!(
            message_id = %message.id,
            from = %message.from_id,
            to = %message.to_id,
            "message accepted"
        );
        Ok(message)
    }
}
