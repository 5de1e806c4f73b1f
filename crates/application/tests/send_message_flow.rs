//! 发送消息用例：落库、投递、失败注入

mod support;

use std::sync::Arc;
use std::time::Duration;

use application::broker::memory::MemoryBroker;
use application::repository::memory::MemoryMessageStore;
use application::{
    ApplicationError, BrokerConsumer, BrokerError, BrokerPublisher, MessageStore,
    SendMessageCommand, SendMessageDependencies, SendMessageUseCase, SystemClock,
};
use async_trait::async_trait;
use domain::{Message, MessageId, RepositoryError, UserId};
use mockall::mock;
use support::{id_generator, Harness};

mock! {
    pub Store {}

    #[async_trait]
    impl MessageStore for Store {
        async fn insert_message(&self, message: &Message) -> Result<(), RepositoryError>;
        async fn list_messages(
            &self,
            user_a: UserId,
            user_b: UserId,
            before_id: Option<MessageId>,
            limit: u32,
        ) -> Result<Vec<Message>, RepositoryError>;
    }
}

mock! {
    pub Publisher {}

    #[async_trait]
    impl BrokerPublisher for Publisher {
        async fn publish(&self, message: &Message) -> Result<(), BrokerError>;
    }
}

fn command(from: u64, to: u64, content: &str) -> SendMessageCommand {
    SendMessageCommand {
        from: UserId(from),
        to: UserId(to),
        content: content.to_string(),
    }
}

#[tokio::test]
async fn sent_message_is_stored_and_delivered_to_recipient() {
    let harness = Harness::new();
    let mut inbox = harness.broker.open_consumer(UserId(2)).await.unwrap();

    let sent = harness
        .send_message
        .execute(command(1, 2, "hi"))
        .await
        .unwrap();

    let history = harness.history.list(UserId(1), UserId(2), None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, sent.id);
    assert_eq!(history[0].from_id, UserId(1));
    assert_eq!(history[0].to_id, UserId(2));
    assert_eq!(history[0].content.as_str(), "hi");

    let delivery = tokio::time::timeout(Duration::from_secs(1), inbox.recv())
        .await
        .unwrap()
        .unwrap();
    let delivered: Message = delivery.decode().unwrap();
    assert_eq!(delivered, sent);
    delivery.ack().await.unwrap();
    assert_eq!(harness.broker.acked_count(), 1);
}

#[tokio::test]
async fn accepted_sends_have_increasing_ids() {
    let harness = Harness::new();
    let mut previous = None;
    for i in 0..50 {
        let message = harness
            .send_message
            .execute(command(1 + i % 2, 2 - i % 2, "ping"))
            .await
            .unwrap();
        if let Some(previous) = previous {
            assert!(message.id > previous);
        }
        previous = Some(message.id);
    }

    let latest = harness.history.list(UserId(2), UserId(1), None).await.unwrap();
    assert_eq!(latest.last().map(|m| m.id), previous);
}

#[tokio::test]
async fn invalid_content_is_rejected_before_storage() {
    let harness = Harness::new();
    let err = harness
        .send_message
        .execute(command(1, 2, "   "))
        .await
        .unwrap_err();
    assert!(matches!(err, ApplicationError::Domain(_)));
    assert!(err.is_client_error());
    assert!(harness.messages.is_empty().await);
    assert_eq!(harness.broker.pending(UserId(2)), 0);
}

#[tokio::test]
async fn store_failure_is_surfaced_and_nothing_is_published() {
    let mut store = MockStore::new();
    store
        .expect_insert_message()
        .times(1)
        .returning(|_| Err(RepositoryError::storage("cluster unavailable")));
    let mut publisher = MockPublisher::new();
    publisher.expect_publish().never();

    let use_case = SendMessageUseCase::new(SendMessageDependencies {
        id_generator: id_generator(),
        message_store: Arc::new(store),
        publisher: Arc::new(publisher),
        clock: Arc::new(SystemClock),
    });

    let err = use_case.execute(command(1, 2, "hi")).await.unwrap_err();
    assert!(matches!(
        err,
        ApplicationError::Repository(RepositoryError::Storage { .. })
    ));
}

/// 落库成功、投递失败：消息可通过历史查询获取，但不会实时送达
#[tokio::test]
async fn publish_failure_after_insert_keeps_message_in_history() {
    let store = Arc::new(MemoryMessageStore::new());
    let mut publisher = MockPublisher::new();
    publisher
        .expect_publish()
        .times(1)
        .returning(|_| Err(BrokerError::Publish("broker down".into())));
    let broker = MemoryBroker::new();

    let use_case = SendMessageUseCase::new(SendMessageDependencies {
        id_generator: id_generator(),
        message_store: store.clone(),
        publisher: Arc::new(publisher),
        clock: Arc::new(SystemClock),
    });

    let err = use_case.execute(command(1, 2, "hi")).await.unwrap_err();
    let ApplicationError::PublishAfterStore { message_id, .. } = err else {
        panic!("unexpected error: {err}");
    };

    let stored = store
        .list_messages(UserId(2), UserId(1), None, 10)
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, message_id);
    assert_eq!(broker.pending(UserId(2)), 0);
}
