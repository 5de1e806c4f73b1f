//! 消息代理抽象
//!
//! 两套独立的扇出拓扑：
//! - 聊天消息：每个用户一个持久队列，路由键即收件人 ID，投递需要显式确认；
//! - 在线状态：所有订阅者都能收到每个事件，不重放历史。
//!
//! 订阅以 [`BrokerSubscription`] 的形式交给调用方，丢弃或 `close()` 即释放底层资源。

use std::fmt;

use async_trait::async_trait;
use domain::{Message, PresenceEvent, UserId};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("consume failed: {0}")]
    Consume(String),
    #[error("acknowledgement failed: {0}")]
    Ack(String),
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// 单条投递的确认句柄
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// 确认已处理，代理不再重投
    async fn ack(&self) -> Result<(), BrokerError>;
    /// 拒收且不重新入队
    async fn reject(&self, reason: &str) -> Result<(), BrokerError>;
}

/// 从代理收到的一条投递
///
/// 既不 `ack` 也不 `reject` 就丢弃时，代理会在之后重新投递（至少一次）。
pub struct Delivery {
    payload: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(payload: Vec<u8>, acker: Box<dyn Acknowledger>) -> Self {
        Self { payload, acker }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BrokerError> {
        serde_json::from_slice(&self.payload)
            .map_err(|err| BrokerError::Serialization(err.to_string()))
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn reject(self, reason: &str) -> Result<(), BrokerError> {
        self.acker.reject(reason).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// 一个活跃的订阅：后台任务把代理里的数据搬进有界通道。
pub struct BrokerSubscription<T> {
    receiver: mpsc::Receiver<T>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<T> BrokerSubscription<T> {
    pub fn new(receiver: mpsc::Receiver<T>, cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            receiver,
            cancel,
            task: Some(task),
        }
    }

    /// 下一条数据；后台任务结束且通道排空后返回 `None`
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 停止后台任务并等待其退出
    pub async fn close(mut self) {
        self.cancel.cancel();
        self.receiver.close();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "subscription task ended abnormally");
            }
        }
    }
}

impl<T> Drop for BrokerSubscription<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<T> fmt::Debug for BrokerSubscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSubscription")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// 聊天消息发布端，路由键为收件人 ID
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    async fn publish(&self, message: &Message) -> Result<(), BrokerError>;
}

/// 聊天消息消费端
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// 为一条连接打开该用户收件队列上的独立消费者
    async fn open_consumer(&self, user_id: UserId) -> Result<BrokerSubscription<Delivery>, BrokerError>;
}

/// 在线状态扇出
#[async_trait]
pub trait PresenceBus: Send + Sync {
    async fn publish(&self, event: &PresenceEvent) -> Result<(), BrokerError>;

    /// 订阅之后发布的事件；`user_id` 仅用于标识订阅者
    async fn subscribe(&self, user_id: UserId) -> Result<BrokerSubscription<Delivery>, BrokerError>;
}

/// 内存实现（用于测试）
pub mod memory {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};
    use tokio::sync::{broadcast, Notify};

    const SUBSCRIPTION_BUFFER: usize = 16;

    #[derive(Clone)]
    struct Entry {
        tag: u64,
        payload: Vec<u8>,
    }

    #[derive(Default)]
    struct Inbox {
        ready: VecDeque<Entry>,
        unacked: HashMap<u64, (u64, Entry)>,
        notify: Arc<Notify>,
    }

    #[derive(Default)]
    struct Shared {
        inboxes: Mutex<HashMap<UserId, Inbox>>,
        next_tag: AtomicU64,
        next_consumer: AtomicU64,
        acked: AtomicUsize,
        rejected: Mutex<Vec<(Vec<u8>, String)>>,
        active_consumers: AtomicUsize,
    }

    impl Shared {
        fn with_inbox<R>(&self, user_id: UserId, f: impl FnOnce(&mut Inbox) -> R) -> R {
            let mut inboxes = self.inboxes.lock().unwrap_or_else(PoisonError::into_inner);
            f(inboxes.entry(user_id).or_default())
        }

        fn enqueue(&self, user_id: UserId, payload: Vec<u8>) {
            let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
            self.with_inbox(user_id, |inbox| {
                inbox.ready.push_back(Entry { tag, payload });
                inbox.notify.notify_waiters();
            });
        }

        fn take_ready(&self, user_id: UserId, consumer: u64) -> Option<Entry> {
            self.with_inbox(user_id, |inbox| {
                let entry = inbox.ready.pop_front()?;
                inbox.unacked.insert(entry.tag, (consumer, entry.clone()));
                Some(entry)
            })
        }

        fn settle(&self, user_id: UserId, tag: u64) -> Option<Entry> {
            self.with_inbox(user_id, |inbox| inbox.unacked.remove(&tag).map(|(_, e)| e))
        }

        /// 消费者退出时，把它名下未确认的投递放回队首
        fn requeue_consumer(&self, user_id: UserId, consumer: u64) {
            self.with_inbox(user_id, |inbox| {
                let mut orphaned: Vec<Entry> = inbox
                    .unacked
                    .values()
                    .filter(|(owner, _)| *owner == consumer)
                    .map(|(_, entry)| entry.clone())
                    .collect();
                for entry in &orphaned {
                    inbox.unacked.remove(&entry.tag);
                }
                orphaned.sort_by_key(|entry| entry.tag);
                for entry in orphaned.into_iter().rev() {
                    inbox.ready.push_front(entry);
                }
                inbox.notify.notify_waiters();
            });
        }
    }

    struct MemoryAcker {
        shared: Arc<Shared>,
        user_id: UserId,
        tag: u64,
    }

    #[async_trait]
    impl Acknowledger for MemoryAcker {
        async fn ack(&self) -> Result<(), BrokerError> {
            if self.shared.settle(self.user_id, self.tag).is_some() {
                self.shared.acked.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }

        async fn reject(&self, reason: &str) -> Result<(), BrokerError> {
            if let Some(entry) = self.shared.settle(self.user_id, self.tag) {
                self.shared
                    .rejected
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((entry.payload, reason.to_string()));
            }
            Ok(())
        }
    }

    /// 持久的按用户收件队列：发布时无人消费也会保留，
    /// 消费者关闭时未确认的投递重新入队。
    #[derive(Clone, Default)]
    pub struct MemoryBroker {
        shared: Arc<Shared>,
    }

    impl MemoryBroker {
        pub fn new() -> Self {
            Self::default()
        }

        /// 直接写入原始负载（用于构造畸形消息）
        pub fn inject_raw(&self, user_id: UserId, payload: impl Into<Vec<u8>>) {
            self.shared.enqueue(user_id, payload.into());
        }

        pub fn acked_count(&self) -> usize {
            self.shared.acked.load(Ordering::SeqCst)
        }

        pub fn rejected(&self) -> Vec<(Vec<u8>, String)> {
            self.shared
                .rejected
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        pub fn active_consumers(&self) -> usize {
            self.shared.active_consumers.load(Ordering::SeqCst)
        }

        /// 尚未确认的消息数（含待投递与已投递未确认）
        pub fn pending(&self, user_id: UserId) -> usize {
            self.shared
                .with_inbox(user_id, |inbox| inbox.ready.len() + inbox.unacked.len())
        }
    }

    #[async_trait]
    impl BrokerPublisher for MemoryBroker {
        async fn publish(&self, message: &Message) -> Result<(), BrokerError> {
            let payload = serde_json::to_vec(message)
                .map_err(|err| BrokerError::Serialization(err.to_string()))?;
            self.shared.enqueue(message.to_id, payload);
            Ok(())
        }
    }

    #[async_trait]
    impl BrokerConsumer for MemoryBroker {
        async fn open_consumer(
            &self,
            user_id: UserId,
        ) -> Result<BrokerSubscription<Delivery>, BrokerError> {
            let shared = Arc::clone(&self.shared);
            let consumer = shared.next_consumer.fetch_add(1, Ordering::SeqCst);
            let notify = shared.with_inbox(user_id, |inbox| Arc::clone(&inbox.notify));
            let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
            let cancel = CancellationToken::new();
            let token = cancel.clone();
            shared.active_consumers.fetch_add(1, Ordering::SeqCst);

            let task = tokio::spawn(async move {
                loop {
                    let notified = notify.notified();
                    if let Some(entry) = shared.take_ready(user_id, consumer) {
                        let delivery = Delivery::new(
                            entry.payload,
                            Box::new(MemoryAcker {
                                shared: Arc::clone(&shared),
                                user_id,
                                tag: entry.tag,
                            }),
                        );
                        tokio::select! {
                            _ = token.cancelled() => break,
                            sent = tx.send(delivery) => if sent.is_err() { break },
                        }
                        continue;
                    }
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = notified => {}
                    }
                }
                shared.requeue_consumer(user_id, consumer);
                shared.active_consumers.fetch_sub(1, Ordering::SeqCst);
            });

            Ok(BrokerSubscription::new(rx, cancel, task))
        }
    }

    struct NoopAcker;

    #[async_trait]
    impl Acknowledger for NoopAcker {
        async fn ack(&self) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn reject(&self, reason: &str) -> Result<(), BrokerError> {
            tracing::debug!(reason, "presence delivery rejected");
            Ok(())
        }
    }

    /// 在线状态广播，订阅之前的事件不会重放
    #[derive(Clone)]
    pub struct MemoryPresenceBus {
        sender: broadcast::Sender<Vec<u8>>,
    }

    impl Default for MemoryPresenceBus {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MemoryPresenceBus {
        pub fn new() -> Self {
            let (sender, _) = broadcast::channel(256);
            Self { sender }
        }

        /// 直接广播原始负载（用于构造畸形事件）
        pub fn inject_raw(&self, payload: impl Into<Vec<u8>>) {
            let _ = self.sender.send(payload.into());
        }

        pub fn subscriber_count(&self) -> usize {
            self.sender.receiver_count()
        }
    }

    #[async_trait]
    impl PresenceBus for MemoryPresenceBus {
        async fn publish(&self, event: &PresenceEvent) -> Result<(), BrokerError> {
            let payload = serde_json::to_vec(event)
                .map_err(|err| BrokerError::Serialization(err.to_string()))?;
            // 没有订阅者时发送失败是正常情况
            let _ = self.sender.send(payload);
            Ok(())
        }

        async fn subscribe(
            &self,
            user_id: UserId,
        ) -> Result<BrokerSubscription<Delivery>, BrokerError> {
            let mut events = self.sender.subscribe();
            let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
            let cancel = CancellationToken::new();
            let token = cancel.clone();

            let task = tokio::spawn(async move {
                loop {
                    let payload = tokio::select! {
                        _ = token.cancelled() => break,
                        received = events.recv() => match received {
                            Ok(payload) => payload,
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                tracing::warn!(user_id = %user_id, skipped, "presence subscriber lagged");
                                continue;
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    };
                    if tx.send(Delivery::new(payload, Box::new(NoopAcker))).await.is_err() {
                        break;
                    }
                }
            });

            Ok(BrokerSubscription::new(rx, cancel, task))
        }
    }

}
