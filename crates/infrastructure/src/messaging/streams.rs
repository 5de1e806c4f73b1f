//! 基于 Redis Streams 的聊天消息代理
//!
//! - 收件队列：`<inbox_prefix><user_id>`，收件人离线时消息保留在 Stream 中；
//! - 每条连接是消费者组里的一个消费者（`<user_id>-<uuid>`）；
//! - `ack` 即 `XACK`；`reject` 把负载和原因写入死信 Stream 后 `XACK`，不再重投；
//! - 空闲超过 `claim_idle` 的未确认投递通过 `XAUTOCLAIM` 接管，实现至少一次投递。

use std::sync::Arc;
use std::time::Duration;

use application::{
    Acknowledger, BrokerConsumer, BrokerError, BrokerPublisher, BrokerSubscription, Delivery,
};
use async_trait::async_trait;
use config::BrokerConfig;
use domain::{Message, UserId};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamAutoClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use redis::Client;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::{ack_error, connection_error, consume_error, is_busy_group, publish_error};

const PAYLOAD_FIELD: &str = "payload";
const SUBSCRIPTION_BUFFER: usize = 32;
const READ_RETRY_DELAY: Duration = Duration::from_secs(1);
/// XAUTOCLAIM 的起始游标，返回它表示已扫描完整个待确认列表
const CLAIM_CURSOR_START: &str = "0-0";

#[derive(Debug, Clone)]
pub struct StreamBrokerSettings {
    pub inbox_prefix: String,
    pub consumer_group: String,
    pub dead_letter_stream: String,
    pub block: Duration,
    pub batch_size: usize,
    pub claim_idle: Duration,
    pub max_stream_len: usize,
}

impl From<&BrokerConfig> for StreamBrokerSettings {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            inbox_prefix: config.inbox_prefix.clone(),
            consumer_group: config.consumer_group.clone(),
            dead_letter_stream: config.dead_letter_stream.clone(),
            block: Duration::from_millis(config.block_ms),
            batch_size: config.batch_size,
            claim_idle: Duration::from_millis(config.claim_idle_ms),
            max_stream_len: config.max_stream_len,
        }
    }
}

impl StreamBrokerSettings {
    pub fn inbox_key(&self, user_id: UserId) -> String {
        format!("{}{}", self.inbox_prefix, user_id)
    }
}

#[derive(Clone)]
pub struct RedisStreamBroker {
    client: Client,
    conn: ConnectionManager,
    settings: Arc<StreamBrokerSettings>,
}

impl RedisStreamBroker {
    pub async fn connect(client: Client, settings: StreamBrokerSettings) -> Result<Self, BrokerError> {
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|err| connection_error("open connection manager", err))?;
        Ok(Self {
            client,
            conn,
            settings: Arc::new(settings),
        })
    }

    pub fn settings(&self) -> &StreamBrokerSettings {
        &self.settings
    }

    /// 确保消费者组存在，组已存在时忽略 BUSYGROUP
    async fn ensure_group(&self, key: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let result: Result<String, redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(key)
            .arg(&self.settings.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => {
                debug!(stream = %key, group = %self.settings.consumer_group, "consumer group created");
                Ok(())
            }
            Err(err) if is_busy_group(&err) => Ok(()),
            Err(err) => Err(consume_error("XGROUP CREATE", err)),
        }
    }
}

#[async_trait]
impl BrokerPublisher for RedisStreamBroker {
    async fn publish(&self, message: &Message) -> Result<(), BrokerError> {
        let payload = serde_json::to_vec(message)
            .map_err(|err| BrokerError::Serialization(err.to_string()))?;
        let key = self.settings.inbox_key(message.to_id);
        let mut conn = self.conn.clone();

        let entry_id: String = redis::cmd("XADD")
            .arg(&key)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.settings.max_stream_len)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|err| publish_error("XADD", err))?;

        debug!(stream = %key, entry_id = %entry_id, message_id = %message.id, "message published");
        Ok(())
    }
}

#[async_trait]
impl BrokerConsumer for RedisStreamBroker {
    async fn open_consumer(
        &self,
        user_id: UserId,
    ) -> Result<BrokerSubscription<Delivery>, BrokerError> {
        let key = self.settings.inbox_key(user_id);
        self.ensure_group(&key).await?;

        // 阻塞读取独占一条连接，避免堵住共享连接上的其他命令
        let reader = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| connection_error("open consumer connection", err))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = CancellationToken::new();
        let worker = ConsumerWorker {
            key,
            consumer: format!("{}-{}", user_id, Uuid::new_v4()),
            reader,
            conn: self.conn.clone(),
            settings: Arc::clone(&self.settings),
            tx,
            cancel: cancel.clone(),
        };
        info!(user_id = %user_id, consumer = %worker.consumer, "stream consumer opened");
        let task = tokio::spawn(worker.run());

        Ok(BrokerSubscription::new(rx, cancel, task))
    }
}

/// 单个消费者的后台读取任务
struct ConsumerWorker {
    key: String,
    consumer: String,
    reader: MultiplexedConnection,
    conn: ConnectionManager,
    settings: Arc<StreamBrokerSettings>,
    tx: mpsc::Sender<Delivery>,
    cancel: CancellationToken,
}

impl ConsumerWorker {
    async fn run(mut self) {
        let cancel = self.cancel.clone();
        let mut next_claim = Instant::now();

        while !cancel.is_cancelled() {
            if Instant::now() >= next_claim {
                if !self.reclaim_backlog().await {
                    break;
                }
                next_claim = Instant::now() + self.settings.claim_idle;
            }

            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = self.read_new() => read,
            };
            match read {
                Ok(entries) => {
                    if !self.forward(entries).await {
                        break;
                    }
                }
                Err(err) if err.is_timeout() => continue,
                Err(err) => {
                    error!(stream = %self.key, consumer = %self.consumer, error = %err, "XREADGROUP failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(READ_RETRY_DELAY) => {}
                    }
                }
            }
        }

        self.release().await;
    }

    async fn read_new(&mut self) -> Result<Vec<StreamId>, redis::RedisError> {
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.settings.consumer_group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(self.settings.batch_size)
            .arg("BLOCK")
            .arg(self.settings.block.as_millis() as u64)
            .arg("STREAMS")
            .arg(&self.key)
            .arg(">")
            .query_async(&mut self.reader)
            .await?;

        Ok(reply
            .map(|reply| reply.keys.into_iter().flat_map(|key| key.ids).collect())
            .unwrap_or_default())
    }

    /// 沿游标扫描整个待确认列表，逐批转发接管到的投递。
    ///
    /// 返回 `false` 表示订阅已关闭。
    async fn reclaim_backlog(&mut self) -> bool {
        let mut cursor = CLAIM_CURSOR_START.to_string();
        let mut total = 0;
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let reply = match self.claim_stale(&cursor).await {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(stream = %self.key, error = %err, "XAUTOCLAIM failed");
                    return true;
                }
            };
            total += reply.claimed.len();
            if !self.forward(reply.claimed).await {
                return false;
            }
            if reply.next_stream_id == CLAIM_CURSOR_START {
                break;
            }
            cursor = reply.next_stream_id;
        }
        if total > 0 {
            info!(stream = %self.key, consumer = %self.consumer, count = total, "reclaimed stale deliveries");
        }
        true
    }

    /// 从 `cursor` 开始接管一批空闲过久的未确认投递（包括本消费者自己丢弃的）
    async fn claim_stale(&mut self, cursor: &str) -> Result<StreamAutoClaimReply, redis::RedisError> {
        redis::cmd("XAUTOCLAIM")
            .arg(&self.key)
            .arg(&self.settings.consumer_group)
            .arg(&self.consumer)
            .arg(self.settings.claim_idle.as_millis() as u64)
            .arg(cursor)
            .arg("COUNT")
            .arg(self.settings.batch_size)
            .query_async(&mut self.conn)
            .await
    }

    /// 转发到订阅通道；返回 `false` 表示订阅已关闭
    async fn forward(&self, entries: Vec<StreamId>) -> bool {
        for entry in entries {
            let payload: Vec<u8> = entry.get(PAYLOAD_FIELD).unwrap_or_default();
            let acker = StreamAcker {
                conn: self.conn.clone(),
                settings: Arc::clone(&self.settings),
                key: self.key.clone(),
                entry_id: entry.id,
                payload: payload.clone(),
            };
            let delivery = Delivery::new(payload, Box::new(acker));
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                sent = self.tx.send(delivery) => {
                    if sent.is_err() {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// 没有未确认投递时才删除消费者，否则保留给其他消费者接管
    async fn release(&mut self) {
        let pending: Result<StreamPendingCountReply, _> = redis::cmd("XPENDING")
            .arg(&self.key)
            .arg(&self.settings.consumer_group)
            .arg("-")
            .arg("+")
            .arg(1)
            .arg(&self.consumer)
            .query_async(&mut self.conn)
            .await;

        match pending {
            Ok(reply) if reply.ids.is_empty() => {
                let removed: Result<i64, _> = redis::cmd("XGROUP")
                    .arg("DELCONSUMER")
                    .arg(&self.key)
                    .arg(&self.settings.consumer_group)
                    .arg(&self.consumer)
                    .query_async(&mut self.conn)
                    .await;
                if let Err(err) = removed {
                    warn!(consumer = %self.consumer, error = %err, "failed to delete consumer");
                }
            }
            Ok(reply) => {
                info!(
                    consumer = %self.consumer,
                    pending = reply.ids.len(),
                    "consumer left unacknowledged deliveries for reclaim"
                );
            }
            Err(err) => warn!(consumer = %self.consumer, error = %err, "XPENDING failed"),
        }
        info!(stream = %self.key, consumer = %self.consumer, "stream consumer closed");
    }
}

struct StreamAcker {
    conn: ConnectionManager,
    settings: Arc<StreamBrokerSettings>,
    key: String,
    entry_id: String,
    payload: Vec<u8>,
}

#[async_trait]
impl Acknowledger for StreamAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("XACK")
            .arg(&self.key)
            .arg(&self.settings.consumer_group)
            .arg(&self.entry_id)
            .query_async(&mut conn)
            .await
            .map_err(|err| ack_error("XACK", err))?;
        Ok(())
    }

    async fn reject(&self, reason: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(&self.settings.dead_letter_stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.settings.max_stream_len)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(&self.payload)
            .arg("reason")
            .arg(reason)
            .arg("source")
            .arg(&self.key)
            .arg("entry_id")
            .arg(&self.entry_id)
            .ignore()
            .cmd("XACK")
            .arg(&self.key)
            .arg(&self.settings.consumer_group)
            .arg(&self.entry_id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|err| ack_error("dead-letter reject", err))?;
        warn!(stream = %self.key, entry_id = %self.entry_id, reason, "delivery dead-lettered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_follow_broker_config() {
        let settings = StreamBrokerSettings::from(&BrokerConfig::default());
        assert_eq!(settings.inbox_key(UserId(42)), "chat:inbox:42");
        assert_eq!(settings.consumer_group, "gateway");
        assert_eq!(settings.block, Duration::from_millis(400));
        assert_eq!(settings.claim_idle, Duration::from_secs(30));
    }
}
