//! 基于 Redis Pub/Sub 的在线状态扇出
//!
//! Pub/Sub 不保留历史，订阅之前发布的事件不会被补发。

use application::{Acknowledger, BrokerError, BrokerSubscription, Delivery, PresenceBus};
use async_trait::async_trait;
use domain::{PresenceEvent, UserId};
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::{connection_error, consume_error, publish_error};

const SUBSCRIPTION_BUFFER: usize = 64;

#[derive(Clone)]
pub struct RedisPresenceBus {
    client: Client,
    conn: ConnectionManager,
    channel: String,
}

impl RedisPresenceBus {
    pub async fn connect(client: Client, channel: impl Into<String>) -> Result<Self, BrokerError> {
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|err| connection_error("open connection manager", err))?;
        Ok(Self {
            client,
            conn,
            channel: channel.into(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl PresenceBus for RedisPresenceBus {
    async fn publish(&self, event: &PresenceEvent) -> Result<(), BrokerError> {
        let payload =
            serde_json::to_vec(event).map_err(|err| BrokerError::Serialization(err.to_string()))?;
        let mut conn = self.conn.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|err| publish_error("PUBLISH", err))?;
        debug!(channel = %self.channel, user_id = %event.user_id, receivers, "presence event published");
        Ok(())
    }

    async fn subscribe(
        &self,
        user_id: UserId,
    ) -> Result<BrokerSubscription<Delivery>, BrokerError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|err| connection_error("open pubsub connection", err))?;
        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|err| consume_error("SUBSCRIBE", err))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let channel = self.channel.clone();

        let task = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            loop {
                let message = tokio::select! {
                    _ = token.cancelled() => break,
                    message = messages.next() => message,
                };
                let Some(message) = message else {
                    break;
                };
                let delivery = Delivery::new(message.get_payload_bytes().to_vec(), Box::new(NoopAcker));
                if tx.send(delivery).await.is_err() {
                    break;
                }
            }
            info!(channel = %channel, user_id = %user_id, "presence subscription closed");
        });

        Ok(BrokerSubscription::new(rx, cancel, task))
    }
}

/// Pub/Sub 没有确认语义
struct NoopAcker;

#[async_trait]
impl Acknowledger for NoopAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn reject(&self, _reason: &str) -> Result<(), BrokerError> {
        Ok(())
    }
}
