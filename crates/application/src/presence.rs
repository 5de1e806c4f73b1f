//! 在线状态服务
//!
//! 每个用户只有 `online` / `offline` 两个状态。一个用户可以同时持有多条连接，
//! 每条连接各自维护一条带 TTL 的在线记录，至少一条记录存活即在线。
//! 心跳不及时续期的记录会静默过期。状态变化通过 [`PresenceBus`] 扇出：
//! 第一条连接建立时广播上线，最后一条连接关闭时广播下线。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use config::RefreshPolicy;
use domain::{PresenceEvent, UserId};
use thiserror::Error;
use uuid::Uuid;

use crate::broker::{BrokerSubscription, Delivery, PresenceBus};
use crate::error::ApplicationError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PresenceError {
    #[error("presence store unavailable: {0}")]
    Store(String),
}

/// 单条连接的标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 按连接记录、带过期时间的在线状态存储
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// 写入（或覆盖）该连接的在线记录。
    ///
    /// 返回写入前该用户是否没有任何存活的连接。
    async fn mark_online(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        ttl: Duration,
    ) -> Result<bool, PresenceError>;

    /// 延长该连接记录的 TTL，记录不存在或已过期时返回 `false`
    async fn extend(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        ttl: Duration,
    ) -> Result<bool, PresenceError>;

    /// 删除该连接的记录，返回删除后该用户是否已没有存活的连接
    async fn mark_offline(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<bool, PresenceError>;

    async fn is_online(&self, user_id: UserId) -> Result<bool, PresenceError>;
}

pub struct PresenceService {
    store: Arc<dyn PresenceStore>,
    bus: Arc<dyn PresenceBus>,
    ttl: Duration,
    refresh_policy: RefreshPolicy,
}

impl PresenceService {
    pub fn new(
        store: Arc<dyn PresenceStore>,
        bus: Arc<dyn PresenceBus>,
        ttl: Duration,
        refresh_policy: RefreshPolicy,
    ) -> Self {
        Self {
            store,
            bus,
            ttl,
            refresh_policy,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn refresh_policy(&self) -> RefreshPolicy {
        self.refresh_policy
    }

    /// 写入连接的在线记录，用户此前没有存活连接时广播上线事件
    pub async fn set_online(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<(), ApplicationError> {
        let first = self
            .store
            .mark_online(user_id, connection_id, self.ttl)
            .await?;
        if first {
            self.bus.publish(&PresenceEvent::online(user_id)).await?;
            tracing::info!(user_id = %user_id, connection_id = %connection_id, "user online");
        } else {
            tracing::debug!(user_id = %user_id, connection_id = %connection_id, "additional connection online");
        }
        Ok(())
    }

    /// 心跳续期，不广播任何事件。
    ///
    /// 返回记录在调用之后是否存在。记录已过期时的行为由 [`RefreshPolicy`] 决定。
    pub async fn refresh(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<bool, ApplicationError> {
        if self.store.extend(user_id, connection_id, self.ttl).await? {
            tracing::debug!(user_id = %user_id, connection_id = %connection_id, "presence refreshed");
            return Ok(true);
        }
        match self.refresh_policy {
            RefreshPolicy::ExtendOnly => {
                tracing::debug!(user_id = %user_id, connection_id = %connection_id, "presence record expired, not re-established");
                Ok(false)
            }
            RefreshPolicy::Reestablish => {
                self.store
                    .mark_online(user_id, connection_id, self.ttl)
                    .await?;
                tracing::debug!(user_id = %user_id, connection_id = %connection_id, "presence record re-established");
                Ok(true)
            }
        }
    }

    /// 删除连接的在线记录，最后一条连接离开时广播下线事件，然后释放会话的在线状态订阅。
    ///
    /// 任一步失败都会继续执行后续步骤，最终返回第一个错误。
    /// 存储不可用时无法判断是否还有其他连接，仍然广播下线。
    pub async fn set_offline(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        subscription: Option<BrokerSubscription<Delivery>>,
    ) -> Result<(), ApplicationError> {
        let removed = self.store.mark_offline(user_id, connection_id).await;
        let last = !matches!(removed, Ok(false));
        let published = if last {
            self.bus.publish(&PresenceEvent::offline(user_id)).await
        } else {
            Ok(())
        };
        if let Some(subscription) = subscription {
            subscription.close().await;
        }
        removed?;
        published?;
        if last {
            tracing::info!(user_id = %user_id, connection_id = %connection_id, "user offline");
        } else {
            tracing::debug!(user_id = %user_id, connection_id = %connection_id, "connection closed, user still online");
        }
        Ok(())
    }

    pub async fn is_online(&self, user_id: UserId) -> Result<bool, ApplicationError> {
        Ok(self.store.is_online(user_id).await?)
    }

    /// 订阅之后发生的在线状态变化
    pub async fn subscribe(
        &self,
        user_id: UserId,
    ) -> Result<BrokerSubscription<Delivery>, ApplicationError> {
        Ok(self.bus.subscribe(user_id).await?)
    }
}

/// 内存实现的在线记录存储（用于测试）
///
/// 过期时间基于 `tokio::time::Instant`，测试中可以配合 `tokio::time::pause` 推进时间。
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::RwLock;
    use tokio::time::Instant;

    type Connections = HashMap<ConnectionId, Instant>;

    #[derive(Default)]
    pub struct MemoryPresenceStore {
        records: RwLock<HashMap<UserId, Connections>>,
    }

    impl MemoryPresenceStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    fn prune(connections: &mut Connections, now: Instant) {
        connections.retain(|_, expires_at| *expires_at > now);
    }

    #[async_trait]
    impl PresenceStore for MemoryPresenceStore {
        async fn mark_online(
            &self,
            user_id: UserId,
            connection_id: ConnectionId,
            ttl: Duration,
        ) -> Result<bool, PresenceError> {
            let mut records = self.records.write().await;
            let now = Instant::now();
            let connections = records.entry(user_id).or_default();
            prune(connections, now);
            let first = connections.is_empty();
            connections.insert(connection_id, now + ttl);
            Ok(first)
        }

        async fn extend(
            &self,
            user_id: UserId,
            connection_id: ConnectionId,
            ttl: Duration,
        ) -> Result<bool, PresenceError> {
            let mut records = self.records.write().await;
            let now = Instant::now();
            let Some(connections) = records.get_mut(&user_id) else {
                return Ok(false);
            };
            prune(connections, now);
            let extended = match connections.get_mut(&connection_id) {
                Some(expires_at) => {
                    *expires_at = now + ttl;
                    true
                }
                None => false,
            };
            if connections.is_empty() {
                records.remove(&user_id);
            }
            Ok(extended)
        }

        async fn mark_offline(
            &self,
            user_id: UserId,
            connection_id: ConnectionId,
        ) -> Result<bool, PresenceError> {
            let mut records = self.records.write().await;
            let Some(connections) = records.get_mut(&user_id) else {
                return Ok(true);
            };
            connections.remove(&connection_id);
            prune(connections, Instant::now());
            if connections.is_empty() {
                records.remove(&user_id);
                return Ok(true);
            }
            Ok(false)
        }

        async fn is_online(&self, user_id: UserId) -> Result<bool, PresenceError> {
            let now = Instant::now();
            Ok(self
                .records
                .read()
                .await
                .get(&user_id)
                .is_some_and(|connections| connections.values().any(|expires_at| *expires_at > now)))
        }
    }
}
