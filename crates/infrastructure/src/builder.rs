use std::sync::Arc;

use application::BrokerError;
use config::AppConfig;
use redis::aio::ConnectionManager;
use sqlx::PgPool;
use thiserror::Error;

use crate::{
    messaging::{RedisPresenceBus, RedisStreamBroker, StreamBrokerSettings},
    migrations::MIGRATOR,
    presence_storage::RedisPresenceStore,
    repository::{create_pg_pool, PgMessageStore},
    retry::{retry_async, RetryConfig},
};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// 所有外部依赖的适配器
#[derive(Clone)]
pub struct Infrastructure {
    pub pool: PgPool,
    pub message_store: Arc<PgMessageStore>,
    pub presence_store: Arc<RedisPresenceStore>,
    pub broker: Arc<RedisStreamBroker>,
    pub presence_bus: Arc<RedisPresenceBus>,
}

impl Infrastructure {
    /// 连接 Postgres 并执行迁移，然后连接 Redis
    pub async fn connect(config: &AppConfig) -> Result<Self, InfrastructureError> {
        Self::connect_with_retry(config, &RetryConfig::default()).await
    }

    pub async fn connect_with_retry(
        config: &AppConfig,
        retry: &RetryConfig,
    ) -> Result<Self, InfrastructureError> {
        let pool = retry_async(retry, "postgres", || {
            create_pg_pool(&config.database.url, config.database.max_connections)
        })
        .await?;
        MIGRATOR.run(&pool).await?;

        let client = redis::Client::open(config.redis.url.as_str())?;
        let conn = retry_async(retry, "redis", || ConnectionManager::new(client.clone())).await?;

        let broker = RedisStreamBroker::connect(
            client.clone(),
            StreamBrokerSettings::from(&config.broker),
        )
        .await?;
        let presence_bus = RedisPresenceBus::connect(client, config.presence.channel.clone()).await?;

        tracing::info!("infrastructure connected");

        Ok(Self {
            message_store: Arc::new(PgMessageStore::new(pool.clone())),
            presence_store: Arc::new(RedisPresenceStore::new(conn)),
            broker: Arc::new(broker),
            presence_bus: Arc::new(presence_bus),
            pool,
        })
    }
}
