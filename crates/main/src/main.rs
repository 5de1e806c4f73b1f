//! 主应用程序入口
//!
//! 加载配置、连接 Postgres 与 Redis、组装网关依赖，然后启动 Axum 服务。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use application::{
    BrokerConsumer, Clock, GatewayContext, MessageHistoryService, PresenceService,
    SendMessageDependencies, SendMessageUseCase, SessionSettings, SnowflakeGenerator, SystemClock,
};
use config::AppConfig;
use infrastructure::Infrastructure;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState};

/// 关闭时等待会话完成清理的上限
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load().context("failed to load configuration")?;
    tracing::info!(config = %config.sanitize(), "configuration loaded");

    let infra = Infrastructure::connect(&config)
        .await
        .context("failed to connect infrastructure")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let id_generator = SnowflakeGenerator::new(
        config.id_generator.epoch_date()?,
        config.id_generator.machine_id,
        clock.clone(),
    )?;

    let presence = Arc::new(PresenceService::new(
        infra.presence_store.clone(),
        infra.presence_bus.clone(),
        Duration::from_secs(config.presence.ttl_secs),
        config.presence.refresh_policy,
    ));
    let send_message = Arc::new(SendMessageUseCase::new(SendMessageDependencies {
        id_generator: Arc::new(id_generator),
        message_store: infra.message_store.clone(),
        publisher: infra.broker.clone(),
        clock,
    }));
    let history = Arc::new(MessageHistoryService::new(
        infra.message_store.clone(),
        config.history.page_size,
    ));

    let shutdown = CancellationToken::new();
    let sessions = TaskTracker::new();
    let consumer: Arc<dyn BrokerConsumer> = infra.broker.clone();
    let gateway = Arc::new(GatewayContext {
        send_message,
        presence,
        consumer,
        settings: SessionSettings::from(&config.heartbeat),
        shutdown: shutdown.clone(),
        sessions: sessions.clone(),
    });

    let app = router(AppState::new(gateway, history));
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!("聊天网关启动在 http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    // 升级后的连接不在 axum 的优雅关闭范围内，单独等待会话清理
    sessions.close();
    tracing::info!(active = sessions.len(), "waiting for sessions to close");
    if tokio::time::timeout(SESSION_DRAIN_TIMEOUT, sessions.wait())
        .await
        .is_err()
    {
        tracing::warn!(remaining = sessions.len(), "sessions did not close in time");
    }

    tracing::info!("server stopped");
    Ok(())
}

/// Ctrl-C 时取消全局令牌，所有会话走正常的清理流程
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
    shutdown.cancel();
}
