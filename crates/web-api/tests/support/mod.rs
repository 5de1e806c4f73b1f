//! 测试辅助：用内存实现组装网关并在本地端口上启动服务

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use application::broker::memory::{MemoryBroker, MemoryPresenceBus};
use application::presence::memory::MemoryPresenceStore;
use application::repository::memory::MemoryMessageStore;
use application::{
    GatewayContext, MessageHistoryService, PresenceService, PresenceStore, SendMessageDependencies,
    SendMessageUseCase, SessionSettings, SnowflakeGenerator, SystemClock,
};
use chrono::NaiveDate;
use config::RefreshPolicy;
use domain::UserId;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use web_api::{router, AppState, USER_ID_HEADER};

pub struct TestServer {
    pub addr: SocketAddr,
    pub broker: MemoryBroker,
    pub presence_store: Arc<MemoryPresenceStore>,
    pub send_message: Arc<SendMessageUseCase>,
    pub shutdown: CancellationToken,
    pub sessions: TaskTracker,
}

impl TestServer {
    pub async fn start() -> Self {
        let broker = MemoryBroker::new();
        let presence_bus = MemoryPresenceBus::new();
        let presence_store = Arc::new(MemoryPresenceStore::new());
        let messages = Arc::new(MemoryMessageStore::new());
        let epoch = NaiveDate::from_ymd_opt(2024, 6, 13).expect("valid date");

        let presence = Arc::new(PresenceService::new(
            presence_store.clone(),
            Arc::new(presence_bus),
            Duration::from_secs(40),
            RefreshPolicy::ExtendOnly,
        ));
        let send_message = Arc::new(SendMessageUseCase::new(SendMessageDependencies {
            id_generator: Arc::new(
                SnowflakeGenerator::new(epoch, 1, Arc::new(SystemClock)).expect("generator"),
            ),
            message_store: messages.clone(),
            publisher: Arc::new(broker.clone()),
            clock: Arc::new(SystemClock),
        }));
        let shutdown = CancellationToken::new();
        let sessions = TaskTracker::new();
        let gateway = Arc::new(GatewayContext {
            send_message: send_message.clone(),
            presence,
            consumer: Arc::new(broker.clone()),
            settings: SessionSettings::default(),
            shutdown: shutdown.clone(),
            sessions: sessions.clone(),
        });
        let history = Arc::new(MessageHistoryService::new(messages, 10));

        let app = router(AppState::new(gateway, history));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let stop = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
                .ok();
        });

        Self {
            addr,
            broker,
            presence_store,
            send_message,
            shutdown,
            sessions,
        }
    }

    pub async fn presence_store_online(&self, user_id: UserId) -> bool {
        self.presence_store
            .is_online(user_id)
            .await
            .expect("memory store")
    }

    /// 轮询直到在线状态等于 `expected`，超时返回 `false`
    pub async fn wait_for_presence(&self, user_id: UserId, expected: bool) -> bool {
        for _ in 0..50 {
            if self.presence_store_online(user_id).await == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn connect(&self, user_id: u64) -> WsClient {
        let mut request = format!("ws://{}/api/v1/chat/ws", self.addr)
            .into_client_request()
            .expect("request");
        request.headers_mut().insert(
            USER_ID_HEADER,
            HeaderValue::from_str(&user_id.to_string()).expect("header"),
        );
        let (stream, _) = connect_async(request).await.expect("connect");
        WsClient { stream }
    }
}

pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsClient {
    pub async fn send_json(&mut self, value: serde_json::Value) {
        self.stream
            .send(WsMessage::Text(value.to_string().into()))
            .await
            .expect("send");
    }

    /// 下一条满足条件的 JSON 帧，跳过其他帧
    pub async fn next_matching<F>(&mut self, wait: Duration, mut pred: F) -> Option<serde_json::Value>
    where
        F: FnMut(&serde_json::Value) -> bool,
    {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let message = tokio::time::timeout_at(deadline, self.stream.next())
                .await
                .ok()??
                .ok()?;
            match message {
                WsMessage::Text(text) => {
                    let value: serde_json::Value = serde_json::from_str(text.as_str()).ok()?;
                    if pred(&value) {
                        return Some(value);
                    }
                }
                WsMessage::Close(_) => return None,
                _ => continue,
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}
