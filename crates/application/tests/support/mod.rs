//! 测试辅助：用内存实现组装网关依赖，并提供一对内存传输端点

#![allow(dead_code)]

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use application::broker::memory::{MemoryBroker, MemoryPresenceBus};
use application::presence::memory::MemoryPresenceStore;
use application::repository::memory::MemoryMessageStore;
use application::{
    GatewayContext, IdGenerator, MessageHistoryService, PresenceService, SendMessageDependencies,
    SendMessageUseCase, SessionSettings, SnowflakeGenerator, SystemClock, WireFrame,
};
use chrono::NaiveDate;
use config::RefreshPolicy;
use futures::channel::mpsc::{self, SendError, UnboundedReceiver, UnboundedSender};
use futures::{Sink, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub struct Harness {
    pub broker: MemoryBroker,
    pub presence_bus: MemoryPresenceBus,
    pub presence_store: Arc<MemoryPresenceStore>,
    pub messages: Arc<MemoryMessageStore>,
    pub presence: Arc<PresenceService>,
    pub send_message: Arc<SendMessageUseCase>,
    pub history: MessageHistoryService,
    pub ctx: Arc<GatewayContext>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(SessionSettings::default(), RefreshPolicy::ExtendOnly)
    }

    pub fn with(settings: SessionSettings, policy: RefreshPolicy) -> Self {
        let broker = MemoryBroker::new();
        let presence_bus = MemoryPresenceBus::new();
        let presence_store = Arc::new(MemoryPresenceStore::new());
        let messages = Arc::new(MemoryMessageStore::new());

        let presence = Arc::new(PresenceService::new(
            presence_store.clone(),
            Arc::new(presence_bus.clone()),
            Duration::from_secs(40),
            policy,
        ));
        let send_message = Arc::new(SendMessageUseCase::new(SendMessageDependencies {
            id_generator: id_generator(),
            message_store: messages.clone(),
            publisher: Arc::new(broker.clone()),
            clock: Arc::new(SystemClock),
        }));
        let history = MessageHistoryService::new(messages.clone(), 10);
        let ctx = Arc::new(GatewayContext {
            send_message: send_message.clone(),
            presence: presence.clone(),
            consumer: Arc::new(broker.clone()),
            settings,
            shutdown: CancellationToken::new(),
            sessions: TaskTracker::new(),
        });

        Self {
            broker,
            presence_bus,
            presence_store,
            messages,
            presence,
            send_message,
            history,
            ctx,
        }
    }
}

pub fn id_generator() -> Arc<dyn IdGenerator> {
    let epoch = NaiveDate::from_ymd_opt(2024, 6, 13).expect("valid date");
    Arc::new(SnowflakeGenerator::new(epoch, 1, Arc::new(SystemClock)).expect("generator"))
}

/// 会话一侧的传输端点
pub struct TestTransport {
    incoming: UnboundedReceiver<Result<WireFrame, String>>,
    outgoing: UnboundedSender<WireFrame>,
}

impl Stream for TestTransport {
    type Item = Result<WireFrame, String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.incoming).poll_next(cx)
    }
}

impl Sink<WireFrame> for TestTransport {
    type Error = SendError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.outgoing).poll_ready(cx)
    }

    fn start_send(mut self: Pin<&mut Self>, item: WireFrame) -> Result<(), Self::Error> {
        Pin::new(&mut self.outgoing).start_send(item)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.outgoing).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.outgoing).poll_close(cx)
    }
}

/// 模拟的客户端一侧
pub struct TestClient {
    to_server: UnboundedSender<Result<WireFrame, String>>,
    from_server: UnboundedReceiver<WireFrame>,
}

impl TestClient {
    pub fn send(&self, frame: WireFrame) {
        let _ = self.to_server.unbounded_send(Ok(frame));
    }

    pub fn send_text(&self, text: &str) {
        self.send(WireFrame::Text(text.to_string()));
    }

    pub fn fail(&self, error: &str) {
        let _ = self.to_server.unbounded_send(Err(error.to_string()));
    }

    /// 下一帧（含控制帧），超时返回 `None`
    pub async fn next_frame(&mut self, wait: Duration) -> Option<WireFrame> {
        tokio::time::timeout(wait, self.from_server.next())
            .await
            .ok()
            .flatten()
    }

    /// 下一条文本帧解析成 JSON，跳过心跳
    pub async fn next_json(&mut self, wait: Duration) -> Option<serde_json::Value> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let frame = tokio::time::timeout_at(deadline, self.from_server.next())
                .await
                .ok()
                .flatten()?;
            match frame {
                WireFrame::Text(text) => return serde_json::from_str(&text).ok(),
                WireFrame::Ping(_) | WireFrame::Pong(_) => continue,
                WireFrame::Binary(_) => continue,
                WireFrame::Close => return None,
            }
        }
    }
}

pub fn transport() -> (TestTransport, TestClient) {
    let (to_server, incoming) = mpsc::unbounded();
    let (outgoing, from_server) = mpsc::unbounded();
    (
        TestTransport { incoming, outgoing },
        TestClient {
            to_server,
            from_server,
        },
    )
}
