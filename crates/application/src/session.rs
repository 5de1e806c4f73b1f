//! 单条长连接的会话状态机
//!
//! 状态：`Connecting -> Active -> Closing -> Closed`。
//!
//! `Active` 阶段并发运行三个循环，共享同一个取消令牌：
//! - 写循环：唯一持有连接写端的任务，负责聊天投递、在线状态事件、心跳探测和错误回执；
//! - 读循环：读取客户端帧并调用发送用例，收到 Pong 时延长读超时；
//! - 心跳循环：定时通过写循环发送 Ping，收到 Pong 通知后续期在线状态。
//!
//! 任一循环退出即取消其余循环，等待全部结束后依次关闭聊天消费者、标记离线、关闭连接。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use config::HeartbeatConfig;
use domain::{Message, PresenceEvent, UserId};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinSet;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::broker::{BrokerConsumer, BrokerSubscription, Delivery};
use crate::dto::{ClientFrame, MessageFrame, ServerFrame};
use crate::error::ApplicationError;
use crate::presence::{ConnectionId, PresenceService};
use crate::services::{SendMessageCommand, SendMessageUseCase};

const OUTBOUND_BUFFER: usize = 32;

/// 与具体 WebSocket 实现无关的传输帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// 心跳与超时参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub ping_interval: Duration,
    pub pong_deadline: Duration,
    pub initial_read_deadline: Duration,
    pub write_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&HeartbeatConfig::default())
    }
}

impl From<&HeartbeatConfig> for SessionSettings {
    fn from(config: &HeartbeatConfig) -> Self {
        Self {
            ping_interval: Duration::from_secs(config.ping_interval_secs),
            pong_deadline: Duration::from_secs(config.pong_deadline_secs),
            initial_read_deadline: Duration::from_secs(config.initial_read_deadline_secs),
            write_timeout: Duration::from_secs(config.write_timeout_secs),
        }
    }
}

/// 所有会话共享的依赖，在启动时构造一次
pub struct GatewayContext {
    pub send_message: Arc<SendMessageUseCase>,
    pub presence: Arc<PresenceService>,
    pub consumer: Arc<dyn BrokerConsumer>,
    pub settings: SessionSettings,
    /// 进程级关闭信号，每个会话的取消令牌都是它的子令牌
    pub shutdown: CancellationToken,
    /// 跟踪所有运行中的会话，关闭时等待它们完成清理
    pub sessions: TaskTracker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// 会话结束的原因（取第一个退出的循环）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    TransportError,
    ReadTimeout,
    ConsumerEnded,
    WriteFailed,
    Cancelled,
    TaskFailed,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::TransportError => "transport_error",
            CloseReason::ReadTimeout => "read_timeout",
            CloseReason::ConsumerEnded => "consumer_ended",
            CloseReason::WriteFailed => "write_failed",
            CloseReason::Cancelled => "cancelled",
            CloseReason::TaskFailed => "task_failed",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 交给写循环的写命令
#[derive(Debug)]
enum Outbound {
    Ping,
    Pong(Vec<u8>),
    Frame(ServerFrame),
}

#[derive(Debug, Error)]
enum WriteError {
    #[error("write timed out")]
    Timeout,
    #[error("transport rejected frame: {0}")]
    Transport(String),
}

/// 写循环退出时归还的资源
struct WriterParts<S> {
    sink: S,
    chat: BrokerSubscription<Delivery>,
    presence: BrokerSubscription<Delivery>,
}

enum LoopExit<S> {
    Writer(CloseReason, WriterParts<S>),
    Reader(CloseReason),
    Heartbeat(CloseReason),
}

pub struct ConnectionSession {
    ctx: Arc<GatewayContext>,
    user_id: UserId,
    connection_id: ConnectionId,
    chat: BrokerSubscription<Delivery>,
    presence: BrokerSubscription<Delivery>,
    state: watch::Sender<SessionState>,
}

impl ConnectionSession {
    /// 为已认证的用户获取聊天消费者和在线状态订阅。
    ///
    /// 失败时连接不应升级。
    pub async fn connect(
        ctx: Arc<GatewayContext>,
        user_id: UserId,
    ) -> Result<Self, ApplicationError> {
        let (state, _) = watch::channel(SessionState::Connecting);
        let chat = ctx.consumer.open_consumer(user_id).await?;
        let presence = match ctx.presence.subscribe(user_id).await {
            Ok(subscription) => subscription,
            Err(err) => {
                chat.close().await;
                return Err(err);
            }
        };
        let connection_id = ConnectionId::new();
        tracing::info!(user_id = %user_id, connection_id = %connection_id, "session connecting");
        Ok(Self {
            ctx,
            user_id,
            connection_id,
            chat,
            presence,
            state,
        })
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// 在给定的传输上运行会话，直到任一循环退出并完成清理
    pub async fn run<T, E>(self, transport: T) -> CloseReason
    where
        T: Stream<Item = Result<WireFrame, E>> + Sink<WireFrame> + Send + 'static,
        <T as Sink<WireFrame>>::Error: fmt::Display + Send,
        E: fmt::Display + Send + 'static,
    {
        let Self {
            ctx,
            user_id,
            connection_id,
            chat,
            presence,
            state,
        } = self;
        let settings = ctx.settings;

        if let Err(err) = ctx.presence.set_online(user_id, connection_id).await {
            tracing::error!(user_id = %user_id, error = %err, "failed to mark user online");
        }
        state.send_replace(SessionState::Active);
        tracing::info!(user_id = %user_id, "session active");

        let cancel = ctx.shutdown.child_token();
        let (sink, stream) = transport.split::<WireFrame>();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let pong = Arc::new(Notify::new());

        let mut tasks = JoinSet::new();
        tasks.spawn({
            let cancel = cancel.clone();
            async move {
                let (reason, parts) = write_loop(
                    user_id,
                    WriterParts {
                        sink,
                        chat,
                        presence,
                    },
                    outbound_rx,
                    settings.write_timeout,
                    cancel,
                )
                .await;
                LoopExit::Writer(reason, parts)
            }
        });
        tasks.spawn({
            let ctx = Arc::clone(&ctx);
            let outbound = outbound_tx.clone();
            let pong = Arc::clone(&pong);
            let cancel = cancel.clone();
            async move { LoopExit::Reader(read_loop(ctx, user_id, stream, outbound, pong, cancel).await) }
        });
        tasks.spawn({
            let ctx = Arc::clone(&ctx);
            let cancel = cancel.clone();
            async move {
                LoopExit::Heartbeat(
                    heartbeat_loop(ctx, user_id, connection_id, outbound_tx, pong, cancel).await,
                )
            }
        });

        let mut reason = None;
        let mut parts = None;
        while let Some(joined) = tasks.join_next().await {
            let exit = match joined {
                Ok(LoopExit::Writer(exit, returned)) => {
                    parts = Some(returned);
                    exit
                }
                Ok(LoopExit::Reader(exit)) | Ok(LoopExit::Heartbeat(exit)) => exit,
                Err(err) => {
                    tracing::error!(user_id = %user_id, error = %err, "session task failed");
                    CloseReason::TaskFailed
                }
            };
            if reason.is_none() {
                reason = Some(exit);
                state.send_replace(SessionState::Closing);
                tracing::info!(user_id = %user_id, reason = %exit, "session closing");
                cancel.cancel();
            }
        }
        let reason = reason.unwrap_or(CloseReason::Cancelled);

        let (sink, presence) = match parts {
            Some(WriterParts {
                sink,
                chat,
                presence,
            }) => {
                chat.close().await;
                (Some(sink), Some(presence))
            }
            None => (None, None),
        };

        if let Err(err) = ctx
            .presence
            .set_offline(user_id, connection_id, presence)
            .await
        {
            tracing::error!(user_id = %user_id, error = %err, "failed to mark user offline");
        }

        if let Some(mut sink) = sink {
            if !matches!(reason, CloseReason::WriteFailed | CloseReason::TransportError) {
                let _ = time::timeout(settings.write_timeout, sink.send(WireFrame::Close)).await;
            }
            let _ = time::timeout(settings.write_timeout, sink.close()).await;
        }

        state.send_replace(SessionState::Closed);
        tracing::info!(user_id = %user_id, reason = %reason, "session closed");
        reason
    }
}

async fn write_frame<S>(sink: &mut S, frame: WireFrame, limit: Duration) -> Result<(), WriteError>
where
    S: Sink<WireFrame> + Unpin,
    S::Error: fmt::Display,
{
    match time::timeout(limit, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(WriteError::Transport(err.to_string())),
        Err(_) => Err(WriteError::Timeout),
    }
}

async fn write_loop<S>(
    user_id: UserId,
    parts: WriterParts<S>,
    mut outbound: mpsc::Receiver<Outbound>,
    write_timeout: Duration,
    cancel: CancellationToken,
) -> (CloseReason, WriterParts<S>)
where
    S: Sink<WireFrame> + Unpin,
    S::Error: fmt::Display,
{
    let WriterParts {
        mut sink,
        mut chat,
        mut presence,
    } = parts;

    let reason = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break CloseReason::Cancelled,
            command = outbound.recv() => {
                let Some(command) = command else {
                    break CloseReason::Cancelled;
                };
                let frame = match command {
                    Outbound::Ping => WireFrame::Ping(Vec::new()),
                    Outbound::Pong(data) => WireFrame::Pong(data),
                    Outbound::Frame(frame) => match frame.to_json() {
                        Ok(text) => WireFrame::Text(text),
                        Err(err) => {
                            tracing::warn!(user_id = %user_id, error = %err, "failed to encode server frame");
                            continue;
                        }
                    },
                };
                if let Err(err) = write_frame(&mut sink, frame, write_timeout).await {
                    tracing::warn!(user_id = %user_id, error = %err, "write failed");
                    break CloseReason::WriteFailed;
                }
            }
            delivery = chat.recv() => {
                let Some(delivery) = delivery else {
                    break CloseReason::ConsumerEnded;
                };
                if let Err(err) = forward_chat(user_id, &mut sink, delivery, write_timeout).await {
                    tracing::warn!(user_id = %user_id, error = %err, "chat delivery write failed");
                    break CloseReason::WriteFailed;
                }
            }
            delivery = presence.recv() => {
                let Some(delivery) = delivery else {
                    break CloseReason::ConsumerEnded;
                };
                if let Err(err) = forward_presence(user_id, &mut sink, delivery, write_timeout).await {
                    tracing::warn!(user_id = %user_id, error = %err, "presence write failed");
                    break CloseReason::WriteFailed;
                }
            }
        }
    };

    (
        reason,
        WriterParts {
            sink,
            chat,
            presence,
        },
    )
}

/// 写出一条聊天投递，写成功后才确认。
/// 写失败时不确认，由代理重新投递。
async fn forward_chat<S>(
    user_id: UserId,
    sink: &mut S,
    delivery: Delivery,
    write_timeout: Duration,
) -> Result<(), WriteError>
where
    S: Sink<WireFrame> + Unpin,
    S::Error: fmt::Display,
{
    let encoded = delivery
        .decode::<Message>()
        .and_then(|message| {
            ServerFrame::Message(MessageFrame::from(&message))
                .to_json()
                .map(|text| (message.id, text))
                .map_err(|err| crate::broker::BrokerError::Serialization(err.to_string()))
        });
    let (message_id, text) = match encoded {
        Ok(encoded) => encoded,
        Err(err) => {
            tracing::warn!(user_id = %user_id, error = %err, "rejecting malformed chat delivery");
            if let Err(err) = delivery.reject(&err.to_string()).await {
                tracing::warn!(user_id = %user_id, error = %err, "failed to reject delivery");
            }
            return Ok(());
        }
    };

    write_frame(sink, WireFrame::Text(text), write_timeout).await?;
    if let Err(err) = delivery.ack().await {
        tracing::warn!(user_id = %user_id, message_id = %message_id, error = %err, "failed to ack delivery");
    }
    tracing::debug!(user_id = %user_id, message_id = %message_id, "message delivered");
    Ok(())
}

async fn forward_presence<S>(
    user_id: UserId,
    sink: &mut S,
    delivery: Delivery,
    write_timeout: Duration,
) -> Result<(), WriteError>
where
    S: Sink<WireFrame> + Unpin,
    S::Error: fmt::Display,
{
    let event = match delivery.decode::<PresenceEvent>() {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(user_id = %user_id, error = %err, "rejecting malformed presence event");
            if let Err(err) = delivery.reject(&err.to_string()).await {
                tracing::warn!(user_id = %user_id, error = %err, "failed to reject presence event");
            }
            return Ok(());
        }
    };
    // 自己的上下线事件不回显
    if event.user_id == user_id {
        if let Err(err) = delivery.ack().await {
            tracing::warn!(user_id = %user_id, error = %err, "failed to ack presence event");
        }
        return Ok(());
    }

    let text = match ServerFrame::Presence(event).to_json() {
        Ok(text) => text,
        Err(err) => {
            if let Err(err) = delivery.reject(&err.to_string()).await {
                tracing::warn!(user_id = %user_id, error = %err, "failed to reject presence event");
            }
            return Ok(());
        }
    };
    write_frame(sink, WireFrame::Text(text), write_timeout).await?;
    if let Err(err) = delivery.ack().await {
        tracing::warn!(user_id = %user_id, peer = %event.user_id, error = %err, "failed to ack presence event");
    }
    tracing::debug!(user_id = %user_id, peer = %event.user_id, status = ?event.status, "presence forwarded");
    Ok(())
}

async fn read_loop<St, E>(
    ctx: Arc<GatewayContext>,
    user_id: UserId,
    mut stream: St,
    outbound: mpsc::Sender<Outbound>,
    pong: Arc<Notify>,
    cancel: CancellationToken,
) -> CloseReason
where
    St: Stream<Item = Result<WireFrame, E>> + Unpin,
    E: fmt::Display,
{
    let settings = ctx.settings;
    let mut deadline = Instant::now() + settings.initial_read_deadline;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return CloseReason::Cancelled,
            next = time::timeout_at(deadline, stream.next()) => next,
        };
        let frame = match next {
            Err(_) => {
                tracing::info!(user_id = %user_id, "read deadline exceeded");
                return CloseReason::ReadTimeout;
            }
            Ok(None) => return CloseReason::ClientClosed,
            Ok(Some(Err(err))) => {
                tracing::warn!(user_id = %user_id, error = %err, "transport read failed");
                return CloseReason::TransportError;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            WireFrame::Text(text) => {
                if !handle_client_frame(&ctx, user_id, text.as_bytes(), &outbound, &cancel).await {
                    return CloseReason::Cancelled;
                }
            }
            WireFrame::Binary(data) => {
                if !handle_client_frame(&ctx, user_id, &data, &outbound, &cancel).await {
                    return CloseReason::Cancelled;
                }
            }
            WireFrame::Ping(data) => {
                if outbound.send(Outbound::Pong(data)).await.is_err() {
                    return CloseReason::Cancelled;
                }
            }
            WireFrame::Pong(_) => {
                deadline = Instant::now() + settings.pong_deadline;
                pong.notify_one();
            }
            WireFrame::Close => return CloseReason::ClientClosed,
        }
    }
}

/// 处理一条客户端帧。返回 `false` 表示会话已在取消中。
async fn handle_client_frame(
    ctx: &GatewayContext,
    user_id: UserId,
    raw: &[u8],
    outbound: &mpsc::Sender<Outbound>,
    cancel: &CancellationToken,
) -> bool {
    let frame: ClientFrame = match serde_json::from_slice(raw) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!(user_id = %user_id, error = %err, "ignoring undecodable client frame");
            return true;
        }
    };

    let command = SendMessageCommand {
        from: user_id,
        to: frame.to,
        content: frame.content,
    };
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => return false,
        result = ctx.send_message.execute(command) => result,
    };

    if let Err(err) = result {
        tracing::warn!(user_id = %user_id, error = %err, "send message failed");
        if outbound
            .send(Outbound::Frame(ServerFrame::error(err.to_string())))
            .await
            .is_err()
        {
            return false;
        }
    }
    true
}

async fn heartbeat_loop(
    ctx: Arc<GatewayContext>,
    user_id: UserId,
    connection_id: ConnectionId,
    outbound: mpsc::Sender<Outbound>,
    pong: Arc<Notify>,
    cancel: CancellationToken,
) -> CloseReason {
    let period = ctx.settings.ping_interval;
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return CloseReason::Cancelled,
            _ = ticker.tick() => {
                if outbound.send(Outbound::Ping).await.is_err() {
                    tracing::debug!(user_id = %user_id, "connection closing, heartbeat stopped");
                    return CloseReason::Cancelled;
                }
            }
            _ = pong.notified() => {
                if let Err(err) = ctx.presence.refresh(user_id, connection_id).await {
                    tracing::warn!(user_id = %user_id, error = %err, "presence refresh failed");
                }
            }
        }
    }
}
