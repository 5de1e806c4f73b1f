//! axum WebSocket 与会话传输帧之间的适配

use std::pin::Pin;
use std::task::{Context, Poll};

use application::WireFrame;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{Sink, Stream, StreamExt};

pub struct WsTransport {
    inner: WebSocket,
}

impl WsTransport {
    pub fn new(inner: WebSocket) -> Self {
        Self { inner }
    }
}

fn from_ws(message: WsMessage) -> WireFrame {
    match message {
        WsMessage::Text(text) => WireFrame::Text(text.as_str().to_owned()),
        WsMessage::Binary(data) => WireFrame::Binary(data.to_vec()),
        WsMessage::Ping(data) => WireFrame::Ping(data.to_vec()),
        WsMessage::Pong(data) => WireFrame::Pong(data.to_vec()),
        WsMessage::Close(_) => WireFrame::Close,
    }
}

fn to_ws(frame: WireFrame) -> WsMessage {
    match frame {
        WireFrame::Text(text) => WsMessage::Text(text.into()),
        WireFrame::Binary(data) => WsMessage::Binary(data.into()),
        WireFrame::Ping(data) => WsMessage::Ping(data.into()),
        WireFrame::Pong(data) => WsMessage::Pong(data.into()),
        WireFrame::Close => WsMessage::Close(None),
    }
}

impl Stream for WsTransport {
    type Item = Result<WireFrame, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner
            .poll_next_unpin(cx)
            .map(|item| item.map(|result| result.map(from_ws)))
    }
}

impl Sink<WireFrame> for WsTransport {
    type Error = axum::Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_ready(cx)
    }

    fn start_send(mut self: Pin<&mut Self>, item: WireFrame) -> Result<(), Self::Error> {
        Pin::new(&mut self.inner).start_send(to_ws(item))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_close(cx)
    }
}
