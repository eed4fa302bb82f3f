//! SSE and WebSocket adapters for [`StreamingSession`](crate::session::StreamingSession)

use std::borrow::Cow;
use std::fmt::Display;

use async_trait::async_trait;
use axum::{
    extract::ws::{close_code, CloseFrame, Message},
    response::sse::Event,
    BoxError,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use lockstep_protocol::{TokenEvent, EOS_SENTINEL};
use tokio::sync::mpsc;

use crate::session::{Transport, TransportError};

/// Longest close reason a WebSocket close frame can carry
const MAX_CLOSE_REASON: usize = 123;

type SseItem = Result<Event, BoxError>;

/// Server-sent events. Writes go into a bounded channel that the response
/// body drains; the client cannot acknowledge anything.
pub struct SseTransport {
    tx: mpsc::Sender<SseItem>,
}

impl SseTransport {
    /// Create the transport and the event stream to hand to
    /// [`Sse::new`](axum::response::sse::Sse::new)
    pub fn channel(buffer: usize) -> (Self, impl Stream<Item = SseItem> + Send + 'static) {
        let (tx, mut rx) = mpsc::channel(buffer.max(1));
        let body = futures::stream::poll_fn(move |cx| rx.poll_recv(cx));
        (Self { tx }, body)
    }

    async fn push(&mut self, item: SseItem) -> Result<(), TransportError> {
        self.tx.send(item).await.map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn acknowledges(&self) -> bool {
        false
    }

    async fn send_token(&mut self, event: &TokenEvent) -> Result<(), TransportError> {
        self.push(Ok(Event::default().data(event.to_json()))).await
    }

    async fn recv_ack(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), TransportError> {
        self.push(Ok(Event::default().data(EOS_SENTINEL))).await
    }

    async fn abort(&mut self, reason: &str) -> Result<(), TransportError> {
        // An error item makes axum cut the body without a final frame.
        self.push(Err(reason.to_string().into())).await
    }
}

/// WebSocket connection. Every text or binary frame from the client counts
/// as one acknowledgement.
pub struct WsTransport<S> {
    socket: S,
}

impl<S, E> WsTransport<S>
where
    S: Sink<Message> + Stream<Item = Result<Message, E>> + Unpin + Send,
    S::Error: Display + Send,
    E: Display + Send,
{
    pub fn new(socket: S) -> Self {
        Self { socket }
    }

    /// Read the prompt: the first text frame the client sends
    pub async fn recv_prompt(&mut self) -> Result<String, TransportError> {
        loop {
            match self.next_message().await? {
                Message::Text(text) => return Ok(text),
                Message::Binary(_) => {
                    return Err(TransportError::Socket("expected a text frame with the prompt".into()));
                }
                _ => continue,
            }
        }
    }

    /// Send a close frame with `code`
    pub async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code,
            reason: Cow::Owned(truncate(reason, MAX_CLOSE_REASON).to_string()),
        };
        self.send(Message::Close(Some(frame))).await
    }

    async fn send(&mut self, message: Message) -> Result<(), TransportError> {
        self.socket
            .send(message)
            .await
            .map_err(|e| TransportError::Socket(e.to_string()))
    }

    /// Next data or close frame; ping/pong are skipped
    async fn next_message(&mut self) -> Result<Message, TransportError> {
        loop {
            match self.socket.next().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                Some(Ok(message)) => return Ok(message),
                Some(Err(e)) => return Err(TransportError::Socket(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl<S, E> Transport for WsTransport<S>
where
    S: Sink<Message> + Stream<Item = Result<Message, E>> + Unpin + Send,
    S::Error: Display + Send,
    E: Display + Send,
{
    fn acknowledges(&self) -> bool {
        true
    }

    async fn send_token(&mut self, event: &TokenEvent) -> Result<(), TransportError> {
        self.send(Message::Text(event.to_json())).await
    }

    async fn recv_ack(&mut self) -> Result<(), TransportError> {
        self.next_message().await.map(drop)
    }

    async fn finish(&mut self) -> Result<(), TransportError> {
        self.close(close_code::NORMAL, "").await
    }

    async fn abort(&mut self, reason: &str) -> Result<(), TransportError> {
        self.close(close_code::ERROR, reason).await
    }
}

/// Longest prefix of `s` within `max` bytes, cut on a char boundary
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
