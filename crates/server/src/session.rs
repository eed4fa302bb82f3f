//! Per-connection token delivery with flow control
//!
//! A [`StreamingSession`] moves the leader's token events from a dispatched
//! round onto one client connection. On transports where the client
//! acknowledges tokens (WebSocket) the session never lets more than
//! `max_unacked` tokens go unacknowledged; on fire-and-forget transports
//! (SSE) the bounded outbound channel and a yield after every send are the
//! only flow control.
//!
//! A client that stops acknowledging altogether is cut off after
//! `ack_timeout`, so the round it holds can drain and release the group.
//!
//! The session only ever stops *delivering*. Dropping the token stream does
//! not stop the round: the dispatcher keeps draining it so every rank still
//! finishes the same computation.

use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use lockstep_dispatch::DispatchError;
use lockstep_protocol::TokenEvent;
use thiserror::Error;
use uuid::Uuid;

/// Unacknowledged tokens allowed per connection by default
pub const DEFAULT_MAX_UNACKED: u64 = 10;

/// How long a session waits for one acknowledgement by default
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Failures of a single client connection
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Client disconnected")]
    Closed,

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("No acknowledgement within {0:?}")]
    AckTimeout(Duration),
}

/// A client connection tokens can be written to
#[async_trait]
pub trait Transport: Send {
    /// Whether the client acknowledges received tokens
    fn acknowledges(&self) -> bool;

    async fn send_token(&mut self, event: &TokenEvent) -> Result<(), TransportError>;

    /// Wait for one acknowledgement; its content is ignored
    async fn recv_ack(&mut self) -> Result<(), TransportError>;

    /// Mark the end of a complete stream
    async fn finish(&mut self) -> Result<(), TransportError>;

    /// End the stream in a way the client can tell apart from `finish`
    async fn abort(&mut self, reason: &str) -> Result<(), TransportError>;
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Delivery stopped after {sent} tokens: {source}")]
    Transport {
        sent: u64,
        #[source]
        source: TransportError,
    },

    #[error("Round failed after {sent} tokens: {source}")]
    Aborted {
        sent: u64,
        #[source]
        source: DispatchError,
    },
}

/// Outcome of a completed session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: Uuid,
    pub sent: u64,
    pub acked: u64,
}

#[derive(Debug)]
pub struct StreamingSession {
    id: Uuid,
    sent_count: u64,
    acked_count: u64,
    max_unacked: u64,
    ack_timeout: Duration,
}

impl StreamingSession {
    pub fn new(max_unacked: u64) -> Self {
        Self::with_id(Uuid::new_v4(), max_unacked)
    }

    pub fn with_id(id: Uuid, max_unacked: u64) -> Self {
        Self {
            id,
            sent_count: 0,
            acked_count: 0,
            max_unacked,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    /// Give up on a client that sends no acknowledgement for `timeout`
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Deliver `stream` over `transport` until it ends, fails, or the client
    /// goes away
    pub async fn attach<S, T>(mut self, stream: S, transport: &mut T) -> Result<SessionSummary, SessionError>
    where
        S: Stream<Item = Result<TokenEvent, DispatchError>> + Send,
        T: Transport + ?Sized,
    {
        let mut stream = std::pin::pin!(stream);

        while let Some(item) = stream.next().await {
            let event = match item {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(session_id = %self.id, sent = self.sent_count, error = %e, "Aborting stream");
                    if let Err(close_err) = transport.abort(&e.to_string()).await {
                        tracing::debug!(session_id = %self.id, error = %close_err, "Abort not delivered");
                    }
                    return Err(SessionError::Aborted {
                        sent: self.sent_count,
                        source: e,
                    });
                }
            };

            if let Err(e) = transport.send_token(&event).await {
                return Err(self.disconnected(e));
            }
            self.sent_count += 1;

            if transport.acknowledges() {
                while self.sent_count - self.acked_count > self.max_unacked {
                    let ack = tokio::time::timeout(self.ack_timeout, transport.recv_ack())
                        .await
                        .unwrap_or(Err(TransportError::AckTimeout(self.ack_timeout)));
                    if let Err(e) = ack {
                        return Err(self.disconnected(e));
                    }
                    self.acked_count += 1;
                }
            }

            tokio::task::yield_now().await;
        }

        if let Err(e) = transport.finish().await {
            return Err(self.disconnected(e));
        }

        tracing::debug!(session_id = %self.id, sent = self.sent_count, acked = self.acked_count, "Stream finished");
        Ok(SessionSummary {
            id: self.id,
            sent: self.sent_count,
            acked: self.acked_count,
        })
    }

    fn disconnected(&self, source: TransportError) -> SessionError {
        tracing::warn!(session_id = %self.id, sent = self.sent_count, error = %source, "Client went away, stopping delivery");
        SessionError::Transport {
            sent: self.sent_count,
            source,
        }
    }
}

impl Default for StreamingSession {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_UNACKED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    /// Records what the session did and checks the unacknowledged gap itself
    #[derive(Default)]
    struct RecordingTransport {
        acknowledges: bool,
        /// Acks the client has already sent when asked for one
        acks_available: u64,
        fail_on_send: Option<usize>,
        sent: Vec<String>,
        acked: u64,
        gaps: Vec<u64>,
        finished: u32,
        aborted: Option<String>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn acknowledges(&self) -> bool {
            self.acknowledges
        }

        async fn send_token(&mut self, event: &TokenEvent) -> Result<(), TransportError> {
            if self.fail_on_send == Some(self.sent.len()) {
                return Err(TransportError::Closed);
            }
            self.gaps.push(self.sent.len() as u64 - self.acked);
            self.sent.push(event.text.clone());
            Ok(())
        }

        async fn recv_ack(&mut self) -> Result<(), TransportError> {
            if self.acks_available == 0 {
                return Err(TransportError::Closed);
            }
            self.acks_available -= 1;
            self.acked += 1;
            Ok(())
        }

        async fn finish(&mut self) -> Result<(), TransportError> {
            self.finished += 1;
            Ok(())
        }

        async fn abort(&mut self, reason: &str) -> Result<(), TransportError> {
            self.aborted = Some(reason.to_string());
            Ok(())
        }
    }

    fn tokens(n: usize) -> Vec<Result<TokenEvent, DispatchError>> {
        (0..n)
            .map(|i| Ok(TokenEvent::new(i as u32, format!("t{i}"), 0.5, 0)))
            .collect()
    }

    #[tokio::test]
    async fn test_unacked_gap_never_exceeds_limit() {
        let mut transport = RecordingTransport {
            acknowledges: true,
            acks_available: u64::MAX,
            ..Default::default()
        };

        let summary = StreamingSession::new(10)
            .attach(stream::iter(tokens(35)), &mut transport)
            .await
            .unwrap();

        assert_eq!(summary.sent, 35);
        assert_eq!(summary.acked, 25);
        assert!(transport.gaps.iter().all(|gap| *gap <= 10), "{:?}", transport.gaps);
        assert_eq!(transport.finished, 1);
    }

    #[tokio::test]
    async fn test_missing_acks_stop_delivery() {
        let mut transport = RecordingTransport {
            acknowledges: true,
            acks_available: 2,
            ..Default::default()
        };

        let result = StreamingSession::new(3)
            .attach(stream::iter(tokens(20)), &mut transport)
            .await;

        // 3 free tokens, two more paid for with acks, the sixth waits forever
        assert!(matches!(
            result,
            Err(SessionError::Transport { sent: 6, source: TransportError::Closed })
        ));
        assert_eq!(transport.sent.len(), 6);
        assert_eq!(transport.finished, 0);
    }

    /// Stays connected and never acknowledges
    struct SilentTransport {
        sent: u64,
    }

    #[async_trait]
    impl Transport for SilentTransport {
        fn acknowledges(&self) -> bool {
            true
        }

        async fn send_token(&mut self, _event: &TokenEvent) -> Result<(), TransportError> {
            self.sent += 1;
            Ok(())
        }

        async fn recv_ack(&mut self) -> Result<(), TransportError> {
            std::future::pending().await
        }

        async fn finish(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn abort(&mut self, _reason: &str) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_silent_client_is_cut_off() {
        let mut transport = SilentTransport { sent: 0 };

        let result = StreamingSession::new(4)
            .with_ack_timeout(Duration::from_millis(50))
            .attach(stream::iter(tokens(100)), &mut transport)
            .await;

        assert!(matches!(
            result,
            Err(SessionError::Transport {
                sent: 5,
                source: TransportError::AckTimeout(_)
            })
        ));
        assert_eq!(transport.sent, 5);
    }

    #[tokio::test]
    async fn test_sse_style_transport_delivers_in_order_then_finishes_once() {
        let mut transport = RecordingTransport::default();

        let summary = StreamingSession::default()
            .attach(stream::iter(tokens(4)), &mut transport)
            .await
            .unwrap();

        assert_eq!(summary.sent, 4);
        assert_eq!(summary.acked, 0);
        assert_eq!(transport.sent, ["t0", "t1", "t2", "t3"]);
        assert_eq!(transport.finished, 1);
        assert!(transport.aborted.is_none());
    }

    #[tokio::test]
    async fn test_round_failure_aborts_without_finish() {
        let mut items = tokens(2);
        items.push(Err(DispatchError::RoundAbandoned {
            round: 4,
            rank: 2,
            reason: "out of memory".to_string(),
        }));
        let mut transport = RecordingTransport::default();

        let result = StreamingSession::default()
            .attach(stream::iter(items), &mut transport)
            .await;

        assert!(matches!(result, Err(SessionError::Aborted { sent: 2, .. })));
        assert_eq!(transport.finished, 0);
        assert!(transport.aborted.unwrap().contains("out of memory"));
    }

    #[tokio::test]
    async fn test_disconnect_stops_writing() {
        let mut transport = RecordingTransport {
            fail_on_send: Some(2),
            ..Default::default()
        };

        let result = StreamingSession::default()
            .attach(stream::iter(tokens(5)), &mut transport)
            .await;

        assert!(matches!(result, Err(SessionError::Transport { sent: 2, .. })));
        assert_eq!(transport.sent, ["t0", "t1"]);
        assert_eq!(transport.finished, 0);
    }
}
