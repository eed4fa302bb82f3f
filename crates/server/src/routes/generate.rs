//! Generation endpoints
//!
//! `/api/v1/generate` serves the same round two ways:
//!
//! - `POST` with a JSON body answers with server-sent events, one `data:`
//!   frame per token and a final `data: <EOS>`.
//! - `GET` upgrades to a WebSocket. The client sends the prompt as one text
//!   frame, then acknowledges tokens with any text or binary frame; the
//!   server closes the socket after the last token. A client that stops
//!   acknowledging is closed with 1008 once `ack_timeout` passes.

use std::fmt::Display;

use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{close_code, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{
        sse::{Event, Sse},
        Response,
    },
    BoxError, Json,
};
use futures::{Sink, Stream};
use lockstep_dispatch::DispatchError;
use lockstep_protocol::GenerationParams;
use serde::Deserialize;

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::session::{SessionError, SessionSummary, StreamingSession, TransportError};
use crate::state::AppState;
use crate::transport::{SseTransport, WsTransport};

/// Events buffered between a session and the SSE response body
const SSE_BUFFER: usize = 16;

/// Text generation request
#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    /// Prompt
    pub text: String,
    /// Maximum tokens to generate
    #[serde(default)]
    pub max_gen_len: Option<u32>,
    /// Temperature for sampling (0.0 = greedy)
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Nucleus sampling threshold
    #[serde(default)]
    pub top_p: Option<f32>,
}

impl GenerateRequest {
    fn into_params(self, config: &ServerConfig) -> GenerationParams {
        let mut params = config.default_params(self.text);
        params.max_gen_len = self.max_gen_len.unwrap_or(params.max_gen_len);
        params.temperature = self.temperature.unwrap_or(params.temperature);
        params.top_p = self.top_p.unwrap_or(params.top_p);
        params
    }
}

/// POST /api/v1/generate - Stream a generation as server-sent events
pub async fn generate_sse(
    State(state): State<AppState>,
    payload: std::result::Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, BoxError>> + Send + 'static>> {
    let Json(request) = payload.map_err(|e| ServerError::InvalidRequest(e.body_text()))?;
    let params = request.into_params(&state.config);

    let tokens = state.dispatcher.dispatch(params).await?;

    let session = StreamingSession::new(state.config.max_unacked).with_ack_timeout(state.config.ack_timeout);
    let session_id = session.id();
    let guard = state.track_stream(session_id, "sse", tokens.round());
    tracing::info!(session_id = %session_id, round = tokens.round(), "SSE stream started");

    let (mut transport, body) = SseTransport::channel(SSE_BUFFER);
    tokio::spawn(async move {
        let _guard = guard;
        log_outcome("sse", session.attach(tokens, &mut transport).await);
    });

    Ok(Sse::new(body))
}

/// GET /api/v1/generate - Stream a generation over a WebSocket
pub async fn generate_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket: WebSocket| serve_websocket(socket, state))
}

/// Run one WebSocket generation on an upgraded socket
pub async fn serve_websocket<S, E>(socket: S, state: AppState)
where
    S: Sink<Message> + Stream<Item = std::result::Result<Message, E>> + Unpin + Send,
    S::Error: Display + Send,
    E: Display + Send,
{
    let mut transport = WsTransport::new(socket);

    let prompt = match transport.recv_prompt().await {
        Ok(prompt) => prompt,
        Err(e) => {
            tracing::warn!(error = %e, "WebSocket closed before a prompt arrived");
            close_quietly(&mut transport, close_code::POLICY, &e.to_string()).await;
            return;
        }
    };

    let config = &state.config;
    let tokens = match state.dispatcher.dispatch(config.default_params(prompt)).await {
        Ok(tokens) => tokens,
        Err(e) => {
            let code = match e {
                DispatchError::InvalidParams(_) => close_code::POLICY,
                _ => close_code::AGAIN,
            };
            tracing::warn!(error = %e, code, "Refusing WebSocket generation");
            close_quietly(&mut transport, code, &e.to_string()).await;
            return;
        }
    };

    let session = StreamingSession::new(config.max_unacked).with_ack_timeout(config.ack_timeout);
    let _guard = state.track_stream(session.id(), "websocket", tokens.round());
    tracing::info!(session_id = %session.id(), round = tokens.round(), "WebSocket stream started");

    let outcome = session.attach(tokens, &mut transport).await;
    let silent_for = match &outcome {
        Err(SessionError::Transport {
            source: TransportError::AckTimeout(waited),
            ..
        }) => Some(*waited),
        _ => None,
    };
    log_outcome("websocket", outcome);

    if let Some(waited) = silent_for {
        let reason = format!("no acknowledgement within {waited:?}");
        close_quietly(&mut transport, close_code::POLICY, &reason).await;
    }
}

async fn close_quietly<S, E>(transport: &mut WsTransport<S>, code: u16, reason: &str)
where
    S: Sink<Message> + Stream<Item = std::result::Result<Message, E>> + Unpin + Send,
    S::Error: Display + Send,
    E: Display + Send,
{
    if let Err(e) = transport.close(code, reason).await {
        tracing::debug!(error = %e, code, "Close frame not delivered");
    }
}

fn log_outcome(transport: &'static str, outcome: std::result::Result<SessionSummary, SessionError>) {
    match outcome {
        Ok(summary) => tracing::info!(
            session_id = %summary.id,
            transport,
            sent = summary.sent,
            acked = summary.acked,
            "Stream complete"
        ),
        Err(SessionError::Transport { sent, source }) => {
            tracing::info!(transport, sent, reason = %source, "Stream cut short by the client");
        }
        Err(SessionError::Aborted { sent, source }) => {
            tracing::warn!(transport, sent, error = %source, "Stream aborted");
        }
    }
}
