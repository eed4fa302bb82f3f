//! Application state

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use lockstep_dispatch::Dispatcher;
use uuid::Uuid;

use crate::config::ServerConfig;

/// One client stream currently being served
#[derive(Debug, Clone)]
pub struct ActiveStream {
    /// "sse" or "websocket"
    pub transport: &'static str,
    pub round: u64,
    pub started_at: Instant,
}

/// Server metadata
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub version: String,
    pub rank: u32,
    pub world_size: usize,
    pub started_at: Instant,
}

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Server configuration
    pub config: Arc<ServerConfig>,
    /// Leader-side round dispatch
    pub dispatcher: Dispatcher,
    /// Streams in progress, keyed by session id
    streams: Arc<DashMap<Uuid, ActiveStream>>,
    /// Server info
    pub info: Arc<ServerInfo>,
}

impl AppState {
    /// Create new application state
    pub fn new(config: ServerConfig, dispatcher: Dispatcher) -> Self {
        let info = ServerInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            rank: config.rank,
            world_size: dispatcher.world_size(),
            started_at: Instant::now(),
        };

        Self {
            config: Arc::new(config),
            dispatcher,
            streams: Arc::new(DashMap::new()),
            info: Arc::new(info),
        }
    }

    /// Whether the process group accepts new rounds
    pub fn is_ready(&self) -> bool {
        self.dispatcher.is_healthy()
    }

    /// Register a stream; it stays listed until the guard is dropped
    pub fn track_stream(&self, id: Uuid, transport: &'static str, round: u64) -> StreamGuard {
        self.streams.insert(
            id,
            ActiveStream {
                transport,
                round,
                started_at: Instant::now(),
            },
        );
        StreamGuard {
            id,
            streams: Arc::clone(&self.streams),
        }
    }

    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    /// Get uptime
    pub fn uptime(&self) -> Duration {
        self.info.started_at.elapsed()
    }
}

/// Removes its stream from the registry when dropped
#[must_use]
pub struct StreamGuard {
    id: Uuid,
    streams: Arc<DashMap<Uuid, ActiveStream>>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Some((_, stream)) = self.streams.remove(&self.id) {
            tracing::debug!(
                session_id = %self.id,
                round = stream.round,
                transport = stream.transport,
                elapsed_ms = stream.started_at.elapsed().as_millis() as u64,
                "Stream released"
            );
        }
    }
}
