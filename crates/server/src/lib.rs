//! Lockstep generation server
//!
//! Client-facing front end of a tensor-parallel generation group. The
//! process with rank 0 serves HTTP and WebSocket clients and dispatches one
//! round per request to the whole group; every other rank runs a
//! [`FollowerLoop`](lockstep_dispatch::FollowerLoop) and never sees a client.
//!
//! This crate provides:
//! - `/api/v1/generate` over server-sent events and WebSocket
//! - Per-connection flow control ([`session`])
//! - Health, readiness and info endpoints

pub mod config;
pub mod error;
pub mod routes;
pub mod session;
pub mod state;
pub mod transport;

pub use config::{Args, ServerConfig};
pub use error::{Result, ServerError};
pub use session::{SessionError, SessionSummary, StreamingSession, Transport, TransportError};
pub use state::AppState;
