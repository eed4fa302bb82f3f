//! Lockstep command dispatch for tensor-parallel generation
//!
//! Every rank of a tensor-parallel group holds a slice of the model and must
//! run the same generation call, with the same inputs, at the same time. Only
//! the leader (rank 0) talks to clients; it turns each request into a
//! numbered round, broadcasts the round's [`Command`](lockstep_protocol::Command)
//! to every follower, runs its own share of the work and streams the
//! resulting tokens back to the caller.
//!
//! ```text
//!            ┌──────────── Dispatcher (rank 0) ────────────┐
//!  request ─►│ round gate ─► broadcast ─► engine ─► stream  │─► tokens
//!            └──────┬──────────────────────────────▲───────┘
//!                   │ Command                      │ RoundReport
//!            ┌──────▼──────┐                ┌──────┴──────┐
//!            │ FollowerLoop│  ... rank N-1  │ FollowerLoop│
//!            └─────────────┘                └─────────────┘
//! ```
//!
//! Rounds never overlap: the next command is broadcast only after every rank
//! reported on the previous one. A group that lost track of its followers
//! stops accepting rounds instead of risking a mismatched collective.

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod follower;
pub mod group;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::DispatchConfig;
pub use dispatcher::{DispatchStats, Dispatcher, TokenStream};
pub use engine::{EchoEngine, EngineConfig, GenerationEngine, TokenSequence};
pub use error::{DispatchError, EngineError, GroupError, Result};
pub use follower::FollowerLoop;
pub use group::{FollowerLink, LeaderLink, Rank, LEADER_RANK};
