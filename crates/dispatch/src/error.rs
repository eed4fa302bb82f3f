//! Dispatch error types

use std::time::Duration;

use lockstep_protocol::{MsgType, ProtocolError};
use thiserror::Error;

use crate::group::Rank;

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Failures raised by a generation engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine not ready: {0}")]
    NotReady(String),

    #[error("Generation failed: {0}")]
    Generation(String),
}

/// Failures of the link between ranks
#[derive(Debug, Error)]
pub enum GroupError {
    #[error("Rank {rank} disconnected")]
    Disconnected { rank: Rank },

    #[error("Timed out after {waited:?} waiting for {what}")]
    Timeout { waited: Duration, what: &'static str },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Unexpected {got:?} from rank {rank}, expected {expected}")]
    Unexpected {
        rank: Rank,
        expected: &'static str,
        got: MsgType,
    },

    #[error("Acknowledgement from rank {rank} is for round {got}, expected {expected}")]
    AckMismatch { rank: Rank, expected: u64, got: u64 },

    #[error("Protocol error on link to rank {rank}: {source}")]
    Protocol {
        rank: Rank,
        #[source]
        source: ProtocolError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the dispatcher and the follower loop
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Invalid generation parameters: {0}")]
    InvalidParams(String),

    #[error("Another round is in flight; gave up after {0:?}")]
    Busy(Duration),

    #[error("Process group unavailable: {0}")]
    GroupUnavailable(String),

    #[error("Broadcast failed: {0}")]
    Broadcast(#[source] GroupError),

    #[error("Generation failed on the leader: {0}")]
    Generation(#[from] EngineError),

    #[error("Round {round} abandoned: rank {rank} failed: {reason}")]
    RoundAbandoned {
        round: u64,
        rank: Rank,
        reason: String,
    },

    #[error("Rank {rank} is out of step: {reason}")]
    Desynchronized { rank: Rank, reason: String },

    #[error("Round {round} ended without an outcome")]
    RoundLost { round: u64 },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Group error: {0}")]
    Group(#[from] GroupError),
}

impl DispatchError {
    /// Whether the request was refused before any round was opened, so
    /// resubmitting it later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}
