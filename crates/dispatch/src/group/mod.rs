//! Process group links
//!
//! A process group has one leader (rank 0) and `world_size - 1` followers.
//! The leader broadcasts [`Message::Command`] / [`Message::Shutdown`] to all
//! followers and collects one [`RoundReport`] per follower after every round.
//!
//! A broadcast is a rendezvous: it returns only after every follower has
//! acknowledged receipt. Followers acknowledge inside
//! [`FollowerLink::receive`], before handing the message to the caller.
//!
//! Two implementations are provided:
//! - [`local`]: tokio channels inside one process
//! - [`tcp`]: one TCP connection per follower, framed with the wire protocol

pub mod local;
pub mod tcp;

use async_trait::async_trait;
use lockstep_protocol::{Ack, Message, RoundReport};

use crate::error::GroupError;

/// Identifier of one shard-holding process
pub type Rank = u32;

/// Rank of the process that terminates client connections
pub const LEADER_RANK: Rank = 0;

/// Leader side of a process group
#[async_trait]
pub trait LeaderLink: Send + Sync + 'static {
    /// Total number of ranks, leader included
    fn world_size(&self) -> usize;

    /// Deliver `message` to every follower and wait for all acknowledgements
    async fn broadcast(&self, message: &Message) -> Result<(), GroupError>;

    /// Wait for one report from every follower, ordered by rank
    async fn collect_reports(&self) -> Result<Vec<RoundReport>, GroupError>;
}

/// Follower side of a process group
#[async_trait]
pub trait FollowerLink: Send + 'static {
    fn rank(&self) -> Rank;

    fn world_size(&self) -> usize;

    /// Block until the leader broadcasts the next message
    async fn receive(&mut self) -> Result<Message, GroupError>;

    /// Send this rank's outcome for the current round
    async fn report(&mut self, report: &RoundReport) -> Result<(), GroupError>;
}

/// Acknowledgement a follower returns for a broadcast message
pub(crate) fn ack_for(message: &Message) -> Message {
    Message::Ack(Ack {
        round: message.round().unwrap_or(0),
    })
}

/// Check that `reply` from `rank` acknowledges `sent`
pub(crate) fn check_ack(rank: Rank, sent: &Message, reply: Message) -> Result<(), GroupError> {
    let expected = sent.round().unwrap_or(0);
    match reply {
        Message::Ack(ack) if ack.round == expected => Ok(()),
        Message::Ack(ack) => Err(GroupError::AckMismatch {
            rank,
            expected,
            got: ack.round,
        }),
        other => Err(GroupError::Unexpected {
            rank,
            expected: "acknowledgement",
            got: other.msg_type(),
        }),
    }
}

/// Check that `reply` from `rank` is a round report
pub(crate) fn expect_report(rank: Rank, reply: Message) -> Result<RoundReport, GroupError> {
    match reply {
        Message::RoundReport(report) => Ok(report),
        other => Err(GroupError::Unexpected {
            rank,
            expected: "round report",
            got: other.msg_type(),
        }),
    }
}
