//! In-process process group
//!
//! Every rank lives in the same process and talks over tokio channels.
//! Messages still travel as encoded frames so the codec is exercised the
//! same way it is over TCP.

use async_trait::async_trait;
use bytes::Bytes;
use lockstep_protocol::{Message, RoundReport};
use tokio::sync::{mpsc, oneshot, Mutex};

use super::{ack_for, check_ack, expect_report, FollowerLink, LeaderLink, Rank, LEADER_RANK};
use crate::error::GroupError;

/// A broadcast frame and the slot its acknowledgement goes into
struct Delivery {
    frame: Bytes,
    ack: oneshot::Sender<Bytes>,
}

struct LocalPeer {
    rank: Rank,
    commands: mpsc::Sender<Delivery>,
    reports: Mutex<mpsc::Receiver<Bytes>>,
}

/// Leader end of an in-process group
pub struct LocalLeader {
    world_size: usize,
    peers: Vec<LocalPeer>,
}

/// Follower end of an in-process group
pub struct LocalFollower {
    rank: Rank,
    world_size: usize,
    commands: mpsc::Receiver<Delivery>,
    reports: mpsc::Sender<Bytes>,
}

/// Create a group of `world_size` ranks. The followers are returned in rank
/// order (rank 1 first).
pub fn group(world_size: usize) -> (LocalLeader, Vec<LocalFollower>) {
    let world_size = world_size.max(1);
    let mut peers = Vec::with_capacity(world_size - 1);
    let mut followers = Vec::with_capacity(world_size - 1);

    for rank in 1..world_size as Rank {
        let (command_tx, command_rx) = mpsc::channel(1);
        let (report_tx, report_rx) = mpsc::channel(1);
        peers.push(LocalPeer {
            rank,
            commands: command_tx,
            reports: Mutex::new(report_rx),
        });
        followers.push(LocalFollower {
            rank,
            world_size,
            commands: command_rx,
            reports: report_tx,
        });
    }

    (LocalLeader { world_size, peers }, followers)
}

fn decode(rank: Rank, frame: &[u8]) -> Result<Message, GroupError> {
    Message::decode(frame).map_err(|source| GroupError::Protocol { rank, source })
}

#[async_trait]
impl LeaderLink for LocalLeader {
    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn broadcast(&self, message: &Message) -> Result<(), GroupError> {
        let frame = Bytes::from(message.encode());

        let mut pending = Vec::with_capacity(self.peers.len());
        for peer in &self.peers {
            let (ack_tx, ack_rx) = oneshot::channel();
            peer.commands
                .send(Delivery {
                    frame: frame.clone(),
                    ack: ack_tx,
                })
                .await
                .map_err(|_| GroupError::Disconnected { rank: peer.rank })?;
            pending.push((peer.rank, ack_rx));
        }

        for (rank, ack_rx) in pending {
            let ack = ack_rx
                .await
                .map_err(|_| GroupError::Disconnected { rank })?;
            check_ack(rank, message, decode(rank, &ack)?)?;
        }

        Ok(())
    }

    async fn collect_reports(&self) -> Result<Vec<RoundReport>, GroupError> {
        let mut reports = Vec::with_capacity(self.peers.len());
        for peer in &self.peers {
            let frame = peer
                .reports
                .lock()
                .await
                .recv()
                .await
                .ok_or(GroupError::Disconnected { rank: peer.rank })?;
            reports.push(expect_report(peer.rank, decode(peer.rank, &frame)?)?);
        }
        Ok(reports)
    }
}

#[async_trait]
impl FollowerLink for LocalFollower {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn receive(&mut self) -> Result<Message, GroupError> {
        let delivery = self
            .commands
            .recv()
            .await
            .ok_or(GroupError::Disconnected { rank: LEADER_RANK })?;

        let message = decode(LEADER_RANK, &delivery.frame)?;
        // The leader may have given up on this broadcast already.
        let _ = delivery.ack.send(Bytes::from(ack_for(&message).encode()));
        Ok(message)
    }

    async fn report(&mut self, report: &RoundReport) -> Result<(), GroupError> {
        let frame = Message::RoundReport(report.clone()).encode();
        self.reports
            .send(Bytes::from(frame))
            .await
            .map_err(|_| GroupError::Disconnected { rank: LEADER_RANK })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_protocol::{Command, GenerationParams};

    #[tokio::test]
    async fn test_broadcast_reaches_every_follower() {
        let (leader, followers) = group(4);
        assert_eq!(leader.world_size(), 4);
        assert_eq!(followers.iter().map(|f| f.rank()).collect::<Vec<_>>(), [1, 2, 3]);

        let command = Message::Command(Command::new(1, GenerationParams::new("Hello", 3, 0.7, 1.0)));

        let receivers: Vec<_> = followers
            .into_iter()
            .map(|mut follower| {
                tokio::spawn(async move {
                    let message = follower.receive().await.unwrap();
                    let report = RoundReport::completed(1, follower.rank(), 3);
                    follower.report(&report).await.unwrap();
                    message
                })
            })
            .collect();

        leader.broadcast(&command).await.unwrap();
        let reports = leader.collect_reports().await.unwrap();
        assert_eq!(reports.iter().map(|r| r.rank).collect::<Vec<_>>(), [1, 2, 3]);

        for receiver in receivers {
            assert_eq!(receiver.await.unwrap(), command);
        }
    }

    #[tokio::test]
    async fn test_single_rank_group_is_trivial() {
        let (leader, followers) = group(1);
        assert!(followers.is_empty());
        leader.broadcast(&Message::Shutdown).await.unwrap();
        assert!(leader.collect_reports().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_follower_fails_broadcast() {
        let (leader, mut followers) = group(3);
        let second = followers.pop().unwrap();
        drop(second);

        let mut first = followers.pop().unwrap();
        tokio::spawn(async move {
            let _ = first.receive().await;
        });

        let result = leader.broadcast(&Message::Shutdown).await;
        assert!(matches!(result, Err(GroupError::Disconnected { rank: 2 })));
    }
}
