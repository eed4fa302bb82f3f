//! TCP process group
//!
//! The leader listens on the master address; every follower connects,
//! announces itself with [`Hello`] and gets the leader's [`Hello`] back.
//! Afterwards the connection carries, per round:
//!
//! ```text
//! leader  ── Command ──▶ follower
//! leader  ◀── Ack ────── follower      (broadcast returns once all acked)
//! leader  ◀── RoundReport ─ follower   (after the follower drained its engine)
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use lockstep_protocol::{Header, Hello, Message, RoundReport, HEADER_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{ack_for, check_ack, expect_report, FollowerLink, LeaderLink, Rank, LEADER_RANK};
use crate::error::GroupError;

/// Delay between connection attempts while the leader is not up yet
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Time a new connection gets to send its hello
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Read one frame from `stream`. `rank` names the peer for error reporting.
pub(crate) async fn read_message<S>(stream: &mut S, rank: Rank) -> Result<Message, GroupError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| map_read_error(e, rank))?;
    let header = Header::decode(&header).map_err(|source| GroupError::Protocol { rank, source })?;

    let mut payload = vec![0u8; header.payload_len as usize];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| map_read_error(e, rank))?;

    Message::decode_payload(&header, &payload).map_err(|source| GroupError::Protocol { rank, source })
}

/// Write one frame to `stream`
pub(crate) async fn write_message<S>(stream: &mut S, message: &Message) -> Result<(), GroupError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&message.encode()).await?;
    stream.flush().await?;
    Ok(())
}

fn map_read_error(error: std::io::Error, rank: Rank) -> GroupError {
    match error.kind() {
        std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe => GroupError::Disconnected { rank },
        _ => GroupError::Io(error),
    }
}

struct TcpPeer {
    rank: Rank,
    stream: TcpStream,
}

/// Leader end of a TCP process group
pub struct TcpLeader {
    world_size: usize,
    peers: Mutex<Vec<TcpPeer>>,
}

impl TcpLeader {
    /// Bind `addr` and wait until all `world_size - 1` followers joined
    pub async fn establish(
        addr: impl ToSocketAddrs,
        world_size: usize,
        join_timeout: Duration,
    ) -> Result<Self, GroupError> {
        let listener = TcpListener::bind(addr).await?;
        Self::accept(listener, world_size, join_timeout).await
    }

    /// Accept followers on an already bound listener.
    ///
    /// Connections that do not complete a valid follower hello within
    /// [`HELLO_TIMEOUT`] are dropped and the leader keeps waiting. A duplicate
    /// rank or a follower with a different world size aborts the join.
    pub async fn accept(
        listener: TcpListener,
        world_size: usize,
        join_timeout: Duration,
    ) -> Result<Self, GroupError> {
        Self::accept_with_hello_timeout(listener, world_size, join_timeout, HELLO_TIMEOUT).await
    }

    async fn accept_with_hello_timeout(
        listener: TcpListener,
        world_size: usize,
        join_timeout: Duration,
        hello_timeout: Duration,
    ) -> Result<Self, GroupError> {
        let world_size = world_size.max(1);
        let expected = world_size - 1;
        let deadline = Instant::now() + join_timeout;

        let mut joined: BTreeMap<Rank, TcpStream> = BTreeMap::new();
        while joined.len() < expected {
            let (mut stream, addr) = tokio::time::timeout_at(deadline, listener.accept())
                .await
                .map_err(|_| GroupError::Timeout {
                    waited: join_timeout,
                    what: "followers to join",
                })??;

            let hello_deadline = deadline.min(Instant::now() + hello_timeout);
            let hello = match tokio::time::timeout_at(hello_deadline, read_hello(&mut stream)).await {
                Ok(Ok(hello)) => hello,
                Ok(Err(e)) => {
                    tracing::warn!(%addr, error = %e, "Dropping connection without a valid hello");
                    continue;
                }
                Err(_) => {
                    tracing::warn!(%addr, "Dropping connection that sent no hello");
                    continue;
                }
            };

            if hello.world_size as usize != world_size {
                return Err(GroupError::Handshake(format!(
                    "rank {} at {addr} expects world size {}, leader runs {world_size}",
                    hello.rank, hello.world_size
                )));
            }
            if hello.rank == LEADER_RANK || hello.rank as usize >= world_size {
                tracing::warn!(
                    %addr,
                    rank = hello.rank,
                    "Dropping connection with a rank outside 1..{world_size}"
                );
                continue;
            }
            if joined.contains_key(&hello.rank) {
                return Err(GroupError::Handshake(format!(
                    "rank {} joined twice (second time from {addr})",
                    hello.rank
                )));
            }

            let reply = Message::Hello(Hello {
                rank: LEADER_RANK,
                world_size: world_size as u32,
            });
            if let Err(e) = write_message(&mut stream, &reply).await {
                tracing::warn!(%addr, rank = hello.rank, error = %e, "Follower left during the handshake");
                continue;
            }

            tracing::info!(
                rank = hello.rank,
                %addr,
                joined = joined.len() + 1,
                expected,
                "Follower joined"
            );
            joined.insert(hello.rank, stream);
        }

        let peers = joined
            .into_iter()
            .map(|(rank, stream)| TcpPeer { rank, stream })
            .collect();

        Ok(Self {
            world_size,
            peers: Mutex::new(peers),
        })
    }
}

/// Read the [`Hello`] a freshly connected follower opens with
async fn read_hello(stream: &mut TcpStream) -> Result<Hello, GroupError> {
    stream.set_nodelay(true)?;
    match read_message(stream, Rank::MAX).await? {
        Message::Hello(hello) => Ok(hello),
        other => Err(GroupError::Unexpected {
            rank: Rank::MAX,
            expected: "hello",
            got: other.msg_type(),
        }),
    }
}

#[async_trait]
impl LeaderLink for TcpLeader {
    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn broadcast(&self, message: &Message) -> Result<(), GroupError> {
        let mut peers = self.peers.lock().await;

        for peer in peers.iter_mut() {
            write_message(&mut peer.stream, message).await?;
        }
        for peer in peers.iter_mut() {
            let reply = read_message(&mut peer.stream, peer.rank).await?;
            check_ack(peer.rank, message, reply)?;
        }

        Ok(())
    }

    async fn collect_reports(&self) -> Result<Vec<RoundReport>, GroupError> {
        let mut peers = self.peers.lock().await;

        let mut reports = Vec::with_capacity(peers.len());
        for peer in peers.iter_mut() {
            let reply = read_message(&mut peer.stream, peer.rank).await?;
            reports.push(expect_report(peer.rank, reply)?);
        }
        Ok(reports)
    }
}

/// Follower end of a TCP process group
pub struct TcpFollower {
    rank: Rank,
    world_size: usize,
    stream: TcpStream,
}

impl TcpFollower {
    /// Connect to the leader at `addr`, retrying until `join_timeout`
    /// elapses, then exchange [`Hello`]s
    pub async fn connect(
        addr: &str,
        rank: Rank,
        world_size: usize,
        join_timeout: Duration,
    ) -> Result<Self, GroupError> {
        let deadline = Instant::now() + join_timeout;

        let mut stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) if Instant::now() + CONNECT_RETRY_INTERVAL < deadline => {
                    tracing::debug!(rank, addr, error = %e, "Leader not reachable yet, retrying");
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(e) => {
                    tracing::error!(rank, addr, error = %e, "Giving up on leader");
                    return Err(GroupError::Timeout {
                        waited: join_timeout,
                        what: "leader to accept the connection",
                    });
                }
            }
        };
        stream.set_nodelay(true)?;

        let hello = Message::Hello(Hello {
            rank,
            world_size: world_size as u32,
        });
        write_message(&mut stream, &hello).await?;

        let reply = tokio::time::timeout_at(deadline, read_message(&mut stream, LEADER_RANK))
            .await
            .map_err(|_| GroupError::Timeout {
                waited: join_timeout,
                what: "leader hello",
            })??;
        match reply {
            Message::Hello(hello) if hello.rank == LEADER_RANK && hello.world_size as usize == world_size => {}
            Message::Hello(hello) => {
                return Err(GroupError::Handshake(format!(
                    "leader answered as rank {} with world size {}, expected rank 0 with world size {world_size}",
                    hello.rank, hello.world_size
                )))
            }
            other => {
                return Err(GroupError::Unexpected {
                    rank: LEADER_RANK,
                    expected: "hello",
                    got: other.msg_type(),
                })
            }
        }

        tracing::info!(rank, world_size, addr, "Joined process group");
        Ok(Self {
            rank,
            world_size,
            stream,
        })
    }
}

#[async_trait]
impl FollowerLink for TcpFollower {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn receive(&mut self) -> Result<Message, GroupError> {
        let message = read_message(&mut self.stream, LEADER_RANK).await?;
        if !message.msg_type().is_broadcast() {
            return Err(GroupError::Unexpected {
                rank: LEADER_RANK,
                expected: "command or shutdown",
                got: message.msg_type(),
            });
        }
        write_message(&mut self.stream, &ack_for(&message)).await?;
        Ok(message)
    }

    async fn report(&mut self, report: &RoundReport) -> Result<(), GroupError> {
        write_message(&mut self.stream, &Message::RoundReport(report.clone())).await
    }
}
