//! Leader-side command dispatch
//!
//! Each client request becomes one round:
//!
//! 1. wait for the round gate (at most one round in flight, group-wide)
//! 2. broadcast the [`Command`] to every follower
//! 3. run the leader's own engine on a blocking thread and hand its events
//!    to the caller through a bounded channel ([`TokenStream`])
//! 4. collect every follower's [`RoundReport`], then release the gate
//!
//! The gate is held until step 4 finishes even when the caller stops
//! reading early, so a new command can never reach a follower that is still
//! busy with the previous one.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use futures::Stream;
use lockstep_protocol::{Command, GenerationParams, Message, ReportStatus, TokenEvent};
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};

use crate::config::DispatchConfig;
use crate::engine::GenerationEngine;
use crate::error::{DispatchError, EngineError, GroupError, Result};
use crate::group::{LeaderLink, Rank};

/// What the round task tells the stream
#[derive(Debug)]
enum RoundSignal {
    Token(TokenEvent),
    Completed,
    Failed(DispatchError),
}

/// Round bookkeeping guarded by the gate
#[derive(Debug, Default)]
struct RoundLedger {
    last_round: u64,
}

#[derive(Debug)]
enum GroupState {
    Healthy,
    Broken(String),
    Closed,
}

/// Round counters
#[derive(Debug, Default)]
struct RoundStats {
    completed: AtomicU64,
    abandoned: AtomicU64,
    last_round: AtomicU64,
}

/// Point-in-time copy of the dispatcher's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub rounds_completed: u64,
    pub rounds_abandoned: u64,
    pub last_round: u64,
}

struct Inner {
    link: Arc<dyn LeaderLink>,
    engine: Arc<dyn GenerationEngine>,
    config: DispatchConfig,
    gate: Arc<Mutex<RoundLedger>>,
    state: RwLock<GroupState>,
    stats: RoundStats,
}

/// Leader-side entry point for generation requests. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        link: Arc<dyn LeaderLink>,
        engine: Arc<dyn GenerationEngine>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                link,
                engine,
                config,
                gate: Arc::new(Mutex::new(RoundLedger::default())),
                state: RwLock::new(GroupState::Healthy),
                stats: RoundStats::default(),
            }),
        }
    }

    pub fn world_size(&self) -> usize {
        self.inner.link.world_size()
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.inner.config
    }

    /// Whether new rounds can be opened
    pub fn is_healthy(&self) -> bool {
        matches!(*self.inner.state.read(), GroupState::Healthy)
    }

    pub fn stats(&self) -> DispatchStats {
        let stats = &self.inner.stats;
        DispatchStats {
            rounds_completed: stats.completed.load(Ordering::Relaxed),
            rounds_abandoned: stats.abandoned.load(Ordering::Relaxed),
            last_round: stats.last_round.load(Ordering::Relaxed),
        }
    }

    /// Open a round for `params` on every rank and stream the leader's output
    pub async fn dispatch(&self, params: GenerationParams) -> Result<TokenStream> {
        let inner = &self.inner;
        inner.check_state()?;
        params
            .validate()
            .map_err(|e| DispatchError::InvalidParams(e.to_string()))?;

        let queue_timeout = inner.config.queue_timeout;
        let mut ledger = tokio::time::timeout(queue_timeout, inner.gate.clone().lock_owned())
            .await
            .map_err(|_| DispatchError::Busy(queue_timeout))?;
        // The previous round may have broken the group while we queued.
        inner.check_state()?;

        let command = Command::new(ledger.last_round + 1, params);
        let round = command.round;

        let broadcast_timeout = inner.config.broadcast_timeout;
        let message = Message::Command(command.clone());
        let broadcast = tokio::time::timeout(broadcast_timeout, inner.link.broadcast(&message)).await;
        let error = match broadcast {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(GroupError::Timeout {
                waited: broadcast_timeout,
                what: "broadcast acknowledgements",
            }),
        };
        if let Some(error) = error {
            inner.mark_broken(format!("broadcast of round {round} failed: {error}"));
            return Err(DispatchError::Broadcast(error));
        }

        ledger.last_round = round;
        inner.stats.last_round.store(round, Ordering::Relaxed);
        tracing::info!(
            round,
            world_size = inner.link.world_size(),
            max_gen_len = command.params.max_gen_len,
            temperature = command.params.temperature,
            top_p = command.params.top_p,
            "Round opened"
        );

        let (tx, rx) = mpsc::channel(inner.config.stream_buffer.max(1));
        tokio::spawn(Arc::clone(inner).run_round(ledger, command, tx));

        Ok(TokenStream {
            round,
            rx,
            finished: false,
        })
    }

    /// Tell every follower to exit once the in-flight round (if any) closed.
    /// Later requests fail with [`DispatchError::GroupUnavailable`].
    pub async fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;
        let _ledger = inner.gate.lock().await;

        if let Err(e) = inner.check_state() {
            tracing::warn!(error = %e, "Skipping follower shutdown");
            return Ok(());
        }

        let broadcast_timeout = inner.config.broadcast_timeout;
        let result = tokio::time::timeout(broadcast_timeout, inner.link.broadcast(&Message::Shutdown)).await;
        *inner.state.write() = GroupState::Closed;

        match result {
            Ok(Ok(())) => {
                tracing::info!(world_size = inner.link.world_size(), "Process group shut down");
                Ok(())
            }
            Ok(Err(e)) => Err(DispatchError::Broadcast(e)),
            Err(_) => Err(DispatchError::Broadcast(GroupError::Timeout {
                waited: broadcast_timeout,
                what: "shutdown acknowledgements",
            })),
        }
    }
}

impl Inner {
    fn check_state(&self) -> Result<()> {
        match &*self.state.read() {
            GroupState::Healthy => Ok(()),
            GroupState::Broken(reason) => Err(DispatchError::GroupUnavailable(reason.clone())),
            GroupState::Closed => Err(DispatchError::GroupUnavailable(
                "process group is shut down".to_string(),
            )),
        }
    }

    fn mark_broken(&self, reason: String) {
        let mut state = self.state.write();
        if matches!(*state, GroupState::Healthy) {
            tracing::error!(%reason, "Process group broken, refusing further rounds");
            *state = GroupState::Broken(reason);
        }
    }

    async fn run_round(
        self: Arc<Self>,
        ledger: OwnedMutexGuard<RoundLedger>,
        command: Command,
        tx: mpsc::Sender<RoundSignal>,
    ) {
        let round = command.round;

        let engine = Arc::clone(&self.engine);
        let local_tx = tx.clone();
        let local = tokio::task::spawn_blocking(move || {
            generate_locally(engine.as_ref(), &command.params, round, &local_tx)
        })
        .await
        .unwrap_or_else(|e| Err(EngineError::Generation(format!("engine task panicked: {e}"))));

        match local {
            Ok(tokens) => match self.close_round(round).await {
                Ok(()) => {
                    self.stats.completed.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(round, tokens, "Round complete");
                    let _ = tx.send(RoundSignal::Completed).await;
                }
                Err(e) => {
                    self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(round, tokens, error = %e, "Round abandoned");
                    let _ = tx.send(RoundSignal::Failed(e)).await;
                }
            },
            Err(e) => {
                self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
                tracing::error!(round, error = %e, "Generation failed on the leader");
                // The client learns about the failure now; the gate stays
                // closed until the followers are accounted for.
                let _ = tx.send(RoundSignal::Failed(DispatchError::Generation(e))).await;
                if let Err(e) = self.close_round(round).await {
                    tracing::warn!(round, error = %e, "Followers did not close the failed round cleanly");
                }
            }
        }

        drop(ledger);
    }

    /// Collect every follower's report for `round`
    async fn close_round(&self, round: u64) -> Result<()> {
        let report_timeout = self.config.report_timeout;
        let reports = match tokio::time::timeout(report_timeout, self.link.collect_reports()).await {
            Ok(Ok(reports)) => reports,
            Ok(Err(e)) => {
                self.mark_broken(format!("collecting reports for round {round} failed: {e}"));
                return Err(DispatchError::Group(e));
            }
            Err(_) => {
                let error = GroupError::Timeout {
                    waited: report_timeout,
                    what: "round reports",
                };
                self.mark_broken(format!("round {round}: {error}"));
                return Err(DispatchError::Group(error));
            }
        };

        let mut failure: Option<(Rank, String)> = None;
        for report in reports {
            if report.round != round {
                let reason = format!("reported round {} while round {round} was open", report.round);
                self.mark_broken(format!("rank {} {reason}", report.rank));
                return Err(DispatchError::Desynchronized {
                    rank: report.rank,
                    reason,
                });
            }

            match report.status {
                ReportStatus::Completed { tokens } => {
                    tracing::debug!(round, rank = report.rank, tokens, "Follower finished round");
                }
                ReportStatus::Failed { reason } => {
                    tracing::warn!(round, rank = report.rank, %reason, "Follower failed round");
                    failure.get_or_insert((report.rank, reason));
                }
                ReportStatus::Rejected { reason } => {
                    self.mark_broken(format!("rank {} rejected round {round}: {reason}", report.rank));
                    return Err(DispatchError::Desynchronized {
                        rank: report.rank,
                        reason,
                    });
                }
            }
        }

        match failure {
            Some((rank, reason)) => Err(DispatchError::RoundAbandoned { round, rank, reason }),
            None => Ok(()),
        }
    }
}

/// Run the leader's engine, forwarding events while someone listens.
///
/// Once the stream is dropped the rest of the sequence is still drained so
/// the followers' half of the computation can finish.
fn generate_locally(
    engine: &dyn GenerationEngine,
    params: &GenerationParams,
    round: u64,
    tx: &mpsc::Sender<RoundSignal>,
) -> std::result::Result<u32, EngineError> {
    let sequence = engine.generate(params)?;

    let mut produced = 0u32;
    let mut delivering = true;
    for item in sequence {
        let event = item?;
        produced += 1;
        if delivering && tx.blocking_send(RoundSignal::Token(event)).is_err() {
            delivering = false;
            tracing::debug!(round, produced, "Stream dropped, draining the rest of the round");
        }
    }

    Ok(produced)
}

/// The leader's token events for one round, in generation order.
///
/// Ends with `None` after a clean round, or with one final `Err` when the
/// round failed anywhere in the group.
#[derive(Debug)]
pub struct TokenStream {
    round: u64,
    rx: mpsc::Receiver<RoundSignal>,
    finished: bool,
}

impl TokenStream {
    pub fn round(&self) -> u64 {
        self.round
    }
}

impl Stream for TokenStream {
    type Item = std::result::Result<TokenEvent, DispatchError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        let item = match ready!(self.rx.poll_recv(cx)) {
            Some(RoundSignal::Token(event)) => return Poll::Ready(Some(Ok(event))),
            Some(RoundSignal::Completed) => None,
            Some(RoundSignal::Failed(e)) => Some(Err(e)),
            None => Some(Err(DispatchError::RoundLost { round: self.round })),
        };
        self.finished = true;
        Poll::Ready(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::StreamExt;
    use lockstep_protocol::RoundReport;

    use crate::follower::FollowerLoop;
    use crate::group::local;
    use crate::group::FollowerLink;
    use crate::testing::{Journal, JournalEntry, ScriptedEngine};

    fn hello_script() -> Vec<(&'static str, f32)> {
        vec![("He", 0.9), ("llo", 0.8), ("!", 0.7)]
    }

    fn fast_config() -> DispatchConfig {
        DispatchConfig {
            broadcast_timeout: Duration::from_millis(200),
            report_timeout: Duration::from_secs(5),
            queue_timeout: Duration::from_secs(5),
            stream_buffer: 4,
        }
    }

    /// Leader dispatcher plus running follower loops over an in-process group
    fn spawn_group(
        world_size: usize,
        engine_for: impl Fn(Rank) -> ScriptedEngine,
    ) -> (Dispatcher, Vec<tokio::task::JoinHandle<Result<()>>>) {
        let (leader, followers) = local::group(world_size);
        let handles = followers
            .into_iter()
            .map(|link| {
                let engine = Arc::new(engine_for(link.rank()));
                tokio::spawn(FollowerLoop::new(link, engine).run())
            })
            .collect();
        let dispatcher = Dispatcher::new(Arc::new(leader), Arc::new(engine_for(0)), fast_config());
        (dispatcher, handles)
    }

    async fn collect(stream: TokenStream) -> Vec<std::result::Result<TokenEvent, DispatchError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_every_rank_runs_identical_params() {
        let journal = Journal::default();
        let (dispatcher, _followers) = spawn_group(4, |rank| {
            ScriptedEngine::new(hello_script()).with_journal(rank, journal.clone())
        });

        let params = GenerationParams::new("Hello", 3, 0.7, 1.0);
        let items = collect(dispatcher.dispatch(params.clone()).await.unwrap()).await;
        assert_eq!(items.len(), 3);

        let started: Vec<_> = journal
            .entries()
            .into_iter()
            .filter_map(|entry| match entry {
                JournalEntry::Started { label, params } => Some((label, params)),
                _ => None,
            })
            .collect();
        assert_eq!(started.len(), 4);
        assert!(started.iter().all(|(_, p)| *p == params));
        let mut ranks: Vec<_> = started.iter().map(|(label, _)| *label).collect();
        ranks.sort_unstable();
        assert_eq!(ranks, [0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_stream_preserves_generation_order() {
        let (dispatcher, _followers) = spawn_group(2, |_| ScriptedEngine::new(hello_script()));

        let stream = dispatcher.dispatch(GenerationParams::new("Hello", 3, 0.7, 1.0)).await.unwrap();
        assert_eq!(stream.round(), 1);

        let events: Vec<TokenEvent> = collect(stream).await.into_iter().map(|r| r.unwrap()).collect();
        let words: Vec<_> = events.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(words, ["He", "llo", "!"]);
        let probabilities: Vec<_> = events.iter().map(|e| e.probability).collect();
        assert_eq!(probabilities, [0.9, 0.8, 0.7]);

        let stats = dispatcher.stats();
        assert_eq!(stats.rounds_completed, 1);
        assert_eq!(stats.last_round, 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_never_interleave() {
        let journal = Journal::default();
        let (dispatcher, _followers) = spawn_group(3, |rank| {
            ScriptedEngine::new(hello_script())
                .with_delay(Duration::from_millis(5))
                .with_journal(rank, journal.clone())
        });

        let first = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                collect(dispatcher.dispatch(GenerationParams::new("first", 3, 0.7, 1.0)).await.unwrap()).await
            })
        };
        let second = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                collect(dispatcher.dispatch(GenerationParams::new("second", 3, 0.7, 1.0)).await.unwrap()).await
            })
        };
        assert_eq!(first.await.unwrap().len(), 3);
        assert_eq!(second.await.unwrap().len(), 3);

        // Per rank: start(A), finish(A), start(B), finish(B) with A != B.
        for rank in 1..3 {
            let entries: Vec<_> = journal
                .entries()
                .into_iter()
                .filter(|entry| entry.label() == rank)
                .collect();
            assert_eq!(entries.len(), 4, "rank {rank}: {entries:?}");
            let prompts: Vec<_> = entries.iter().map(|entry| entry.prompt().to_string()).collect();
            assert!(matches!(entries[0], JournalEntry::Started { .. }));
            assert!(matches!(entries[1], JournalEntry::Finished { .. }));
            assert!(matches!(entries[2], JournalEntry::Started { .. }));
            assert!(matches!(entries[3], JournalEntry::Finished { .. }));
            assert_eq!(prompts[0], prompts[1]);
            assert_eq!(prompts[2], prompts[3]);
            assert_ne!(prompts[0], prompts[2]);
        }
        assert_eq!(dispatcher.stats().last_round, 2);
    }

    #[tokio::test]
    async fn test_dropped_stream_still_completes_round() {
        let journal = Journal::default();
        let script = vec![("a", 0.5), ("b", 0.5), ("c", 0.5), ("d", 0.5), ("e", 0.5)];
        let (dispatcher, _followers) = spawn_group(2, |rank| {
            ScriptedEngine::new(script.clone()).with_journal(rank, journal.clone())
        });

        let mut stream = dispatcher.dispatch(GenerationParams::new("abandon me", 5, 0.7, 1.0)).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().text, "a");
        assert_eq!(stream.next().await.unwrap().unwrap().text, "b");
        drop(stream);

        // The next round waits for the first to close on every rank.
        let items = collect(dispatcher.dispatch(GenerationParams::new("next", 5, 0.7, 1.0)).await.unwrap()).await;
        assert_eq!(items.len(), 5);

        let finished_first = journal
            .entries()
            .into_iter()
            .filter(|entry| matches!(entry, JournalEntry::Finished { prompt, tokens: 5, .. } if prompt == "abandon me"))
            .count();
        assert_eq!(finished_first, 2, "leader and follower both drained round 1");
        assert_eq!(dispatcher.stats().rounds_completed, 2);
    }

    #[tokio::test]
    async fn test_leader_engine_failure_reaches_the_stream() {
        let (dispatcher, _followers) = spawn_group(2, |rank| {
            let engine = ScriptedEngine::new(hello_script());
            if rank == 0 {
                engine.failing_at(1)
            } else {
                engine
            }
        });

        let items = collect(dispatcher.dispatch(GenerationParams::new("Hello", 3, 0.7, 1.0)).await.unwrap()).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().text, "He");
        assert!(matches!(items[1], Err(DispatchError::Generation(_))));

        // The round was closed on every rank; the group keeps serving.
        let items = collect(dispatcher.dispatch(GenerationParams::new("again", 3, 0.7, 1.0)).await.unwrap()).await;
        assert!(matches!(items[1], Err(DispatchError::Generation(_))));
        assert!(dispatcher.is_healthy());
        assert_eq!(dispatcher.stats().rounds_abandoned, 2);
    }

    #[tokio::test]
    async fn test_follower_failure_abandons_round_then_recovers() {
        let (dispatcher, _followers) = spawn_group(3, |rank| {
            let engine = ScriptedEngine::new(hello_script());
            if rank == 2 {
                engine.failing_at(1).only_for_prompt("boom")
            } else {
                engine
            }
        });

        let items = collect(dispatcher.dispatch(GenerationParams::new("boom", 3, 0.7, 1.0)).await.unwrap()).await;
        assert_eq!(items.len(), 4, "three tokens then the abandonment");
        assert!(items[..3].iter().all(|item| item.is_ok()));
        match &items[3] {
            Err(DispatchError::RoundAbandoned { round, rank, .. }) => {
                assert_eq!((*round, *rank), (1, 2));
            }
            other => panic!("expected abandonment, got {other:?}"),
        }

        let stream = dispatcher.dispatch(GenerationParams::new("fine", 3, 0.7, 1.0)).await.unwrap();
        assert_eq!(stream.round(), 2);
        let items = collect(stream).await;
        assert!(items.iter().all(|item| item.is_ok()));
        assert_eq!(items.len(), 3);

        let stats = dispatcher.stats();
        assert_eq!((stats.rounds_completed, stats.rounds_abandoned), (1, 1));
    }

    #[tokio::test]
    async fn test_unresponsive_follower_breaks_group() {
        let (leader, followers) = local::group(2);
        // Keep the follower alive but never let it receive.
        let _idle = followers;
        let dispatcher = Dispatcher::new(
            Arc::new(leader),
            Arc::new(ScriptedEngine::new(hello_script())),
            fast_config(),
        );

        let result = dispatcher.dispatch(GenerationParams::new("Hello", 3, 0.7, 1.0)).await;
        assert!(matches!(
            result,
            Err(DispatchError::Broadcast(GroupError::Timeout { .. }))
        ));
        assert!(!dispatcher.is_healthy());

        let result = dispatcher.dispatch(GenerationParams::new("Hello", 3, 0.7, 1.0)).await;
        assert!(matches!(result, Err(DispatchError::GroupUnavailable(_))));
    }

    #[tokio::test]
    async fn test_rejected_round_breaks_group() {
        let (leader, mut followers) = local::group(2);
        let mut follower = followers.pop().unwrap();
        tokio::spawn(async move {
            let message = follower.receive().await.unwrap();
            let round = message.round().unwrap();
            follower
                .report(&RoundReport::rejected(round, 1, "stale round"))
                .await
                .unwrap();
        });

        let dispatcher = Dispatcher::new(
            Arc::new(leader),
            Arc::new(ScriptedEngine::new(hello_script())),
            fast_config(),
        );
        let items = collect(dispatcher.dispatch(GenerationParams::new("x", 3, 0.7, 1.0)).await.unwrap()).await;
        assert!(matches!(
            items.last(),
            Some(Err(DispatchError::Desynchronized { rank: 1, .. }))
        ));
        assert!(!dispatcher.is_healthy());
    }

    #[tokio::test]
    async fn test_invalid_params_open_no_round() {
        let (dispatcher, _followers) = spawn_group(2, |_| ScriptedEngine::new(hello_script()));
        let result = dispatcher.dispatch(GenerationParams::new("x", 0, 0.7, 1.0)).await;
        assert!(matches!(result, Err(DispatchError::InvalidParams(_))));
        assert_eq!(dispatcher.stats().last_round, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_followers() {
        let (dispatcher, followers) = spawn_group(3, |_| ScriptedEngine::new(hello_script()));
        collect(dispatcher.dispatch(GenerationParams::new("one", 3, 0.7, 1.0)).await.unwrap()).await;

        dispatcher.shutdown().await.unwrap();
        for follower in followers {
            follower.await.unwrap().unwrap();
        }
        assert!(matches!(
            dispatcher.dispatch(GenerationParams::new("late", 3, 0.7, 1.0)).await,
            Err(DispatchError::GroupUnavailable(_))
        ));
    }
}
