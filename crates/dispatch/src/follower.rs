//! Follower-side command loop
//!
//! A follower owns no client connections. It waits for the leader's next
//! broadcast, runs the same generation the leader runs, discards the tokens
//! and reports back, forever, until it is told to shut down.

use std::sync::Arc;

use lockstep_protocol::{Command, GenerationParams, Message, RoundReport};

use crate::engine::GenerationEngine;
use crate::error::{DispatchError, EngineError, GroupError, Result};
use crate::group::{FollowerLink, LEADER_RANK};

pub struct FollowerLoop<L> {
    link: L,
    engine: Arc<dyn GenerationEngine>,
    last_round: u64,
}

impl<L: FollowerLink> FollowerLoop<L> {
    pub fn new(link: L, engine: Arc<dyn GenerationEngine>) -> Self {
        Self {
            link,
            engine,
            last_round: 0,
        }
    }

    /// Last round this rank accepted
    pub fn last_round(&self) -> u64 {
        self.last_round
    }

    /// Serve commands until the leader broadcasts a shutdown.
    ///
    /// Generation failures are reported and the loop keeps going; only a
    /// broken link ends it with an error.
    pub async fn run(mut self) -> Result<()> {
        let rank = self.link.rank();
        tracing::info!(rank, world_size = self.link.world_size(), "Follower waiting for commands");

        loop {
            match self.link.receive().await? {
                Message::Command(command) => {
                    let report = self.execute(command).await;
                    self.link.report(&report).await?;
                }
                Message::Shutdown => {
                    tracing::info!(rank, last_round = self.last_round, "Shutdown received");
                    return Ok(());
                }
                other => {
                    return Err(DispatchError::Group(GroupError::Unexpected {
                        rank: LEADER_RANK,
                        expected: "command or shutdown",
                        got: other.msg_type(),
                    }));
                }
            }
        }
    }

    async fn execute(&mut self, command: Command) -> RoundReport {
        let rank = self.link.rank();
        let round = command.round;

        if round <= self.last_round {
            tracing::error!(rank, round, last_round = self.last_round, "Stale command rejected");
            return RoundReport::rejected(
                round,
                rank,
                format!("round {round} is not newer than round {}", self.last_round),
            );
        }
        if round != self.last_round + 1 {
            tracing::warn!(
                rank,
                round,
                last_round = self.last_round,
                "Rounds skipped, executing anyway"
            );
        }
        self.last_round = round;

        tracing::debug!(rank, round, "Executing round");
        let engine = Arc::clone(&self.engine);
        let params = command.params.clone();
        let outcome = tokio::task::spawn_blocking(move || drain(engine.as_ref(), &params))
            .await
            .unwrap_or_else(|e| Err(EngineError::Generation(format!("engine task panicked: {e}"))));
        let params = command.params;

        match outcome {
            Ok(tokens) => {
                tracing::debug!(rank, round, tokens, "Round finished");
                RoundReport::completed(round, rank, tokens)
            }
            Err(e) => {
                tracing::error!(
                    rank,
                    round,
                    prompt = %params.prompt,
                    max_gen_len = params.max_gen_len,
                    temperature = params.temperature,
                    top_p = params.top_p,
                    error = %e,
                    "Generation failed"
                );
                RoundReport::failed(round, rank, e.to_string())
            }
        }
    }
}

/// Run the engine to the end, discarding the tokens
fn drain(engine: &dyn GenerationEngine, params: &GenerationParams) -> std::result::Result<u32, EngineError> {
    engine.generate(params)?.try_fold(0u32, |count, item| item.map(|_| count + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_protocol::ReportStatus;

    use crate::group::{local, LeaderLink};
    use crate::testing::ScriptedEngine;

    fn command(round: u64, prompt: &str) -> Message {
        Message::Command(Command::new(round, GenerationParams::new(prompt, 4, 0.7, 1.0)))
    }

    async fn round_trip(leader: &local::LocalLeader, message: Message) -> ReportStatus {
        leader.broadcast(&message).await.unwrap();
        let mut reports = leader.collect_reports().await.unwrap();
        assert_eq!(reports.len(), 1);
        reports.remove(0).status
    }

    fn spawn_follower(engine: ScriptedEngine) -> (local::LocalLeader, tokio::task::JoinHandle<Result<()>>) {
        let (leader, mut followers) = local::group(2);
        let link = followers.remove(0);
        let handle = tokio::spawn(FollowerLoop::new(link, Arc::new(engine)).run());
        (leader, handle)
    }

    #[tokio::test]
    async fn test_follower_completes_rounds_and_exits() {
        let (leader, handle) = spawn_follower(ScriptedEngine::new(vec![("a", 0.5), ("b", 0.5)]));

        assert_eq!(
            round_trip(&leader, command(1, "p")).await,
            ReportStatus::Completed { tokens: 2 }
        );
        assert_eq!(
            round_trip(&leader, command(2, "p")).await,
            ReportStatus::Completed { tokens: 2 }
        );

        leader.broadcast(&Message::Shutdown).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stale_round_is_rejected_without_running() {
        let journal = crate::testing::Journal::default();
        let (leader, _handle) =
            spawn_follower(ScriptedEngine::new(vec![("a", 0.5)]).with_journal(1, journal.clone()));

        round_trip(&leader, command(3, "first")).await;
        let status = round_trip(&leader, command(3, "again")).await;
        assert!(matches!(status, ReportStatus::Rejected { .. }));
        let status = round_trip(&leader, command(2, "older")).await;
        assert!(matches!(status, ReportStatus::Rejected { .. }));

        assert!(journal.entries().iter().all(|entry| entry.prompt() == "first"));
    }

    #[tokio::test]
    async fn test_round_gap_still_executes() {
        let (leader, _handle) = spawn_follower(ScriptedEngine::new(vec![("a", 0.5)]));
        round_trip(&leader, command(1, "p")).await;
        assert_eq!(
            round_trip(&leader, command(5, "p")).await,
            ReportStatus::Completed { tokens: 1 }
        );
    }

    #[tokio::test]
    async fn test_generation_failure_is_reported_and_loop_survives() {
        let engine = ScriptedEngine::new(vec![("a", 0.5), ("b", 0.5)])
            .failing_at(1)
            .only_for_prompt("bad");
        let (leader, _handle) = spawn_follower(engine);

        match round_trip(&leader, command(1, "bad")).await {
            ReportStatus::Failed { reason } => assert!(reason.contains("scripted failure"), "{reason}"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(
            round_trip(&leader, command(2, "good")).await,
            ReportStatus::Completed { tokens: 2 }
        );
    }

    #[tokio::test]
    async fn test_leader_loss_ends_loop_with_error() {
        let (leader, handle) = spawn_follower(ScriptedEngine::new(vec![("a", 0.5)]));
        drop(leader);
        assert!(matches!(
            handle.await.unwrap(),
            Err(DispatchError::Group(GroupError::Disconnected { rank: LEADER_RANK }))
        ));
    }
}
