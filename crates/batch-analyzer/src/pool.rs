//! Worker pool: one engine session per worker, games fanned out over a
//! shared queue, results fanned back in over a channel.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::analyzer::{analyze_game, AnalysisLimits};
use crate::engine::{EngineLauncher, Evaluator};
use crate::error::WorkerError;
use crate::models::{EngineSettings, GameResult, StoredGame};

/// Everything a worker needs besides its engine
#[derive(Debug, Clone)]
pub struct PoolContext {
    pub owner: String,
    pub settings: EngineSettings,
    pub limits: AnalysisLimits,
    /// Worker count override; defaults to available CPUs
    pub workers: Option<usize>,
    pub job_deadline: Instant,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub results: Vec<GameResult>,
    pub total_games: usize,
    pub failed_games: Vec<i64>,
    /// Games never taken off the work queue
    pub untried_games: usize,
    pub workers_started: usize,
}

enum GameReport {
    Analyzed(GameResult),
    Failed(i64),
}

type WorkQueue = Arc<Mutex<mpsc::Receiver<StoredGame>>>;

/// Analyze a batch of games in parallel. Every game shows up at most once
/// in the outcome; failures are contained per game and per worker.
pub async fn run_batch<L: EngineLauncher>(
    launcher: Arc<L>,
    games: Vec<StoredGame>,
    ctx: Arc<PoolContext>,
) -> Result<BatchOutcome, WorkerError> {
    let total_games = games.len();
    if total_games == 0 {
        return Ok(BatchOutcome::default());
    }

    let (work_tx, work_rx) = mpsc::channel(total_games);
    for game in games {
        // Sized to the batch, so this never waits.
        if work_tx.send(game).await.is_err() {
            break;
        }
    }
    drop(work_tx);
    let work: WorkQueue = Arc::new(Mutex::new(work_rx));

    let (results_tx, mut results_rx) = mpsc::channel(total_games);
    let worker_count = ctx
        .workers
        .unwrap_or_else(num_cpus::get)
        .max(1)
        .min(total_games);
    info!(total_games, worker_count, "Starting batch workers");

    let mut workers = JoinSet::new();
    for worker_id in 0..worker_count {
        workers.spawn(run_worker(
            worker_id,
            launcher.clone(),
            work.clone(),
            results_tx.clone(),
            ctx.clone(),
        ));
    }

    // Results close only after every worker has finished.
    let supervisor = async move {
        let mut started = 0;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => error!(error = %e, "Worker task failed"),
            }
        }
        drop(results_tx);
        started
    };

    let collector = async {
        let mut results = Vec::with_capacity(total_games);
        let mut failed = Vec::new();
        while let Some(report) = results_rx.recv().await {
            match report {
                GameReport::Analyzed(result) => results.push(result),
                GameReport::Failed(game_id) => failed.push(game_id),
            }
        }
        (results, failed)
    };

    let (workers_started, (results, failed_games)) = tokio::join!(supervisor, collector);
    if workers_started == 0 {
        return Err(WorkerError::NoEngines);
    }

    let untried_games = total_games - results.len() - failed_games.len();
    Ok(BatchOutcome {
        results,
        total_games,
        failed_games,
        untried_games,
        workers_started,
    })
}

/// Returns whether the worker's engine started.
async fn run_worker<L: EngineLauncher>(
    worker_id: usize,
    launcher: Arc<L>,
    work: WorkQueue,
    results: mpsc::Sender<GameReport>,
    ctx: Arc<PoolContext>,
) -> bool {
    let mut session = match launcher.open().await {
        Ok(session) => session,
        Err(e) => {
            error!(worker_id, error = %e, "Engine failed to start");
            return false;
        }
    };

    let mut analyzed = 0usize;
    loop {
        let next = work.lock().await.recv().await;
        let Some(game) = next else {
            break;
        };
        let game_id = game.id;

        let outcome = analyze_game(
            &mut session,
            &game,
            &ctx.owner,
            &ctx.settings,
            &ctx.limits,
            ctx.job_deadline,
        )
        .await;

        let deadline_hit = matches!(outcome, Err(WorkerError::DeadlineExceeded));
        let report = match outcome {
            Ok(records) => {
                analyzed += 1;
                GameReport::Analyzed(GameResult { game_id, records })
            }
            Err(e) => {
                warn!(worker_id, game_id, error = %e, "Game analysis failed");
                GameReport::Failed(game_id)
            }
        };
        if results.send(report).await.is_err() {
            break;
        }

        if deadline_hit {
            warn!(worker_id, "Job deadline passed, worker stopping");
            break;
        }
        if !session.is_usable() {
            warn!(worker_id, "Engine session unusable, worker stopping");
            break;
        }
    }

    session.close().await;
    info!(worker_id, analyzed, "Worker finished");
    true
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::testing::{game, ScriptedLauncher, SHORT_GAME};

    fn context(workers: usize) -> Arc<PoolContext> {
        Arc::new(PoolContext {
            owner: "alice".into(),
            settings: EngineSettings::default(),
            limits: AnalysisLimits::default(),
            workers: Some(workers),
            job_deadline: Instant::now() + Duration::from_secs(30),
        })
    }

    fn batch(n: i64) -> Vec<StoredGame> {
        (1..=n).map(|id| game(id, SHORT_GAME)).collect()
    }

    #[tokio::test]
    async fn test_every_game_exactly_once() {
        let launcher = Arc::new(ScriptedLauncher::new(20));
        let outcome = run_batch(launcher.clone(), batch(9), context(3)).await.unwrap();

        assert_eq!(outcome.total_games, 9);
        assert_eq!(outcome.workers_started, 3);
        assert_eq!(outcome.untried_games, 0);
        assert!(outcome.failed_games.is_empty());

        let ids: HashSet<i64> = outcome.results.iter().map(|r| r.game_id).collect();
        assert_eq!(outcome.results.len(), 9);
        assert_eq!(ids, (1..=9).collect());
        assert!(outcome.results.iter().all(|r| r.records.len() == 6));

        assert_eq!(launcher.closed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_workers_capped_at_game_count() {
        let launcher = Arc::new(ScriptedLauncher::new(0));
        let outcome = run_batch(launcher.clone(), batch(2), context(8)).await.unwrap();
        assert_eq!(outcome.workers_started, 2);
        assert_eq!(launcher.attempts(), 2);
    }

    #[tokio::test]
    async fn test_startup_failures_degrade_capacity() {
        let mut launcher = ScriptedLauncher::new(0);
        launcher.failing_opens = 2;
        let outcome = run_batch(Arc::new(launcher), batch(6), context(3)).await.unwrap();

        assert_eq!(outcome.workers_started, 1);
        assert_eq!(outcome.results.len(), 6);
        assert_eq!(outcome.untried_games, 0);
    }

    #[tokio::test]
    async fn test_no_engines() {
        let mut launcher = ScriptedLauncher::new(0);
        launcher.failing_opens = 4;
        let result = run_batch(Arc::new(launcher), batch(4), context(4)).await;
        assert!(matches!(result, Err(WorkerError::NoEngines)));
    }

    #[tokio::test]
    async fn test_malformed_game_is_omitted() {
        let mut games = batch(3);
        games[1].pgn = "1. e4 e5 2. Ke3".into();
        let outcome = run_batch(Arc::new(ScriptedLauncher::new(0)), games, context(2))
            .await
            .unwrap();

        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.failed_games, vec![2]);
        assert!(outcome.results.iter().all(|r| r.game_id != 2));
    }

    #[tokio::test]
    async fn test_broken_session_leaves_work_to_healthy_workers() {
        let mut launcher = ScriptedLauncher::new(0);
        launcher.break_first_after = Some(3);
        // Slow enough that both workers are busy before the first breaks.
        launcher.delay = Duration::from_millis(5);
        let outcome = run_batch(Arc::new(launcher), batch(6), context(2)).await.unwrap();

        assert_eq!(outcome.workers_started, 2);
        assert_eq!(outcome.failed_games.len(), 1);
        assert_eq!(outcome.results.len(), 5);
        assert_eq!(outcome.untried_games, 0);
    }

    #[tokio::test]
    async fn test_deadline_leaves_games_untried() {
        let mut launcher = ScriptedLauncher::new(0);
        launcher.delay = Duration::from_millis(20);
        let ctx = Arc::new(PoolContext {
            job_deadline: Instant::now() + Duration::from_millis(50),
            ..(*context(1)).clone()
        });
        let outcome = run_batch(Arc::new(launcher), batch(5), ctx).await.unwrap();

        assert!(!outcome.failed_games.is_empty());
        assert!(outcome.untried_games > 0);
        assert_eq!(
            outcome.results.len() + outcome.failed_games.len() + outcome.untried_games,
            5
        );
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let outcome = run_batch(Arc::new(ScriptedLauncher::new(0)), Vec::new(), context(2))
            .await
            .unwrap();
        assert_eq!(outcome.total_games, 0);
        assert_eq!(outcome.workers_started, 0);
    }
}
