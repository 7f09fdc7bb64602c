#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use batch_analyzer::analyzer::AnalysisLimits;
use batch_analyzer::db::AnalysisStore;
use batch_analyzer::engine::{EngineCommand, EngineTimeouts, ProcessLauncher};
use batch_analyzer::models::{EngineSettings, JobProgress, JobStatus, MoveRecord, StoredGame};
use batch_analyzer::sqs::{JobQueue, QueueMessage};
use batch_analyzer::{PipelineSettings, WorkerError};

pub const SHORT_GAME: &str = "1. e4 e5 2. Nf3 Nc6 3. Bb5 a6 *";

/// Generate a unique suffix based on timestamp to avoid collisions.
pub fn unique_suffix() -> String {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("{}", ts % 1_000_000_000)
}

/// How the shell-scripted engine answers `go`.
#[derive(Clone, Copy, Debug)]
pub enum FakeEngine {
    /// `score cp 20` then `bestmove e2e4` straight away
    Instant,
    /// `score cp 20`, then `bestmove` one second later
    Slow,
    /// Like `Instant`, after a 30ms think
    Paced,
    /// Exits as soon as a search starts
    CrashOnGo,
}

/// Write a POSIX shell UCI engine to the temp dir and return its path.
pub fn write_fake_engine(kind: FakeEngine) -> PathBuf {
    let on_go = match kind {
        FakeEngine::Instant => r#"echo "info depth 1 score cp 20 pv e2e4"; echo "bestmove e2e4""#,
        FakeEngine::Slow => {
            r#"echo "info depth 1 score cp 20 pv e2e4"; sleep 1; echo "bestmove e2e4""#
        }
        FakeEngine::Paced => {
            r#"sleep 0.03; echo "info depth 1 score cp 20 pv e2e4"; echo "bestmove e2e4""#
        }
        FakeEngine::CrashOnGo => "exit 3",
    };
    let script = format!(
        r#"#!/bin/sh
while IFS= read -r line; do
  case "$line" in
    uci) echo "id name FakeFish"; echo "uciok" ;;
    isready) echo "readyok" ;;
    go*) {on_go} ;;
    quit) exit 0 ;;
  esac
done
"#
    );

    let path = std::env::temp_dir().join(format!("fake_uci_{kind:?}_{}.sh", unique_suffix()));
    std::fs::write(&path, script).unwrap();
    path
}

pub fn fake_command(kind: FakeEngine) -> EngineCommand {
    EngineCommand {
        program: "sh".into(),
        args: vec![write_fake_engine(kind).to_string_lossy().into_owned()],
    }
}

pub fn test_timeouts() -> EngineTimeouts {
    EngineTimeouts {
        startup: Duration::from_secs(5),
        ready: Duration::from_secs(5),
        stop_grace: Duration::from_secs(2),
    }
}

pub fn fake_launcher(kind: FakeEngine) -> Arc<ProcessLauncher> {
    Arc::new(ProcessLauncher {
        command: fake_command(kind),
        timeouts: test_timeouts(),
    })
}

pub fn pipeline_settings() -> PipelineSettings {
    PipelineSettings {
        workers: Some(2),
        limits: AnalysisLimits {
            move_limit: 40,
            position_timeout: Duration::from_secs(2),
        },
        job_timeout: Duration::from_secs(60),
        teardown_grace: Duration::from_secs(10),
        visibility_timeout: Duration::from_secs(90),
        max_messages: 5,
        wait_time: Duration::from_millis(10),
        max_empty_receives: 1,
    }
}

pub fn game(id: i64, pgn: &str) -> StoredGame {
    StoredGame {
        id,
        url: format!("https://www.chess.com/game/live/{id}"),
        played_at: 1_700_000_000 + id,
        color: "white".into(),
        opponent: "rival".into(),
        pgn: pgn.into(),
    }
}

pub fn job_body(owner: &str, batch_index: u32, num_games: u32, job_id: Option<&str>) -> String {
    serde_json::json!({
        "owner": owner,
        "batch_index": batch_index,
        "num_games": num_games,
        "job_id": job_id,
        "engine_depth": 0,
        "engine_move_time_ms": 0,
        "engine_use_depth": false,
    })
    .to_string()
}

// ---------------------------------------------------------------------------
// In-memory storage
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreState {
    games: Vec<(String, StoredGame)>,
    moves: HashMap<(i64, u32), MoveRecord>,
    jobs: HashMap<String, (u32, u32, JobStatus)>,
    counted_batches: HashSet<(String, u32)>,
    failing_writes: usize,
}

/// Same idempotency contract as the Postgres store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn add_game(&self, owner: &str, game: StoredGame) {
        self.state.lock().unwrap().games.push((owner.to_string(), game));
    }

    pub fn add_job(&self, job_id: &str, total_batches: u32) {
        self.state
            .lock()
            .unwrap()
            .jobs
            .insert(job_id.to_string(), (0, total_batches, JobStatus::Pending));
    }

    /// Make the next `n` move-record writes fail.
    pub fn fail_next_writes(&self, n: usize) {
        self.state.lock().unwrap().failing_writes = n;
    }

    pub fn move_count(&self) -> usize {
        self.state.lock().unwrap().moves.len()
    }

    pub fn moves_for(&self, game_id: i64) -> Vec<MoveRecord> {
        let state = self.state.lock().unwrap();
        let mut moves: Vec<MoveRecord> = state
            .moves
            .iter()
            .filter(|((id, _), _)| *id == game_id)
            .map(|(_, record)| record.clone())
            .collect();
        moves.sort_by_key(|r| r.ply);
        moves
    }

    pub fn job(&self, job_id: &str) -> Option<(u32, u32, JobStatus)> {
        self.state.lock().unwrap().jobs.get(job_id).copied()
    }
}

impl AnalysisStore for MemoryStore {
    async fn load_games(
        &self,
        owner: &str,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<StoredGame>, WorkerError> {
        let state = self.state.lock().unwrap();
        let mut games: Vec<StoredGame> = state
            .games
            .iter()
            .filter(|(o, _)| o == owner)
            .map(|(_, g)| g.clone())
            .collect();
        games.sort_by(|a, b| b.played_at.cmp(&a.played_at).then(b.id.cmp(&a.id)));
        Ok(games
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn upsert_move_records(
        &self,
        game_id: i64,
        records: &[MoveRecord],
        _settings: &EngineSettings,
    ) -> Result<(), WorkerError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(WorkerError::Storage(sqlx::Error::PoolTimedOut));
        }
        for record in records {
            state
                .moves
                .entry((game_id, record.ply))
                .or_insert_with(|| record.clone());
        }
        Ok(())
    }

    async fn upsert_job_progress(
        &self,
        job_id: &str,
        batch_index: u32,
    ) -> Result<Option<JobProgress>, WorkerError> {
        let mut state = self.state.lock().unwrap();
        let Some(&(completed, total, status)) = state.jobs.get(job_id) else {
            return Ok(None);
        };

        let counted = state.counted_batches.insert((job_id.to_string(), batch_index));
        let (completed, status) = if counted {
            let completed = (completed + 1).min(total);
            let status = if completed >= total {
                JobStatus::Completed
            } else {
                JobStatus::Running
            };
            (completed, status)
        } else {
            (completed, status)
        };
        state.jobs.insert(job_id.to_string(), (completed, total, status));

        Ok(Some(JobProgress {
            completed_batches: completed,
            total_batches: total,
            status,
            counted,
        }))
    }
}

// ---------------------------------------------------------------------------
// In-memory queue
// ---------------------------------------------------------------------------

#[derive(Default)]
struct QueueState {
    pending: VecDeque<String>,
    /// receipt -> (body, visible again at)
    in_flight: HashMap<String, (String, Option<Instant>)>,
    visibility: Option<Duration>,
    deleted: usize,
    late_deletes: usize,
    renewals: Vec<Duration>,
    next_receipt: u64,
    failing_deletes: usize,
    failing_renewals: usize,
}

/// At-least-once queue: received messages stay in flight until deleted or
/// redelivered.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    state: Arc<Mutex<QueueState>>,
}

impl MemoryQueue {
    /// A queue whose received messages become visible again after
    /// `visibility` unless renewed.
    pub fn with_visibility(visibility: Duration) -> Self {
        let queue = Self::default();
        queue.state.lock().unwrap().visibility = Some(visibility);
        queue
    }

    pub fn push(&self, body: impl Into<String>) {
        self.state.lock().unwrap().pending.push_back(body.into());
    }

    /// Return every in-flight message to the queue, as if its visibility
    /// window had lapsed.
    pub fn redeliver(&self) {
        let mut state = self.state.lock().unwrap();
        let bodies: Vec<String> = state.in_flight.drain().map(|(_, (body, _))| body).collect();
        state.pending.extend(bodies);
    }

    pub fn fail_next_deletes(&self, n: usize) {
        self.state.lock().unwrap().failing_deletes = n;
    }

    pub fn fail_next_renewals(&self, n: usize) {
        self.state.lock().unwrap().failing_renewals = n;
    }

    pub fn deleted(&self) -> usize {
        self.state.lock().unwrap().deleted
    }

    /// Deletes that arrived after the message's window had lapsed.
    pub fn late_deletes(&self) -> usize {
        self.state.lock().unwrap().late_deletes
    }

    pub fn renewals(&self) -> Vec<Duration> {
        self.state.lock().unwrap().renewals.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().in_flight.len()
    }
}

impl JobQueue for MemoryQueue {
    async fn receive(
        &self,
        max_messages: i32,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, WorkerError> {
        let messages: Vec<QueueMessage> = {
            let mut state = self.state.lock().unwrap();
            let visible_at = state.visibility.map(|v| Instant::now() + v);
            let mut out = Vec::new();
            while out.len() < max_messages as usize {
                let Some(body) = state.pending.pop_front() else {
                    break;
                };
                state.next_receipt += 1;
                let receipt = format!("receipt-{}", state.next_receipt);
                state
                    .in_flight
                    .insert(receipt.clone(), (body.clone(), visible_at));
                out.push(QueueMessage {
                    body,
                    receipt_handle: receipt,
                });
            }
            out
        };
        if messages.is_empty() {
            tokio::time::sleep(wait).await;
        }
        Ok(messages)
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), WorkerError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_deletes > 0 {
            state.failing_deletes -= 1;
            return Err(WorkerError::Sqs("Failed to delete message: timed out".into()));
        }
        let (_, visible_at) = state
            .in_flight
            .remove(receipt_handle)
            .ok_or_else(|| WorkerError::Sqs(format!("unknown receipt handle {receipt_handle}")))?;
        if visible_at.is_some_and(|at| Instant::now() > at) {
            state.late_deletes += 1;
        }
        state.deleted += 1;
        Ok(())
    }

    async fn extend_visibility(
        &self,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<(), WorkerError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_renewals > 0 {
            state.failing_renewals -= 1;
            return Err(WorkerError::Sqs("Failed to extend visibility: throttled".into()));
        }
        let entry = state
            .in_flight
            .get_mut(receipt_handle)
            .ok_or_else(|| WorkerError::Sqs(format!("unknown receipt handle {receipt_handle}")))?;
        entry.1 = Some(Instant::now() + timeout);
        state.renewals.push(timeout);
        Ok(())
    }
}
