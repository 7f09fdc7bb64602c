//! Scripted engine doubles for unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::engine::{EngineLauncher, Evaluator};
use crate::error::WorkerError;
use crate::models::{EngineSettings, Evaluation, Score, StoredGame};

/// Answers every position with the same centipawn score.
pub(crate) struct ScriptedEvaluator {
    pub score: i32,
    pub delay: Duration,
    /// Evaluations served before the session dies
    pub break_after: Option<usize>,
    pub resets: usize,
    pub evaluated: Vec<String>,
    usable: bool,
    closed: Arc<AtomicUsize>,
}

impl ScriptedEvaluator {
    pub fn new(score: i32) -> Self {
        Self {
            score,
            delay: Duration::ZERO,
            break_after: None,
            resets: 0,
            evaluated: Vec::new(),
            usable: true,
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Evaluator for ScriptedEvaluator {
    async fn reset(&mut self) -> Result<(), WorkerError> {
        if !self.usable {
            return Err(WorkerError::EngineNotReady);
        }
        self.resets += 1;
        Ok(())
    }

    async fn evaluate(
        &mut self,
        fen: &str,
        _settings: &EngineSettings,
        deadline: Instant,
    ) -> Result<Evaluation, WorkerError> {
        if !self.usable {
            return Err(WorkerError::EngineNotReady);
        }
        if self.break_after == Some(self.evaluated.len()) {
            self.usable = false;
            return Err(WorkerError::Engine("engine output closed".into()));
        }
        if !self.delay.is_zero() {
            let finish = Instant::now() + self.delay;
            tokio::time::sleep_until(finish.min(deadline)).await;
            if finish > deadline {
                self.evaluated.push(fen.to_string());
                return Ok(Evaluation::default());
            }
        }
        self.evaluated.push(fen.to_string());
        Ok(Evaluation {
            score: Some(Score::Centipawns(self.score)),
            best_move: Some("e2e4".into()),
        })
    }

    async fn close(&mut self) {
        self.usable = false;
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn is_usable(&self) -> bool {
        self.usable
    }
}

/// Hands out scripted sessions; the first `failing_opens` attempts fail.
pub(crate) struct ScriptedLauncher {
    pub score: i32,
    pub delay: Duration,
    pub failing_opens: usize,
    /// Applied to the first session that opens successfully
    pub break_first_after: Option<usize>,
    attempts: AtomicUsize,
    pub closed: Arc<AtomicUsize>,
}

impl ScriptedLauncher {
    pub fn new(score: i32) -> Self {
        Self {
            score,
            delay: Duration::ZERO,
            failing_opens: 0,
            break_first_after: None,
            attempts: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl EngineLauncher for ScriptedLauncher {
    type Session = ScriptedEvaluator;

    async fn open(&self) -> Result<ScriptedEvaluator, WorkerError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failing_opens {
            return Err(WorkerError::EngineStartup("No such file or directory".into()));
        }
        let mut session = ScriptedEvaluator::new(self.score);
        session.delay = self.delay;
        session.closed = self.closed.clone();
        if attempt == self.failing_opens {
            session.break_after = self.break_first_after;
        }
        Ok(session)
    }
}

pub(crate) fn game(id: i64, pgn: &str) -> StoredGame {
    StoredGame {
        id,
        url: format!("https://www.chess.com/game/live/{id}"),
        played_at: 1_700_000_000 - id,
        color: "white".into(),
        opponent: "rival".into(),
        pgn: pgn.into(),
    }
}

pub(crate) const SHORT_GAME: &str = "1. e4 e5 2. Nf3 Nc6 3. Bb5 a6 *";
