//! Data carried through the pipeline: queue payloads, engine evaluations,
//! per-move records and job progress.

use std::fmt;
use std::str::FromStr;

use chess_core::{Color, PositionSnapshot};
use serde::{Deserialize, Serialize};

use crate::analysis::Classification;
use crate::error::WorkerError;

/// Depth used when a job asks for depth-bounded search without a depth.
pub const DEFAULT_DEPTH: u32 = 12;

/// Move time used when a job asks for time-bounded search without a budget.
pub const DEFAULT_MOVE_TIME_MS: u32 = 75;

/// Engine score, relative to the side to move of the evaluated position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Score {
    Centipawns(i32),
    /// Mate in N; positive means the side to move mates.
    Mate(i32),
}

/// Result of a single position evaluation. Both fields empty is valid: it is
/// what a search cut off before reporting anything looks like.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evaluation {
    pub score: Option<Score>,
    /// Best reply in UCI notation
    pub best_move: Option<String>,
}

impl Evaluation {
    pub fn centipawns(&self) -> Option<i32> {
        match self.score {
            Some(Score::Centipawns(cp)) => Some(cp),
            _ => None,
        }
    }

    pub fn mate(&self) -> Option<i32> {
        match self.score {
            Some(Score::Mate(n)) => Some(n),
            _ => None,
        }
    }
}

/// Search bounds requested by a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub depth: u32,
    pub move_time_ms: u32,
    pub use_depth: bool,
}

impl EngineSettings {
    /// The UCI `go` command for these bounds.
    pub fn go_command(&self) -> String {
        if self.use_depth {
            let depth = if self.depth == 0 { DEFAULT_DEPTH } else { self.depth };
            format!("go depth {depth}")
        } else {
            let ms = if self.move_time_ms == 0 { DEFAULT_MOVE_TIME_MS } else { self.move_time_ms };
            format!("go movetime {ms}")
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            depth: DEFAULT_DEPTH,
            move_time_ms: DEFAULT_MOVE_TIME_MS,
            use_depth: false,
        }
    }
}

/// A stored game as loaded for analysis
#[derive(Debug, Clone)]
pub struct StoredGame {
    pub id: i64,
    pub url: String,
    pub played_at: i64,
    /// Owner's color: "white" or "black"
    pub color: String,
    pub opponent: String,
    pub pgn: String,
}

impl StoredGame {
    pub fn owner_side(&self) -> Option<Color> {
        match self.color.to_ascii_lowercase().as_str() {
            "white" | "w" => Some(Color::White),
            "black" | "b" => Some(Color::Black),
            _ => None,
        }
    }
}

/// Per-half-move analysis output. Built once, never recomputed.
#[derive(Debug, Clone)]
pub struct MoveRecord {
    /// 1-based half-move index
    pub ply: u32,
    pub move_number: u32,
    /// Side that played this move
    pub side_to_move: Color,
    pub move_uci: String,
    pub move_san: String,
    pub played_by: String,
    pub position_before: PositionSnapshot,
    pub position_after: Option<PositionSnapshot>,
    pub eval_before: Evaluation,
    pub eval_after: Evaluation,
    pub classification: Classification,
}

/// Per-game output of a worker
#[derive(Debug, Clone)]
pub struct GameResult {
    pub game_id: i64,
    pub records: Vec<MoveRecord>,
}

/// Batch descriptor carried in a queue message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    #[serde(alias = "user")]
    pub owner: String,
    /// 0-based
    pub batch_index: u32,
    pub num_games: u32,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub engine_depth: u32,
    #[serde(default, alias = "engine_move_time")]
    pub engine_move_time_ms: u32,
    #[serde(default)]
    pub engine_use_depth: bool,
}

impl JobMessage {
    pub fn decode(body: &str) -> Result<Self, WorkerError> {
        let job: JobMessage =
            serde_json::from_str(body).map_err(|e| WorkerError::QueueDecode(e.to_string()))?;

        if job.owner.trim().is_empty() {
            return Err(WorkerError::QueueDecode("owner is empty".into()));
        }
        if job.num_games == 0 {
            return Err(WorkerError::QueueDecode("num_games must be positive".into()));
        }
        Ok(job)
    }

    /// Offset of this batch's first game in the owner's recency-ordered games.
    pub fn offset(&self) -> u64 {
        u64::from(self.batch_index) * u64::from(self.num_games)
    }

    /// Job id for progress tracking; blank ids mean untracked.
    pub fn tracked_job_id(&self) -> Option<&str> {
        self.job_id.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            depth: self.engine_depth,
            move_time_ms: self.engine_move_time_ms,
            use_depth: self.engine_use_depth,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            other => Err(WorkerError::Parse(format!("unknown job status '{other}'"))),
        }
    }
}

/// Job counters as they stand after a progress update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobProgress {
    pub completed_batches: u32,
    pub total_batches: u32,
    pub status: JobStatus,
    /// False when this (job, batch) pair had already been counted.
    pub counted: bool,
}
