//! Database queries for game loading, move record storage and job progress

use std::future::Future;
use std::time::Duration;

use chess_core::positions::side_token;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, warn};

use crate::analysis::Category;
use crate::error::WorkerError;
use crate::models::{EngineSettings, JobProgress, MoveRecord, StoredGame};

/// Persistence boundary of the pipeline. Both writes are idempotent so a
/// redelivered batch can be processed again safely.
pub trait AnalysisStore: Send + Sync {
    /// The owner's games, most recent first.
    fn load_games(
        &self,
        owner: &str,
        limit: u32,
        offset: u64,
    ) -> impl Future<Output = Result<Vec<StoredGame>, WorkerError>> + Send;

    /// Insert a game's move records; rows already present for
    /// (game_id, ply) are left untouched.
    fn upsert_move_records(
        &self,
        game_id: i64,
        records: &[MoveRecord],
        settings: &EngineSettings,
    ) -> impl Future<Output = Result<(), WorkerError>> + Send;

    /// Count a finished batch at most once per (job_id, batch_index).
    /// Returns `None` if the job does not exist.
    fn upsert_job_progress(
        &self,
        job_id: &str,
        batch_index: u32,
    ) -> impl Future<Output = Result<Option<JobProgress>, WorkerError>> + Send;
}

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(300))
        .connect(database_url)
        .await
}

/// Create the tables this worker reads and writes, if missing.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- Imported games
CREATE TABLE IF NOT EXISTS games (
    id          BIGSERIAL PRIMARY KEY,
    username    TEXT NOT NULL,
    url         TEXT NOT NULL,
    when_unix   BIGINT NOT NULL,
    color       TEXT NOT NULL,
    opponent    TEXT NOT NULL,
    pgn         TEXT NOT NULL,
    UNIQUE (username, url)
);

CREATE INDEX IF NOT EXISTS idx_games_username_when
    ON games (username, when_unix DESC);

-- Per-move analysis, one row per half-move
CREATE TABLE IF NOT EXISTS moves (
    game_id               BIGINT NOT NULL REFERENCES games(id) ON DELETE CASCADE,
    ply                   INTEGER NOT NULL,
    move_number           INTEGER NOT NULL,
    fen_before            TEXT NOT NULL,
    fen_after             TEXT,
    move_uci              TEXT NOT NULL,
    move_san              TEXT NOT NULL,
    color                 CHAR(1) NOT NULL,
    eval_depth            INTEGER,
    eval_time             INTEGER,
    eval_before_cp        INTEGER,
    eval_after_cp         INTEGER,
    eval_before_mate      INTEGER,
    eval_after_mate       INTEGER,
    centipawn_loss        INTEGER NOT NULL,
    best_move_uci         TEXT,
    classification        TEXT NOT NULL,
    is_suboptimal         BOOLEAN NOT NULL,
    is_inaccuracy         BOOLEAN NOT NULL,
    is_mistake            BOOLEAN NOT NULL,
    is_blunder            BOOLEAN NOT NULL,
    normalized_fen_before TEXT NOT NULL,
    played_by             TEXT NOT NULL,
    created_at            TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (game_id, ply)
);

CREATE INDEX IF NOT EXISTS idx_moves_normalized_fen
    ON moves (normalized_fen_before);

-- Analysis jobs and their batch counters
CREATE TABLE IF NOT EXISTS jobs (
    id                TEXT PRIMARY KEY DEFAULT gen_random_uuid()::text,
    username          TEXT NOT NULL,
    total_games       INTEGER NOT NULL,
    batch_size        INTEGER NOT NULL,
    total_batches     INTEGER NOT NULL,
    completed_batches INTEGER NOT NULL DEFAULT 0,
    status            TEXT NOT NULL DEFAULT 'pending',
    created_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at        TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

-- One row per counted batch; guards the counter against redelivery
CREATE TABLE IF NOT EXISTS job_batches (
    job_id       TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    batch_index  INTEGER NOT NULL,
    completed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (job_id, batch_index)
);
"#;

/// Postgres-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn to_i32(value: u32, what: &str) -> Result<i32, WorkerError> {
    i32::try_from(value).map_err(|_| WorkerError::Parse(format!("{what} out of range: {value}")))
}

impl AnalysisStore for PgStore {
    async fn load_games(
        &self,
        owner: &str,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<StoredGame>, WorkerError> {
        let offset = i64::try_from(offset)
            .map_err(|_| WorkerError::Parse(format!("offset out of range: {offset}")))?;

        let rows: Vec<(i64, String, i64, String, String, String)> = sqlx::query_as(
            r#"SELECT id, url, when_unix, color, opponent, pgn
            FROM games
            WHERE username = $1
            ORDER BY when_unix DESC, id DESC
            LIMIT $2
            OFFSET $3"#,
        )
        .bind(owner)
        .bind(i64::from(limit))
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, url, played_at, color, opponent, pgn)| StoredGame {
                id,
                url,
                played_at,
                color,
                opponent,
                pgn,
            })
            .collect())
    }

    async fn upsert_move_records(
        &self,
        game_id: i64,
        records: &[MoveRecord],
        settings: &EngineSettings,
    ) -> Result<(), WorkerError> {
        let depth = to_i32(settings.depth, "engine depth")?;
        let move_time = to_i32(settings.move_time_ms, "engine move time")?;

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for record in records {
            let category = record.classification.category;
            let loss = i32::try_from(record.classification.loss).unwrap_or(i32::MAX);

            inserted += sqlx::query(
                r#"INSERT INTO moves (
                    game_id, ply, move_number, fen_before, fen_after,
                    move_uci, move_san, color,
                    eval_depth, eval_time,
                    eval_before_cp, eval_after_cp, eval_before_mate, eval_after_mate,
                    centipawn_loss, best_move_uci, classification,
                    is_suboptimal, is_inaccuracy, is_mistake, is_blunder,
                    normalized_fen_before, played_by
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                          $15, $16, $17, $18, $19, $20, $21, $22, $23)
                ON CONFLICT (game_id, ply) DO NOTHING"#,
            )
            .bind(game_id)
            .bind(to_i32(record.ply, "ply")?)
            .bind(to_i32(record.move_number, "move number")?)
            .bind(&record.position_before.fen)
            .bind(record.position_after.as_ref().map(|p| p.fen.as_str()))
            .bind(&record.move_uci)
            .bind(&record.move_san)
            .bind(side_token(record.side_to_move))
            .bind(settings.use_depth.then_some(depth))
            .bind((!settings.use_depth).then_some(move_time))
            .bind(record.eval_before.centipawns())
            .bind(record.eval_after.centipawns())
            .bind(record.eval_before.mate())
            .bind(record.eval_after.mate())
            .bind(loss)
            .bind(record.eval_before.best_move.as_deref())
            .bind(category.as_str())
            .bind(category == Category::Suboptimal)
            .bind(category == Category::Inaccuracy)
            .bind(category == Category::Mistake)
            .bind(category == Category::Blunder)
            .bind(record.position_before.normalized_fen())
            .bind(&record.played_by)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;
        debug!(game_id, records = records.len(), inserted, "Saved move records");
        Ok(())
    }

    async fn upsert_job_progress(
        &self,
        job_id: &str,
        batch_index: u32,
    ) -> Result<Option<JobProgress>, WorkerError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(i32, i32, String)> = sqlx::query_as(
            "SELECT completed_batches, total_batches, status FROM jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(current) = current else {
            warn!(job_id, "No job row found, progress not recorded");
            return Ok(None);
        };

        let counted = sqlx::query(
            "INSERT INTO job_batches (job_id, batch_index) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(job_id)
        .bind(to_i32(batch_index, "batch index")?)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        let (completed, total, status) = if counted {
            sqlx::query_as(
                r#"UPDATE jobs
                SET
                    completed_batches = LEAST(completed_batches + 1, total_batches),
                    status = CASE
                        WHEN completed_batches + 1 >= total_batches THEN 'completed'
                        ELSE 'running'
                    END,
                    updated_at = NOW()
                WHERE id = $1
                RETURNING completed_batches, total_batches, status"#,
            )
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await?
        } else {
            current
        };

        tx.commit().await?;

        Ok(Some(JobProgress {
            completed_batches: completed.max(0) as u32,
            total_batches: total.max(0) as u32,
            status: status.parse()?,
            counted,
        }))
    }
}
