//! Per-game analysis: sequence the game, evaluate positions, classify moves.

use std::time::Duration;

use chess_core::sequence_pgn;
use tokio::time::Instant;
use tracing::debug;

use crate::analysis::classify;
use crate::engine::Evaluator;
use crate::error::WorkerError;
use crate::models::{EngineSettings, MoveRecord, StoredGame};

#[derive(Debug, Clone, Copy)]
pub struct AnalysisLimits {
    /// Half-moves analyzed per game; also caps evaluated positions.
    pub move_limit: usize,
    pub position_timeout: Duration,
}

impl Default for AnalysisLimits {
    fn default() -> Self {
        Self {
            move_limit: 40,
            position_timeout: Duration::from_secs(2),
        }
    }
}

/// Analyze one game on an exclusively held session.
///
/// The game is parsed before the engine is touched, so a malformed record
/// costs no engine time. The session is reset once, then positions are
/// evaluated strictly in ply order.
pub async fn analyze_game<E: Evaluator>(
    session: &mut E,
    game: &StoredGame,
    owner: &str,
    settings: &EngineSettings,
    limits: &AnalysisLimits,
    job_deadline: Instant,
) -> Result<Vec<MoveRecord>, WorkerError> {
    let line = sequence_pgn(&game.pgn)
        .map_err(|e| WorkerError::Parse(format!("game {}: {e}", game.id)))?;

    session.reset().await?;

    let window = line.snapshots.len().min(limits.move_limit);
    let mut evaluations = Vec::with_capacity(window);
    for snapshot in &line.snapshots[..window] {
        let now = Instant::now();
        if now >= job_deadline {
            return Err(WorkerError::DeadlineExceeded);
        }
        let deadline = (now + limits.position_timeout).min(job_deadline);
        evaluations.push(session.evaluate(&snapshot.fen, settings, deadline).await?);
    }

    let owner_side = game.owner_side();
    let mut mover = line.snapshots[0].side_to_move;
    let half_moves = line.moves.len().min(limits.move_limit);
    let mut records = Vec::with_capacity(half_moves);

    for (i, played) in line.moves.iter().take(half_moves).enumerate() {
        let position_before = line.snapshots[i].clone();
        let eval_before = evaluations.get(i).cloned().unwrap_or_default();
        let eval_after = evaluations.get(i + 1).cloned().unwrap_or_default();
        let classification = classify(mover, &eval_before, &eval_after);

        let played_by = if owner_side == Some(mover) {
            owner.to_string()
        } else {
            game.opponent.clone()
        };

        records.push(MoveRecord {
            ply: i as u32 + 1,
            move_number: position_before.fullmove,
            side_to_move: mover,
            move_uci: played.uci.clone(),
            move_san: played.san.clone(),
            played_by,
            position_before,
            position_after: line.snapshots.get(i + 1).cloned(),
            eval_before,
            eval_after,
            classification,
        });
        mover = !mover;
    }

    debug!(game_id = game.id, records = records.len(), positions = window, "Game analyzed");
    Ok(records)
}
