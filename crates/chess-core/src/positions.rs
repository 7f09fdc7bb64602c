//! Turn a PGN game record into the ordered board snapshots an engine evaluates.

use shakmaty::fen::Fen;
use shakmaty::san::San;
use shakmaty::{CastlingMode, Chess, Color, EnPassantMode, Position};
use thiserror::Error;

use crate::pgn;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequenceError {
    #[error("no moves found in game record")]
    NoMoves,

    #[error("invalid start position '{fen}': {reason}")]
    InvalidStartPosition { fen: String, reason: String },

    #[error("invalid SAN '{san}' at ply {ply}")]
    InvalidSan { ply: usize, san: String },

    #[error("illegal move '{san}' at ply {ply}")]
    IllegalMove { ply: usize, san: String },
}

/// Board state before a given ply. Ply 0 is the start position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionSnapshot {
    pub ply: u32,
    pub side_to_move: Color,
    pub fen: String,
    pub fullmove: u32,
}

impl PositionSnapshot {
    fn capture(pos: &Chess, ply: u32) -> Self {
        Self {
            ply,
            side_to_move: pos.turn(),
            fen: Fen::from_position(pos, EnPassantMode::Legal).to_string(),
            fullmove: pos.fullmoves().get(),
        }
    }

    /// FEN without move counters: placement, side, castling, en passant.
    pub fn normalized_fen(&self) -> String {
        self.fen.split_whitespace().take(4).collect::<Vec<_>>().join(" ")
    }
}

/// One half-move as played.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayedMove {
    pub uci: String,
    pub san: String,
}

/// A sequenced game: `snapshots.len() == moves.len() + 1`, and `moves[i]`
/// leads from `snapshots[i]` to `snapshots[i + 1]`.
#[derive(Debug, Clone)]
pub struct GameLine {
    pub snapshots: Vec<PositionSnapshot>,
    pub moves: Vec<PlayedMove>,
}

/// Sequence a PGN game record. Honors a `[FEN "..."]` start position; every
/// movetext token must be legal SAN in order.
pub fn sequence_pgn(pgn_text: &str) -> Result<GameLine, SequenceError> {
    let mut pos = start_position(pgn_text)?;
    let tokens = pgn::san_tokens(pgn_text);
    if tokens.is_empty() {
        return Err(SequenceError::NoMoves);
    }

    let mut snapshots = Vec::with_capacity(tokens.len() + 1);
    let mut moves = Vec::with_capacity(tokens.len());
    snapshots.push(PositionSnapshot::capture(&pos, 0));

    for (ply, token) in tokens.iter().enumerate() {
        let san: San = token.parse().map_err(|_| SequenceError::InvalidSan {
            ply: ply + 1,
            san: token.clone(),
        })?;
        let mv = san.to_move(&pos).map_err(|_| SequenceError::IllegalMove {
            ply: ply + 1,
            san: token.clone(),
        })?;

        moves.push(PlayedMove {
            uci: mv.to_uci(CastlingMode::Standard).to_string(),
            san: San::from_move(&pos, mv).to_string(),
        });
        pos.play_unchecked(mv);
        snapshots.push(PositionSnapshot::capture(&pos, (ply + 1) as u32));
    }

    Ok(GameLine { snapshots, moves })
}

fn start_position(pgn_text: &str) -> Result<Chess, SequenceError> {
    let Some(fen_text) = pgn::extract_header(pgn_text, "FEN") else {
        return Ok(Chess::default());
    };

    let invalid = |reason: String| SequenceError::InvalidStartPosition {
        fen: fen_text.clone(),
        reason,
    };
    let fen: Fen = fen_text.parse().map_err(|e| invalid(format!("{e}")))?;
    fen.into_position::<Chess>(CastlingMode::Standard)
        .map_err(|e| invalid(format!("{e}")))
}

/// Persisted side-to-move token: `w` for White, `b` for Black.
pub fn side_token(color: Color) -> &'static str {
    match color {
        Color::White => "w",
        Color::Black => "b",
    }
}
