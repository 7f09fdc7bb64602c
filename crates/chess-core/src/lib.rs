//! Chess-notation boundary for the batch analyzer: PGN cleanup and
//! sequencing of a game into engine-ready board snapshots.

pub mod pgn;
pub mod positions;

pub use positions::{sequence_pgn, GameLine, PlayedMove, PositionSnapshot, SequenceError};
pub use shakmaty::Color;
