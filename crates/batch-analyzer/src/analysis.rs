/// Move classification: pure functions only
/// (No Engine/Game/Storage dependencies)

use chess_core::Color;

use crate::models::Evaluation;

/// Classification thresholds (centipawn loss, inclusive)
const THRESHOLD_BLUNDER: u32 = 200;
const THRESHOLD_MISTAKE: u32 = 100;
const THRESHOLD_INACCURACY: u32 = 50;
const THRESHOLD_SUBOPTIMAL: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Category {
    None,
    Suboptimal,
    Inaccuracy,
    Mistake,
    Blunder,
}

impl Category {
    /// Highest threshold met wins.
    pub fn from_loss(loss: u32) -> Self {
        if loss >= THRESHOLD_BLUNDER {
            Category::Blunder
        } else if loss >= THRESHOLD_MISTAKE {
            Category::Mistake
        } else if loss >= THRESHOLD_INACCURACY {
            Category::Inaccuracy
        } else if loss >= THRESHOLD_SUBOPTIMAL {
            Category::Suboptimal
        } else {
            Category::None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::None => "none",
            Category::Suboptimal => "suboptimal",
            Category::Inaccuracy => "inaccuracy",
            Category::Mistake => "mistake",
            Category::Blunder => "blunder",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub category: Category,
    /// Centipawns the mover gave away; reported even under `none`.
    pub loss: u32,
}

impl Classification {
    pub const UNSCORED: Classification = Classification {
        category: Category::None,
        loss: 0,
    };
}

/// Classify a half-move from the evaluation of the position before it
/// (reported for the mover) and after it (reported for the opponent).
///
/// Mate scores and missing scores yield `none` with zero loss.
pub fn classify(mover: Color, before: &Evaluation, after: &Evaluation) -> Classification {
    if before.mate().is_some() || after.mate().is_some() {
        return Classification::UNSCORED;
    }
    let (Some(before_cp), Some(after_cp)) = (before.centipawns(), after.centipawns()) else {
        return Classification::UNSCORED;
    };

    let before_white = white_pov(before_cp, mover);
    let after_white = white_pov(after_cp, !mover);

    let delta = match mover {
        Color::White => after_white - before_white,
        Color::Black => before_white - after_white,
    };
    let loss = u32::try_from((-delta).max(0)).unwrap_or(u32::MAX);

    Classification {
        category: Category::from_loss(loss),
        loss,
    }
}

// Widened so engine-reported extremes cannot overflow.
fn white_pov(cp: i32, reported_for: Color) -> i64 {
    let cp = i64::from(cp);
    match reported_for {
        Color::White => cp,
        Color::Black => -cp,
    }
}
