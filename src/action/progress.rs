//! Progress reporting.

use serde::{Deserialize, Serialize};

/// Progress as a `(numerator, denominator)` pair.
///
/// `(0, 0)` means unknown and `(-1, -1)` means not yet started. Any other value
/// is read as elapsed-of-total. Duration-based progress uses seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Amount done.
    pub numerator: f64,
    /// Total amount.
    pub denominator: f64,
}

impl Progress {
    /// Progress cannot be estimated.
    pub const UNKNOWN: Progress = Progress {
        numerator: 0.0,
        denominator: 0.0,
    };

    /// The action has not started yet.
    pub const NOT_STARTED: Progress = Progress {
        numerator: -1.0,
        denominator: -1.0,
    };

    /// Create a progress value.
    pub fn new(numerator: f64, denominator: f64) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// `(0, 0)`.
    pub fn is_unknown(&self) -> bool {
        self.numerator == 0.0 && self.denominator == 0.0
    }

    /// `(-1, -1)` or any negative pair.
    pub fn is_not_started(&self) -> bool {
        self.numerator < 0.0 && self.denominator < 0.0
    }

    /// Fraction done in `[0, 1]`, or `None` when unknown or not started.
    pub fn fraction(&self) -> Option<f64> {
        if self.denominator > 0.0 && self.numerator >= 0.0 {
            Some((self.numerator / self.denominator).clamp(0.0, 1.0))
        } else {
            None
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::NOT_STARTED
    }
}
