//! Ledger-addressed log positions and half-open position ranges.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Entry id standing for "immediately before entry 0" of a ledger.
///
/// Appears only as the open lower bound of a range that starts at the first
/// entry of a ledger; it never addresses a stored entry.
pub const ENTRY_BEFORE_FIRST: i64 = -1;

/// A point in the log: `(ledger_id, entry_id)`, ordered lexicographically.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub ledger_id: u64,
    pub entry_id: i64,
}

impl Position {
    pub const fn new(ledger_id: u64, entry_id: i64) -> Self {
        Self {
            ledger_id,
            entry_id,
        }
    }

    /// The open lower bound sitting just before entry 0 of `ledger_id`.
    pub const fn before_first(ledger_id: u64) -> Self {
        Self::new(ledger_id, ENTRY_BEFORE_FIRST)
    }
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Position({}:{})", self.ledger_id, self.entry_id)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ledger_id, self.entry_id)
    }
}

/// A half-open span of positions `(lower, upper]`.
///
/// Stored canonically as open-lower, closed-upper; `lower < upper` always
/// holds for a constructed range.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PositionRange {
    lower: Position,
    upper: Position,
}

impl PositionRange {
    /// Builds `(lower, upper]`. The bounds must be strictly ordered.
    pub fn open_closed(lower: Position, upper: Position) -> Self {
        debug_assert!(lower < upper, "range bounds out of order: {lower}..{upper}");
        Self { lower, upper }
    }

    /// Exclusive lower bound.
    pub fn lower(&self) -> Position {
        self.lower
    }

    /// Inclusive upper bound.
    pub fn upper(&self) -> Position {
        self.upper
    }

    pub fn contains(&self, p: Position) -> bool {
        self.lower < p && p <= self.upper
    }
}

impl fmt::Debug for PositionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for PositionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}..{}]", self.lower, self.upper)
    }
}
