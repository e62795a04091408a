//! Sparse set of half-open position ranges, keyed per ledger.

mod bitmap;

use std::collections::BTreeMap;
use std::fmt;

use crate::position::{Position, PositionRange};

use bitmap::EntryBitmap;

/// Set of intervals over `(ledger, entry)` positions.
///
/// Each tracked ledger holds a dense bitmap of its member entry ids; the
/// outer map is the directory of non-empty ledgers in ascending order.
/// Within a ledger no two ranges overlap or touch (touching ranges
/// coalesce by construction), ranges never straddle a ledger boundary, and
/// a ledger with no members does not appear in the directory.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct PositionRangeSet {
    ledgers: BTreeMap<u64, EntryBitmap>,
}

impl PositionRangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ledgers.is_empty()
    }

    pub fn clear(&mut self) {
        self.ledgers.clear();
    }

    /// Adds the half-open range `((lower_ledger, lower_entry_open), (upper_ledger, upper_entry)]`.
    ///
    /// An empty input is a no-op and never creates storage. When the range
    /// straddles ledgers, the upper ledger receives `[0, upper_entry]`; the
    /// lower ledger is back-filled from the open bound only up to the last
    /// entry it already tracks (the set cannot know where a ledger ends),
    /// and intermediate ledgers are never materialized on their own.
    pub fn add_open_closed(
        &mut self,
        lower_ledger: u64,
        lower_entry_open: i64,
        upper_ledger: u64,
        upper_entry: i64,
    ) {
        if lower_ledger == upper_ledger {
            if upper_entry < 0 || upper_entry <= lower_entry_open {
                return;
            }
            let from = (lower_entry_open + 1).max(0) as usize;
            self.ledgers
                .entry(lower_ledger)
                .or_default()
                .set_range(from, upper_entry as usize);
            return;
        }
        if lower_ledger > upper_ledger {
            return;
        }
        if let Some(bits) = self.ledgers.get_mut(&lower_ledger)
            && let Some(last) = bits.last_set()
            && last as i64 >= lower_entry_open
        {
            let from = (lower_entry_open + 1).max(0) as usize;
            bits.set_range(from, last.max(from));
        }
        if upper_entry >= 0 {
            self.ledgers
                .entry(upper_ledger)
                .or_default()
                .set_range(0, upper_entry as usize);
        }
    }

    /// Removes the closed span `[lower, upper]`.
    ///
    /// Partially covered ranges are truncated; fully covered ranges split
    /// or disappear. Ledgers strictly inside the span are dropped whole.
    pub fn remove_range(&mut self, lower: Position, upper: Position) {
        if lower > upper {
            return;
        }
        let mut emptied = Vec::new();
        for (&ledger, bits) in self
            .ledgers
            .range_mut(lower.ledger_id..=upper.ledger_id)
        {
            let from = if ledger == lower.ledger_id {
                lower.entry_id.max(0) as usize
            } else {
                0
            };
            if ledger == upper.ledger_id {
                if upper.entry_id >= 0 {
                    bits.clear_range(from, upper.entry_id as usize);
                }
            } else {
                bits.clear_from(from);
            }
            if bits.is_empty() {
                emptied.push(ledger);
            }
        }
        for ledger in emptied {
            self.ledgers.remove(&ledger);
        }
    }

    /// Removes every position `<= p`.
    pub fn remove_at_most(&mut self, p: Position) {
        self.remove_range(Position::new(0, 0), p);
    }

    /// Removes every position `>= p`.
    pub fn remove_at_least(&mut self, p: Position) {
        let mut emptied = Vec::new();
        for (&ledger, bits) in self.ledgers.range_mut(p.ledger_id..) {
            if ledger == p.ledger_id {
                bits.clear_from(p.entry_id.max(0) as usize);
            } else {
                bits.clear_from(0);
            }
            if bits.is_empty() {
                emptied.push(ledger);
            }
        }
        for ledger in emptied {
            self.ledgers.remove(&ledger);
        }
    }

    pub fn contains(&self, ledger: u64, entry: i64) -> bool {
        entry >= 0
            && self
                .ledgers
                .get(&ledger)
                .is_some_and(|bits| bits.get(entry as usize))
    }

    /// The unique range containing `(ledger, entry)`, or `None`.
    pub fn range_containing(&self, ledger: u64, entry: i64) -> Option<PositionRange> {
        if entry < 0 {
            return None;
        }
        let bits = self.ledgers.get(&ledger)?;
        if !bits.get(entry as usize) {
            return None;
        }
        let (start, end) = bits.run_containing(entry as usize);
        Some(Self::run_to_range(ledger, start, end))
    }

    pub fn first_range(&self) -> Option<PositionRange> {
        let (&ledger, bits) = self.ledgers.iter().next()?;
        let first = bits.first_set()?;
        let (start, end) = bits.run_containing(first);
        Some(Self::run_to_range(ledger, start, end))
    }

    pub fn last_range(&self) -> Option<PositionRange> {
        let (&ledger, bits) = self.ledgers.iter().next_back()?;
        let last = bits.last_set()?;
        let (start, end) = bits.run_containing(last);
        Some(Self::run_to_range(ledger, start, end))
    }

    /// `(first lower bound, last upper bound]` of the union, or `None`.
    pub fn span(&self) -> Option<PositionRange> {
        let first = self.first_range()?;
        let last = self.last_range()?;
        Some(PositionRange::open_closed(first.lower(), last.upper()))
    }

    /// Number of disjoint ranges in the set.
    pub fn size(&self) -> usize {
        self.ledgers.values().map(|bits| bits.iter_runs().count()).sum()
    }

    /// All ranges in ascending order.
    pub fn as_ranges(&self) -> Vec<PositionRange> {
        let mut out = Vec::new();
        for (&ledger, bits) in &self.ledgers {
            for (start, end) in bits.iter_runs() {
                out.push(Self::run_to_range(ledger, start, end));
            }
        }
        out
    }

    /// Visits raw range bounds `(lower_ledger, lower_entry_open,
    /// upper_ledger, upper_entry)` ascending; stops when the visitor
    /// returns `false`.
    pub fn for_each_raw_range(&self, mut visit: impl FnMut(u64, i64, u64, i64) -> bool) {
        for (&ledger, bits) in &self.ledgers {
            for (start, end) in bits.iter_runs() {
                if !visit(ledger, start as i64 - 1, ledger, end as i64) {
                    return;
                }
            }
        }
    }

    /// Number of member entries inside the window, with closed entry
    /// bounds at both ends. `O(w + n)` over ledgers in the window.
    pub fn cardinality(
        &self,
        lower_ledger: u64,
        lower_entry: i64,
        upper_ledger: u64,
        upper_entry: i64,
    ) -> u64 {
        let mut total = 0;
        for (&ledger, bits) in self.ledgers.range(lower_ledger..=upper_ledger) {
            let from = if ledger == lower_ledger {
                lower_entry.max(0) as usize
            } else {
                0
            };
            if ledger == upper_ledger {
                if upper_entry < 0 {
                    continue;
                }
                total += bits.count_range(from, upper_entry as usize);
            } else {
                total += bits.count_range(from, usize::MAX);
            }
        }
        total
    }

    fn run_to_range(ledger: u64, start: usize, end: usize) -> PositionRange {
        PositionRange::open_closed(
            Position::new(ledger, start as i64 - 1),
            Position::new(ledger, end as i64),
        )
    }
}

impl fmt::Display for PositionRangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        let mut first = true;
        for range in self.as_ranges() {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{range}")?;
            first = false;
        }
        write!(f, "]")
    }
}

impl fmt::Debug for PositionRangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
