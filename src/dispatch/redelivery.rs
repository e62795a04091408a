//! Positions awaiting replay, indexed by sticky-key hash.

use std::collections::{BTreeMap, BTreeSet};

use crate::position::Position;

/// Set of `(position, sticky-key hash)` pairs that were read but not
/// delivered, or delivered and later returned. The secondary hash index
/// answers "is any deferred entry sharing one of these hashes" without a
/// scan, which is what the dispatcher's ordering fence asks on every
/// batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RedeliveryTracker {
    positions: BTreeMap<Position, u32>,
    hash_counts: BTreeMap<u32, usize>,
}

impl RedeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, position: Position, hash: u32) {
        match self.positions.insert(position, hash) {
            Some(previous) if previous == hash => {}
            Some(previous) => {
                self.forget_hash(previous);
                self.count_hash(hash);
            }
            None => self.count_hash(hash),
        }
    }

    pub fn remove(&mut self, position: Position) -> Option<u32> {
        let hash = self.positions.remove(&position)?;
        self.forget_hash(hash);
        Some(hash)
    }

    /// Drops every tracked position `<= position`; true when any was
    /// dropped.
    pub fn remove_all_up_to(&mut self, position: Position) -> bool {
        let drained: Vec<Position> = self
            .positions
            .range(..=position)
            .map(|(&p, _)| p)
            .collect();
        for p in &drained {
            self.remove(*p);
        }
        !drained.is_empty()
    }

    pub fn contains(&self, position: Position) -> bool {
        self.positions.contains_key(&position)
    }

    pub fn hash_of(&self, position: Position) -> Option<u32> {
        self.positions.get(&position).copied()
    }

    /// True when some tracked position carries one of `hashes`.
    pub fn contains_sticky_key_hashes(&self, hashes: &BTreeSet<u32>) -> bool {
        hashes.iter().any(|h| self.hash_counts.contains_key(h))
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn first_position(&self) -> Option<Position> {
        self.positions.keys().next().copied()
    }

    /// Up to `limit` tracked positions, ascending. Entries leave the
    /// tracker when they are actually dispatched, not when scheduled.
    pub fn positions_to_replay(&self, limit: usize) -> BTreeSet<Position> {
        self.positions.keys().take(limit).copied().collect()
    }

    fn count_hash(&mut self, hash: u32) {
        *self.hash_counts.entry(hash).or_insert(0) += 1;
    }

    fn forget_hash(&mut self, hash: u32) {
        if let Some(count) = self.hash_counts.get_mut(&hash) {
            *count -= 1;
            if *count == 0 {
                self.hash_counts.remove(&hash);
            }
        }
    }
}
