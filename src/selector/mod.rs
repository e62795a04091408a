//! Sticky-key consumer selection.

mod auto_split;
mod consistent;
mod exclusive;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{KeySharedConfig, KeySharedMode};
use crate::dispatch::ConsumerName;

pub use auto_split::AutoSplitSelector;
pub use consistent::ConsistentHashSelector;
pub use exclusive::ExclusiveSelector;

/// Size of the sticky hash space shared by every selector variant.
pub const KEY_HASH_RANGE_SIZE: u32 = 1 << 16;

/// 32-bit hash of a sticky key, reduced into the selector hash space.
///
/// Stable across processes and replicas; selection is a pure function of
/// this value and the membership set.
pub fn sticky_key_hash(key: &[u8]) -> u32 {
    crc32c::crc32c(key) % KEY_HASH_RANGE_SIZE
}

/// Inclusive range of hash slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HashRange {
    pub start: u32,
    pub end: u32,
}

impl HashRange {
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn overlaps(&self, other: &HashRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains(&self, hash: u32) -> bool {
        self.start <= hash && hash <= self.end
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectorError {
    #[error("consumer `{consumer}` claims no hash ranges")]
    EmptyClaim { consumer: ConsumerName },

    #[error("hash range {start}..={end} claimed by `{consumer}` is malformed")]
    InvalidClaim {
        consumer: ConsumerName,
        start: u32,
        end: u32,
    },

    #[error("hash range {start}..={end} claimed by `{consumer}` overlaps a range held by `{held_by}`")]
    ClaimOverlap {
        consumer: ConsumerName,
        start: u32,
        end: u32,
        held_by: ConsumerName,
    },
}

/// Tagged selector over the three variants; no open plugin surface.
///
/// Every variant yields identical selections for identical inputs across
/// replicas: selection depends only on the hash and the membership set.
#[derive(Debug)]
pub enum StickyKeySelector {
    ConsistentHash(ConsistentHashSelector),
    AutoSplit(AutoSplitSelector),
    Exclusive(ExclusiveSelector),
}

impl StickyKeySelector {
    pub fn for_config(config: &KeySharedConfig) -> Self {
        match config.key_shared_mode {
            KeySharedMode::AutoSplit => {
                if config.use_consistent_hashing {
                    Self::ConsistentHash(ConsistentHashSelector::new(
                        config.consistent_hashing_replica_points,
                    ))
                } else {
                    Self::AutoSplit(AutoSplitSelector::new())
                }
            }
            KeySharedMode::Sticky => Self::Exclusive(ExclusiveSelector::new()),
        }
    }

    /// Registers a consumer. `claims` is consulted only by the exclusive
    /// variant, which requires it to be non-empty and disjoint from every
    /// held range.
    pub fn add_consumer(
        &mut self,
        consumer: &ConsumerName,
        claims: &[HashRange],
    ) -> Result<(), SelectorError> {
        match self {
            Self::ConsistentHash(s) => {
                s.add_consumer(consumer);
                Ok(())
            }
            Self::AutoSplit(s) => {
                s.add_consumer(consumer);
                Ok(())
            }
            Self::Exclusive(s) => s.add_consumer(consumer, claims),
        }
    }

    pub fn remove_consumer(&mut self, consumer: &ConsumerName) {
        match self {
            Self::ConsistentHash(s) => s.remove_consumer(consumer),
            Self::AutoSplit(s) => s.remove_consumer(consumer),
            Self::Exclusive(s) => s.remove_consumer(consumer),
        }
    }

    /// The consumer currently owning `hash`, or `None` when no consumer
    /// covers it (possible only for the exclusive variant or an empty
    /// membership).
    pub fn select(&self, hash: u32) -> Option<&ConsumerName> {
        match self {
            Self::ConsistentHash(s) => s.select(hash),
            Self::AutoSplit(s) => s.select(hash),
            Self::Exclusive(s) => s.select(hash),
        }
    }

    pub fn consumer_key_hash_ranges(&self) -> BTreeMap<ConsumerName, Vec<HashRange>> {
        match self {
            Self::ConsistentHash(s) => s.consumer_key_hash_ranges(),
            Self::AutoSplit(s) => s.consumer_key_hash_ranges(),
            Self::Exclusive(s) => s.consumer_key_hash_ranges(),
        }
    }
}
