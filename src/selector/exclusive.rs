//! Explicitly claimed hash ranges.

use std::collections::BTreeMap;

use crate::dispatch::ConsumerName;

use super::{HashRange, KEY_HASH_RANGE_SIZE, SelectorError};

#[derive(Debug, Clone)]
struct Claim {
    end: u32,
    owner: ConsumerName,
}

/// Consumers claim hash ranges at subscribe time; disjointness is
/// enforced and unclaimed hashes map to no consumer.
#[derive(Debug, Default)]
pub struct ExclusiveSelector {
    // keyed by range start; values never overlap
    claims: BTreeMap<u32, Claim>,
}

impl ExclusiveSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the consumer's claims atomically: either every range is
    /// accepted or none is.
    pub fn add_consumer(
        &mut self,
        consumer: &ConsumerName,
        claims: &[HashRange],
    ) -> Result<(), SelectorError> {
        if claims.is_empty() {
            return Err(SelectorError::EmptyClaim {
                consumer: consumer.clone(),
            });
        }
        let mut sorted = claims.to_vec();
        sorted.sort();
        for claim in &sorted {
            if claim.start > claim.end || claim.end >= KEY_HASH_RANGE_SIZE {
                return Err(SelectorError::InvalidClaim {
                    consumer: consumer.clone(),
                    start: claim.start,
                    end: claim.end,
                });
            }
            if let Some(held) = self
                .claims
                .range(..=claim.end)
                .next_back()
                .map(|(_, held)| held)
                .filter(|held| held.end >= claim.start)
            {
                return Err(SelectorError::ClaimOverlap {
                    consumer: consumer.clone(),
                    start: claim.start,
                    end: claim.end,
                    held_by: held.owner.clone(),
                });
            }
        }
        for pair in sorted.windows(2) {
            if pair[0].overlaps(&pair[1]) {
                return Err(SelectorError::ClaimOverlap {
                    consumer: consumer.clone(),
                    start: pair[1].start,
                    end: pair[1].end,
                    held_by: consumer.clone(),
                });
            }
        }
        for claim in sorted {
            self.claims.insert(
                claim.start,
                Claim {
                    end: claim.end,
                    owner: consumer.clone(),
                },
            );
        }
        Ok(())
    }

    pub fn remove_consumer(&mut self, consumer: &ConsumerName) {
        self.claims.retain(|_, claim| claim.owner != *consumer);
    }

    pub fn select(&self, hash: u32) -> Option<&ConsumerName> {
        self.claims
            .range(..=hash)
            .next_back()
            .filter(|(_, claim)| claim.end >= hash)
            .map(|(_, claim)| &claim.owner)
    }

    pub fn consumer_key_hash_ranges(&self) -> BTreeMap<ConsumerName, Vec<HashRange>> {
        let mut out: BTreeMap<ConsumerName, Vec<HashRange>> = BTreeMap::new();
        for (&start, claim) in &self.claims {
            out.entry(claim.owner.clone())
                .or_default()
                .push(HashRange::new(start, claim.end));
        }
        out
    }
}
