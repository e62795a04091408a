//! Consistent-hash ring selection.

use std::collections::{BTreeMap, BTreeSet};

use crate::dispatch::ConsumerName;

use super::{HashRange, KEY_HASH_RANGE_SIZE};

/// Each consumer sits at `replica_points` positions on a ring over the
/// hash space; a hash is owned by the next ring point clockwise.
///
/// Adding or removing one consumer only moves the slots adjacent to its
/// own points, which keeps rebalancing stable. Point collisions keep all
/// claimants in name order and the first one wins, so selection stays a
/// pure function of the membership set.
#[derive(Debug)]
pub struct ConsistentHashSelector {
    ring: BTreeMap<u32, BTreeSet<ConsumerName>>,
    replica_points: usize,
}

impl ConsistentHashSelector {
    pub fn new(replica_points: usize) -> Self {
        Self {
            ring: BTreeMap::new(),
            replica_points: replica_points.max(1),
        }
    }

    fn ring_point(consumer: &ConsumerName, replica: usize) -> u32 {
        crc32c::crc32c(format!("{consumer}{replica}").as_bytes()) % KEY_HASH_RANGE_SIZE
    }

    pub fn add_consumer(&mut self, consumer: &ConsumerName) {
        for replica in 0..self.replica_points {
            self.ring
                .entry(Self::ring_point(consumer, replica))
                .or_default()
                .insert(consumer.clone());
        }
    }

    pub fn remove_consumer(&mut self, consumer: &ConsumerName) {
        for replica in 0..self.replica_points {
            let point = Self::ring_point(consumer, replica);
            if let Some(owners) = self.ring.get_mut(&point) {
                owners.remove(consumer);
                if owners.is_empty() {
                    self.ring.remove(&point);
                }
            }
        }
    }

    pub fn select(&self, hash: u32) -> Option<&ConsumerName> {
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .and_then(|(_, owners)| owners.iter().next())
    }

    pub fn consumer_key_hash_ranges(&self) -> BTreeMap<ConsumerName, Vec<HashRange>> {
        let mut out: BTreeMap<ConsumerName, Vec<HashRange>> = BTreeMap::new();
        let points: Vec<(u32, &ConsumerName)> = self
            .ring
            .iter()
            .filter_map(|(&point, owners)| owners.iter().next().map(|owner| (point, owner)))
            .collect();
        let Some(&(first_point, first_owner)) = points.first() else {
            return out;
        };
        out.entry(first_owner.clone())
            .or_default()
            .push(HashRange::new(0, first_point));
        for pair in points.windows(2) {
            let (prev_point, _) = pair[0];
            let (point, owner) = pair[1];
            out.entry(owner.clone())
                .or_default()
                .push(HashRange::new(prev_point + 1, point));
        }
        let (last_point, _) = points[points.len() - 1];
        if last_point + 1 < KEY_HASH_RANGE_SIZE {
            // hashes past the last point wrap to the first point
            out.entry(first_owner.clone())
                .or_default()
                .push(HashRange::new(last_point + 1, KEY_HASH_RANGE_SIZE - 1));
        }
        out
    }
}
