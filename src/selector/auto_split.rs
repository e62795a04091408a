//! Uniform splitting of the hash space across the consumer set.

use std::collections::{BTreeMap, BTreeSet};

use crate::dispatch::ConsumerName;

use super::{HashRange, KEY_HASH_RANGE_SIZE};

/// Divides the hash space into N consecutive ranges, one per consumer in
/// name order, recomputed on every membership change. The last consumer
/// absorbs the remainder when the space does not divide evenly.
#[derive(Debug, Default)]
pub struct AutoSplitSelector {
    consumers: BTreeSet<ConsumerName>,
}

impl AutoSplitSelector {
    pub fn new() -> Self {
        Self::default()
    }

    fn width(&self) -> u32 {
        (KEY_HASH_RANGE_SIZE / self.consumers.len() as u32).max(1)
    }

    pub fn add_consumer(&mut self, consumer: &ConsumerName) {
        self.consumers.insert(consumer.clone());
    }

    pub fn remove_consumer(&mut self, consumer: &ConsumerName) {
        self.consumers.remove(consumer);
    }

    pub fn select(&self, hash: u32) -> Option<&ConsumerName> {
        if self.consumers.is_empty() {
            return None;
        }
        let index = ((hash / self.width()) as usize).min(self.consumers.len() - 1);
        self.consumers.iter().nth(index)
    }

    pub fn consumer_key_hash_ranges(&self) -> BTreeMap<ConsumerName, Vec<HashRange>> {
        let count = self.consumers.len() as u32;
        let width = if count == 0 { 0 } else { self.width() };
        self.consumers
            .iter()
            .enumerate()
            .map(|(i, consumer)| {
                let i = i as u32;
                let start = i * width;
                let end = if i + 1 == count {
                    KEY_HASH_RANGE_SIZE - 1
                } else {
                    (i + 1) * width - 1
                };
                (consumer.clone(), vec![HashRange::new(start, end)])
            })
            .collect()
    }
}
