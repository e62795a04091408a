//! Key-shared subscription configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySharedMode {
    /// Hash ranges are assigned by the broker and recomputed on membership
    /// changes.
    AutoSplit,
    /// Consumers claim explicit hash ranges at subscribe time.
    Sticky,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeySharedConfig {
    pub key_shared_mode: KeySharedMode,
    /// Disables the recently-joined fence and individually-sent tracking;
    /// entries go to whichever consumer the selector picks.
    pub allow_out_of_order_delivery: bool,
    /// AutoSplit only: place consumers on a hash ring instead of splitting
    /// the space uniformly.
    pub use_consistent_hashing: bool,
    /// Ring points per consumer when consistent hashing is enabled.
    pub consistent_hashing_replica_points: usize,
    /// Entries requested per normal read.
    pub read_batch_size: usize,
    /// Replay candidates scheduled per replay read.
    pub replay_batch_size: usize,
}

impl Default for KeySharedConfig {
    fn default() -> Self {
        Self {
            key_shared_mode: KeySharedMode::AutoSplit,
            allow_out_of_order_delivery: false,
            use_consistent_hashing: false,
            consistent_hashing_replica_points: 100,
            read_batch_size: 100,
            replay_batch_size: 100,
        }
    }
}

impl KeySharedConfig {
    /// Whether a subscription created with `self` can serve a consumer
    /// asking for `other`. The delivery mode is fixed at subscription
    /// creation; a mismatch requires a new subscription.
    pub fn same_policy(&self, other: &KeySharedConfig) -> bool {
        self.key_shared_mode == other.key_shared_mode
            && self.allow_out_of_order_delivery == other.allow_out_of_order_delivery
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pick_auto_split_in_order_delivery() {
        let config = KeySharedConfig::default();
        assert_eq!(config.key_shared_mode, KeySharedMode::AutoSplit);
        assert!(!config.allow_out_of_order_delivery);
        assert_eq!(config.consistent_hashing_replica_points, 100);
    }

    #[test]
    fn same_policy_ignores_tuning_knobs() {
        let a = KeySharedConfig::default();
        let b = KeySharedConfig {
            read_batch_size: 500,
            use_consistent_hashing: true,
            ..KeySharedConfig::default()
        };
        assert!(a.same_policy(&b));

        let c = KeySharedConfig {
            allow_out_of_order_delivery: true,
            ..KeySharedConfig::default()
        };
        assert!(!a.same_policy(&c));
    }
}
