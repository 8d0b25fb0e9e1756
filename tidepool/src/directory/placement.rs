//! Mapping key hashes to shards.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Chooses the shard that hosts a new virtual actor instance.
///
/// Pure strategies are asked on every resolution. The choice of an impure
/// one is remembered for as long as the key's instance lives.
pub trait PlacementStrategy: Send + Sync + 'static {
    /// Shard for a key with stable hash `hash`, in `0..shard_count`.
    fn place(&self, hash: u64, shard_count: usize) -> usize;

    /// Whether [`place`](Self::place) depends on its arguments only.
    fn is_pure(&self) -> bool {
        true
    }
}

/// `hash % shard_count`. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuloPlacement;

impl PlacementStrategy for ModuloPlacement {
    fn place(&self, hash: u64, shard_count: usize) -> usize {
        (hash % shard_count.max(1) as u64) as usize
    }
}

/// Spread new keys evenly over shards in creation order.
#[derive(Debug, Default)]
pub struct RoundRobinPlacement {
    next: AtomicUsize,
}

impl RoundRobinPlacement {
    /// Start at shard 0.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PlacementStrategy for RoundRobinPlacement {
    fn place(&self, _hash: u64, shard_count: usize) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % shard_count.max(1)
    }

    fn is_pure(&self) -> bool {
        false
    }
}

/// Every key on one shard, for types that talk mostly to each other.
#[derive(Debug, Clone, Copy)]
pub struct FixedPlacement(pub usize);

impl PlacementStrategy for FixedPlacement {
    fn place(&self, _hash: u64, shard_count: usize) -> usize {
        self.0.min(shard_count.saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modulo_placement() {
        assert_eq!(ModuloPlacement.place(10, 4), 2);
        assert_eq!(ModuloPlacement.place(3, 4), 3);
        assert_eq!(ModuloPlacement.place(3, 0), 0);
    }

    #[test]
    fn test_round_robin_cycles() {
        let placement = RoundRobinPlacement::new();
        let shards: Vec<usize> = (0..5).map(|_| placement.place(42, 3)).collect();
        assert_eq!(shards, vec![0, 1, 2, 0, 1]);
        assert!(!placement.is_pure());
        assert!(ModuloPlacement.is_pure());
    }

    #[test]
    fn test_fixed_placement_clamps() {
        assert_eq!(FixedPlacement(1).place(99, 4), 1);
        assert_eq!(FixedPlacement(7).place(99, 4), 3);
    }
}
