//! Consistent-hash ring over member addresses.
//!
//! The ring is an arena: a sorted vector of `(position, node index)` pairs
//! and the vector of addresses the indices point into. It is immutable;
//! membership changes build a new ring and swap it in, so readers never
//! block writers.

use tidepool_core::{NetworkAddress, stable_hash};

/// Immutable consistent-hash ring.
///
/// Replica 0 of a node sits at the stable hash of its `"ip:port"` string,
/// replica `i > 0` at the hash of `"ip:port#i"`. A key hash belongs to the
/// node owning the first position at or after it, wrapping around.
///
/// ```rust
/// use tidepool::cluster::HashRing;
/// use tidepool_core::NetworkAddress;
///
/// let ring = HashRing::new(1)
///     .with_node(NetworkAddress::localhost(4500))
///     .with_node(NetworkAddress::localhost(4501));
/// let owner = ring.node_for_key(42).expect("non-empty ring");
/// assert!(ring.contains(&owner));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashRing {
    replicas: usize,
    positions: Vec<(u64, usize)>,
    nodes: Vec<NetworkAddress>,
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(1)
    }
}

impl HashRing {
    /// Empty ring placing `replicas` positions per node (at least one).
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas: replicas.max(1),
            positions: Vec::new(),
            nodes: Vec::new(),
        }
    }

    /// Copy of this ring with `address` added.
    pub fn with_node(&self, address: NetworkAddress) -> Self {
        if self.contains(&address) {
            return self.clone();
        }
        let mut nodes = self.nodes.clone();
        nodes.push(address);
        Self::build(self.replicas, nodes)
    }

    /// Copy of this ring with `address` removed.
    pub fn without_node(&self, address: &NetworkAddress) -> Self {
        let nodes = self
            .nodes
            .iter()
            .filter(|node| *node != address)
            .copied()
            .collect();
        Self::build(self.replicas, nodes)
    }

    fn build(replicas: usize, mut nodes: Vec<NetworkAddress>) -> Self {
        // Sorted so equal member sets give equal rings whatever the join order.
        nodes.sort();
        let mut positions: Vec<(u64, usize)> = nodes
            .iter()
            .enumerate()
            .flat_map(|(index, node)| {
                (0..replicas).map(move |replica| (position(node, replica), index))
            })
            .collect();
        positions.sort_unstable();
        Self {
            replicas,
            positions,
            nodes,
        }
    }

    /// Owner of `key_hash`, or `None` for an empty ring.
    pub fn node_for_key(&self, key_hash: u64) -> Option<NetworkAddress> {
        if self.positions.is_empty() {
            return None;
        }
        let at = self
            .positions
            .partition_point(|(position, _)| *position < key_hash);
        let (_, index) = self.positions[at % self.positions.len()];
        self.nodes.get(index).copied()
    }

    /// Whether `address` is on the ring.
    pub fn contains(&self, address: &NetworkAddress) -> bool {
        self.nodes.binary_search(address).is_ok()
    }

    /// Member addresses, sorted.
    pub fn nodes(&self) -> &[NetworkAddress] {
        &self.nodes
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the ring has no member.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Positions per node.
    pub fn replicas(&self) -> usize {
        self.replicas
    }
}

fn position(address: &NetworkAddress, replica: usize) -> u64 {
    let label = if replica == 0 {
        address.to_string()
    } else {
        format!("{address}#{replica}")
    };
    stable_hash(label.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> NetworkAddress {
        NetworkAddress::localhost(port)
    }

    #[test]
    fn test_empty_ring_has_no_owner() {
        assert_eq!(HashRing::new(3).node_for_key(7), None);
    }

    #[test]
    fn test_single_node_owns_everything() {
        let ring = HashRing::new(1).with_node(addr(4500));
        for key in [0, 1, u64::MAX / 2, u64::MAX] {
            assert_eq!(ring.node_for_key(key), Some(addr(4500)));
        }
    }

    #[test]
    fn test_owner_is_first_position_at_or_after_key() {
        let ring = HashRing::new(1).with_node(addr(4500)).with_node(addr(4501));
        let a = position(&addr(4500), 0);
        let b = position(&addr(4501), 0);
        let (low, high) = if a < b { (addr(4500), addr(4501)) } else { (addr(4501), addr(4500)) };
        let (low_pos, high_pos) = (a.min(b), a.max(b));

        assert_eq!(ring.node_for_key(low_pos), Some(low));
        assert_eq!(ring.node_for_key(low_pos + 1), Some(high));
        assert_eq!(ring.node_for_key(high_pos), Some(high));
        // Past the last position wraps to the first.
        if high_pos < u64::MAX {
            assert_eq!(ring.node_for_key(high_pos + 1), Some(low));
        }
    }

    #[test]
    fn test_ring_is_independent_of_join_order() {
        let forward = HashRing::new(4)
            .with_node(addr(1))
            .with_node(addr(2))
            .with_node(addr(3));
        let backward = HashRing::new(4)
            .with_node(addr(3))
            .with_node(addr(2))
            .with_node(addr(1));
        assert_eq!(forward, backward);
        for key in (0..64u64).map(|i| i.wrapping_mul(0x9e37_79b9_7f4a_7c15)) {
            assert_eq!(forward.node_for_key(key), backward.node_for_key(key));
        }
    }

    #[test]
    fn test_removal_only_moves_keys_of_removed_node() {
        let full = HashRing::new(8)
            .with_node(addr(1))
            .with_node(addr(2))
            .with_node(addr(3));
        let reduced = full.without_node(&addr(2));
        assert_eq!(reduced.len(), 2);
        assert!(!reduced.contains(&addr(2)));
        for key in (0..256u64).map(|i| i.wrapping_mul(0x9e37_79b9_7f4a_7c15)) {
            let before = full.node_for_key(key).expect("owner");
            if before != addr(2) {
                assert_eq!(reduced.node_for_key(key), Some(before));
            }
        }
    }

    #[test]
    fn test_adding_existing_node_is_noop() {
        let ring = HashRing::new(2).with_node(addr(1));
        assert_eq!(ring.with_node(addr(1)), ring);
        assert_eq!(ring.replicas(), 2);
    }
}
