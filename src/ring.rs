use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::types::Address;

/// Modulus of the hash space nodes and keys are placed into.
pub const RING_SPAN: u64 = 1 << 32;

/// Every key lives on its primary node and the two ring-successors.
pub const REPLICATION_FACTOR: usize = 3;

/// Maps a key (or a node address) to its position on the ring.
///
/// `DefaultHasher` is SipHash with fixed keys, so positions are stable for
/// every node running the same build, which is all consistent hashing needs.
pub fn position(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish() % RING_SPAN
}

/// A cluster member placed on the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingNode {
    pub addr: Address,
    pub position: u64,
}

/// Ordered, wraparound view of cluster membership. Rebuilt wholesale from
/// each membership snapshot, never mutated in place; traversal is plain
/// index arithmetic modulo the node count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ring {
    nodes: Vec<RingNode>,
}

impl Ring {
    /// Builds a ring from a membership snapshot: sort by position (address
    /// as tie-break), then drop duplicate positions keeping the first.
    pub fn from_members(members: &[Address]) -> Self {
        let mut nodes: Vec<RingNode> = members
            .iter()
            .map(|addr| RingNode {
                addr: addr.clone(),
                position: position(addr.as_str()),
            })
            .collect();
        nodes.sort_by(|a, b| {
            a.position
                .cmp(&b.position)
                .then_with(|| a.addr.cmp(&b.addr))
        });
        nodes.dedup_by(|b, a| a.position == b.position);
        Ring { nodes }
    }

    /// True iff both rings hold the same addresses in the same order.
    pub fn same_membership(&self, other: &Ring) -> bool {
        self.nodes.len() == other.nodes.len()
            && self
                .nodes
                .iter()
                .zip(&other.nodes)
                .all(|(a, b)| a.addr == b.addr)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[RingNode] {
        &self.nodes
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.index_of(addr).is_some()
    }

    fn index_of(&self, addr: &Address) -> Option<usize> {
        self.nodes.iter().position(|n| &n.addr == addr)
    }

    /// Replica set for a ring position: the first node at or past `pos`
    /// (wrapping to the ring's start) plus its two cyclic successors.
    /// Returns fewer than 3 nodes only when the ring itself is smaller.
    pub fn replicas_at(&self, pos: u64) -> Vec<RingNode> {
        if self.nodes.is_empty() {
            return Vec::new();
        }
        let start = self
            .nodes
            .iter()
            .position(|n| n.position >= pos)
            .unwrap_or(0);
        let count = REPLICATION_FACTOR.min(self.nodes.len());
        (0..count)
            .map(|i| self.nodes[(start + i) % self.nodes.len()].clone())
            .collect()
    }

    /// Replica set for a key, PRIMARY first. Pure function of (key, ring).
    pub fn replicas_for(&self, key: &str) -> Vec<RingNode> {
        self.replicas_at(position(key))
    }

    /// The up-to-2 distinct nodes downstream of `addr`, the ones that hold
    /// its primary data as SECONDARY and TERTIARY.
    pub fn successors_of(&self, addr: &Address) -> Vec<Address> {
        self.neighbors_of(addr, |i, k, len| (i + k) % len)
    }

    /// The up-to-2 distinct nodes upstream of `addr`, the ones whose primary
    /// data `addr` replicates.
    pub fn predecessors_of(&self, addr: &Address) -> Vec<Address> {
        self.neighbors_of(addr, |i, k, len| (i + len - k) % len)
    }

    fn neighbors_of(
        &self,
        addr: &Address,
        step: impl Fn(usize, usize, usize) -> usize,
    ) -> Vec<Address> {
        let Some(i) = self.index_of(addr) else {
            return Vec::new();
        };
        let len = self.nodes.len();
        let count = (REPLICATION_FACTOR - 1).min(len - 1);
        (1..=count)
            .map(|k| self.nodes[step(i, k, len)].addr.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_at(positions: &[u64]) -> Ring {
        Ring {
            nodes: positions
                .iter()
                .map(|&p| RingNode {
                    addr: Address(format!("node-{}", p)),
                    position: p,
                })
                .collect(),
        }
    }

    fn positions(nodes: &[RingNode]) -> Vec<u64> {
        nodes.iter().map(|n| n.position).collect()
    }

    #[test]
    fn test_replica_set_walks_the_ring() {
        let ring = ring_at(&[10, 50, 100, 150, 200]);
        assert_eq!(positions(&ring.replicas_at(120)), vec![150, 200, 10]);
        assert_eq!(positions(&ring.replicas_at(50)), vec![50, 100, 150]);
    }

    #[test]
    fn test_replica_set_wraps_past_the_last_node() {
        let ring = ring_at(&[10, 50, 100, 150, 200]);
        assert_eq!(positions(&ring.replicas_at(201)), vec![10, 50, 100]);
        assert_eq!(positions(&ring.replicas_at(5)), vec![10, 50, 100]);
    }

    #[test]
    fn test_replica_set_is_deterministic_and_distinct() {
        let members: Vec<Address> = (0..5).map(|i| Address::new("10.0.0.1", 7000 + i)).collect();
        let ring = Ring::from_members(&members);
        let a = ring.replicas_for("foo");
        let b = ring.replicas_for("foo");
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
        assert_ne!(a[0].addr, a[1].addr);
        assert_ne!(a[1].addr, a[2].addr);
        assert_ne!(a[0].addr, a[2].addr);
    }

    #[test]
    fn test_degraded_ring_returns_fewer_replicas() {
        let members = vec![Address::new("a", 1), Address::new("b", 2)];
        let ring = Ring::from_members(&members);
        assert_eq!(ring.replicas_for("foo").len(), 2);
        assert!(Ring::from_members(&[]).replicas_for("foo").is_empty());
    }

    #[test]
    fn test_membership_change_detection() {
        let a = Address::new("a", 1);
        let b = Address::new("b", 2);
        let c = Address::new("c", 3);
        let r1 = Ring::from_members(&[a.clone(), b.clone(), c.clone()]);
        let r2 = Ring::from_members(&[c, b.clone(), a.clone()]);
        // Snapshot order is irrelevant, only membership matters.
        assert!(r1.same_membership(&r2));
        let r3 = Ring::from_members(&[a, b]);
        assert!(!r1.same_membership(&r3));
    }

    #[test]
    fn test_neighbors_are_cyclic() {
        let ring = ring_at(&[10, 50, 100]);
        let at = |p: u64| Address(format!("node-{}", p));
        assert_eq!(ring.successors_of(&at(100)), vec![at(10), at(50)]);
        assert_eq!(ring.predecessors_of(&at(10)), vec![at(100), at(50)]);
        // Unknown address has no neighbors.
        assert!(ring.successors_of(&at(999)).is_empty());
    }

    #[test]
    fn test_two_node_ring_has_one_distinct_neighbor() {
        let ring = ring_at(&[10, 50]);
        let at = |p: u64| Address(format!("node-{}", p));
        assert_eq!(ring.successors_of(&at(10)), vec![at(50)]);
        assert_eq!(ring.predecessors_of(&at(10)), vec![at(50)]);
    }
}
