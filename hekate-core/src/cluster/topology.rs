//! Immutable cluster topology snapshots.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::node::{Node, NodeId};

/// 128-bit content digest of a sorted node-id set.
///
/// Remote peers compare hashes instead of full node sets to detect stale
/// views cheaply.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopologyHash([u8; 16]);

impl TopologyHash {
    /// Computes the digest over node ids in ascending order.
    #[must_use]
    pub fn of<'a>(ids: impl IntoIterator<Item = &'a NodeId>) -> Self {
        let mut hasher = Sha256::new();
        for id in ids {
            hasher.update(id.as_u128().to_be_bytes());
        }
        let digest = hasher.finalize();
        let mut hash = [0u8; 16];
        hash.copy_from_slice(&digest[..16]);
        Self(hash)
    }

    /// Raw digest bytes for wire codecs.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Reconstructs a digest from wire bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for TopologyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for TopologyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TopologyHash({self})")
    }
}

/// Immutable membership snapshot with a monotonic local version.
///
/// Versions are strictly increasing for the lifetime of the local instance;
/// they restart after a rejoin.
#[derive(Clone)]
pub struct Topology {
    version: u64,
    nodes: Arc<BTreeSet<Node>>,
    hash: TopologyHash,
}

impl Topology {
    /// Builds a snapshot; the hash is fixed at construction.
    #[must_use]
    pub fn new(version: u64, nodes: BTreeSet<Node>) -> Self {
        let hash = TopologyHash::of(nodes.iter().map(|node| &node.id));
        Self {
            version,
            nodes: Arc::new(nodes),
            hash,
        }
    }

    /// Empty topology with version zero (pre-join placeholder).
    #[must_use]
    pub fn empty() -> Self {
        Self::new(0, BTreeSet::new())
    }

    /// Snapshot version.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Content hash of the node-id set.
    #[must_use]
    pub const fn hash(&self) -> TopologyHash {
        self.hash
    }

    /// Member count.
    #[must_use]
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the snapshot has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Members in node-id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Member lookup by id.
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == id)
    }

    /// Whether the member is part of this snapshot.
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Member with the lowest join order.
    #[must_use]
    pub fn oldest(&self) -> Option<&Node> {
        self.nodes.iter().min_by_key(|node| node.join_order)
    }

    /// Member with the highest join order.
    #[must_use]
    pub fn youngest(&self) -> Option<&Node> {
        self.nodes.iter().max_by_key(|node| node.join_order)
    }

    /// Derived snapshot containing only matching members. Keeps the parent
    /// version (and therefore recomputes the hash).
    #[must_use]
    pub fn filter(&self, predicate: impl Fn(&Node) -> bool) -> Self {
        let nodes: BTreeSet<Node> = self
            .nodes
            .iter()
            .filter(|node| predicate(node))
            .cloned()
            .collect();
        Self::new(self.version, nodes)
    }
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("version", &self.version)
            .field("size", &self.nodes.len())
            .field("hash", &self.hash)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet as Set};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn node(id: u128, join_order: u64, port: u16) -> Node {
        let mut node = Node::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            Some(format!("n{id}")),
            Set::new(),
            BTreeMap::new(),
        );
        node.id = NodeId::from_u128(id);
        node.join_order = join_order;
        node
    }

    #[test]
    fn oldest_and_youngest_by_join_order() {
        let nodes: BTreeSet<Node> =
            [node(3, 1, 1), node(1, 3, 2), node(2, 2, 3)].into_iter().collect();
        let topology = Topology::new(7, nodes);
        assert_eq!(topology.oldest().unwrap().join_order, 1);
        assert_eq!(topology.youngest().unwrap().join_order, 3);
        assert_eq!(topology.version(), 7);
        assert_eq!(topology.size(), 3);
    }

    #[test]
    fn hash_depends_only_on_id_set() {
        let a = Topology::new(1, [node(1, 1, 1), node(2, 2, 2)].into_iter().collect());
        let b = Topology::new(9, [node(2, 5, 9), node(1, 7, 8)].into_iter().collect());
        assert_eq!(a.hash(), b.hash());

        let c = Topology::new(1, [node(1, 1, 1), node(3, 2, 2)].into_iter().collect());
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn filter_keeps_version() {
        let topology = Topology::new(4, [node(1, 1, 1), node(2, 2, 2)].into_iter().collect());
        let filtered = topology.filter(|node| node.join_order == 1);
        assert_eq!(filtered.version(), 4);
        assert_eq!(filtered.size(), 1);
        assert_ne!(filtered.hash(), topology.hash());
    }

    #[test]
    fn empty_topology() {
        let topology = Topology::empty();
        assert!(topology.is_empty());
        assert!(topology.oldest().is_none());
        assert_eq!(topology.version(), 0);
    }
}
