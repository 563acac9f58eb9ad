//! Cluster node identity and lifecycle states.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Join order value of a node that has not been admitted to a cluster yet.
pub const JOIN_ORDER_UNASSIGNED: u64 = 0;

static LOCAL_ORDER: AtomicU64 = AtomicU64::new(1);

/// Globally unique 128-bit node identifier.
///
/// A fresh identifier is generated every time a node (re)joins, so an id never
/// outlives a single cluster membership.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generates a new random identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Reconstructs an identifier from its raw 128-bit value.
    #[must_use]
    pub const fn from_u128(raw: u128) -> Self {
        Self(Uuid::from_u128(raw))
    }

    /// Raw 128-bit value, used by wire codecs and topology hashing.
    #[must_use]
    pub const fn as_u128(self) -> u128 {
        self.0.as_u128()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Network address of a node's transport endpoint.
pub type NodeAddress = SocketAddr;

/// Immutable descriptor of a cluster member.
///
/// Roles and properties are fixed at startup; the join order is assigned by
/// the cluster coordinator once the node reaches `Up` and never reused within
/// the same cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier for this incarnation of the node.
    pub id: NodeId,
    /// Transport endpoint peers use to reach this node.
    pub addr: NodeAddress,
    /// Human-readable node name (`hekate-N` unless configured).
    pub name: String,
    /// Roles advertised by this node.
    pub roles: BTreeSet<String>,
    /// Arbitrary string properties advertised by this node.
    pub properties: BTreeMap<String, String>,
    /// Dense, strictly ascending admission index (`1` for the founder).
    pub join_order: u64,
}

impl Node {
    /// Creates a descriptor with a fresh random identity and unassigned
    /// join order.
    #[must_use]
    pub fn new(
        addr: NodeAddress,
        name: Option<String>,
        roles: BTreeSet<String>,
        properties: BTreeMap<String, String>,
    ) -> Self {
        let order = LOCAL_ORDER.fetch_add(1, AtomicOrdering::Relaxed);
        Self {
            id: NodeId::random(),
            addr,
            name: name.unwrap_or_else(|| format!("hekate-{order}")),
            roles,
            properties,
            join_order: JOIN_ORDER_UNASSIGNED,
        }
    }

    /// Whether the cluster has assigned a join order to this node.
    #[must_use]
    pub const fn is_joined(&self) -> bool {
        self.join_order != JOIN_ORDER_UNASSIGNED
    }

    /// Whether this node advertises the given role.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Property lookup by name.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Externally visible lifecycle states of a node instance.
///
/// Transitions are irreversible within a single incarnation; a rejoin starts
/// over from `Down` with a fresh [`NodeId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Initial and terminal state.
    Down,
    /// Services are being brought up and seed discovery is starting.
    Initializing,
    /// Ready to initiate the cluster join.
    Initialized,
    /// Join request sent to a seed node.
    Joining,
    /// Admitted; services are catching up with the cluster.
    Synchronizing,
    /// Fully operational member.
    Up,
    /// Graceful departure announced to peers.
    Leaving,
    /// Services are shutting down; switches to `Down` when done.
    Terminating,
}

impl NodeState {
    /// Whether the node is past `Joining` and participates in the topology.
    #[must_use]
    pub const fn is_joined(self) -> bool {
        matches!(self, Self::Synchronizing | Self::Up | Self::Leaving)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Down => "DOWN",
            Self::Initializing => "INITIALIZING",
            Self::Initialized => "INITIALIZED",
            Self::Joining => "JOINING",
            Self::Synchronizing => "SYNCHRONIZING",
            Self::Up => "UP",
            Self::Leaving => "LEAVING",
            Self::Terminating => "TERMINATING",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_node(port: u16) -> Node {
        Node::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            None,
            BTreeSet::new(),
            BTreeMap::new(),
        )
    }

    #[test]
    fn fresh_nodes_have_distinct_ids() {
        let a = test_node(10_001);
        let b = test_node(10_001);
        assert_ne!(a.id, b.id);
        assert_ne!(a.name, b.name);
    }

    #[test]
    fn join_order_starts_unassigned() {
        let node = test_node(10_002);
        assert!(!node.is_joined());
        assert_eq!(node.join_order, JOIN_ORDER_UNASSIGNED);
    }

    #[test]
    fn nodes_order_by_id() {
        let mut a = test_node(10_003);
        let mut b = test_node(10_004);
        a.id = NodeId::from_u128(1);
        b.id = NodeId::from_u128(2);
        assert!(a < b);
    }

    #[test]
    fn joined_states() {
        assert!(NodeState::Up.is_joined());
        assert!(NodeState::Synchronizing.is_joined());
        assert!(!NodeState::Joining.is_joined());
        assert!(!NodeState::Down.is_joined());
    }
}
