//! Gossip roster: versioned rumors, suspicion tracking, join-order
//! assignment.
//!
//! The roster is pure state; the cluster service serializes all mutations on
//! its gossip task and drives I/O separately, which keeps the merge rules
//! unit-testable.

use std::collections::{BTreeMap, BTreeSet};

use crate::node::{JOIN_ORDER_UNASSIGNED, Node, NodeId};

/// Membership status carried by gossip rumors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GossipStatus {
    /// Accepted but not yet admitted by the coordinator.
    Joining,
    /// Full member.
    Up,
    /// Announced graceful departure.
    Leaving,
    /// Gracefully departed.
    Down,
    /// Declared failed by suspicion quorum.
    Failed,
}

impl GossipStatus {
    /// Tie-break precedence when rumor versions are equal:
    /// `Failed > Down > Leaving > Up > Joining`.
    #[must_use]
    pub const fn precedence(self) -> u8 {
        match self {
            Self::Joining => 0,
            Self::Up => 1,
            Self::Leaving => 2,
            Self::Down => 3,
            Self::Failed => 4,
        }
    }

    /// Whether a node in this status participates in the visible topology.
    #[must_use]
    pub const fn is_member(self) -> bool {
        matches!(self, Self::Up | Self::Leaving)
    }

    /// Whether a node in this status is worth gossiping with.
    #[must_use]
    pub const fn is_reachable(self) -> bool {
        matches!(self, Self::Joining | Self::Up | Self::Leaving)
    }

    pub(crate) const fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Joining),
            1 => Some(Self::Up),
            2 => Some(Self::Leaving),
            3 => Some(Self::Down),
            4 => Some(Self::Failed),
            _ => None,
        }
    }

    pub(crate) const fn to_wire(self) -> u8 {
        self.precedence()
    }
}

/// One roster entry, gossiped between peers as a rumor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipEntry {
    /// Node descriptor (join order included once assigned).
    pub node: Node,
    /// Reported status.
    pub status: GossipStatus,
    /// Lamport-style counter bumped on every modification by the entry's
    /// writer.
    pub version: u64,
    /// Ids of nodes that currently suspect this node.
    pub suspicions: BTreeSet<NodeId>,
}

impl GossipEntry {
    /// Fresh entry for a node that just appeared.
    #[must_use]
    pub fn new(node: Node, status: GossipStatus) -> Self {
        Self {
            node,
            status,
            version: 1,
            suspicions: BTreeSet::new(),
        }
    }
}

/// Compact per-node summary used to decide what to exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GossipDigest {
    /// Node id.
    pub id: NodeId,
    /// Status known to the digest's sender.
    pub status: GossipStatus,
    /// Version known to the digest's sender.
    pub version: u64,
}

/// The local node's view of every known peer.
#[derive(Debug)]
pub struct GossipState {
    local_id: NodeId,
    entries: BTreeMap<NodeId, GossipEntry>,
    epoch: u64,
}

impl GossipState {
    /// Creates a roster seeded with the local node's entry.
    #[must_use]
    pub fn new(local: GossipEntry) -> Self {
        let local_id = local.node.id;
        let mut entries = BTreeMap::new();
        entries.insert(local_id, local);
        Self {
            local_id,
            entries,
            epoch: 0,
        }
    }

    /// Cluster-wide membership epoch: bumped by the coordinator on every
    /// admission, failure or retirement, merged as a maximum. Topology
    /// versions observed locally never fall below it.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Adopts a remotely observed epoch.
    pub fn merge_epoch(&mut self, epoch: u64) {
        self.epoch = self.epoch.max(epoch);
    }

    /// Bumps the epoch after a membership change driven locally.
    pub fn bump_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    /// Local node id.
    #[must_use]
    pub const fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// The local node's own entry.
    #[must_use]
    pub fn local(&self) -> &GossipEntry {
        &self.entries[&self.local_id]
    }

    /// Entry lookup.
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&GossipEntry> {
        self.entries.get(&id)
    }

    /// All entries in id order.
    pub fn entries(&self) -> impl Iterator<Item = &GossipEntry> {
        self.entries.values()
    }

    /// Mutates the local entry and bumps its version.
    pub fn update_local(&mut self, update: impl FnOnce(&mut GossipEntry)) {
        if let Some(entry) = self.entries.get_mut(&self.local_id) {
            update(entry);
            entry.version += 1;
        }
    }

    /// Adds a freshly accepted joiner to the roster.
    pub fn add_joining(&mut self, node: Node) {
        self.entries
            .entry(node.id)
            .or_insert_with(|| GossipEntry::new(node, GossipStatus::Joining));
    }

    /// Compact summary of every entry.
    #[must_use]
    pub fn digest(&self) -> Vec<GossipDigest> {
        self.entries
            .values()
            .map(|entry| GossipDigest {
                id: entry.node.id,
                status: entry.status,
                version: entry.version,
            })
            .collect()
    }

    /// Entries the digest's sender has not seen yet (missing, older, or
    /// lower-precedence at equal version).
    #[must_use]
    pub fn deltas_for(&self, digest: &[GossipDigest]) -> Vec<GossipEntry> {
        let known: BTreeMap<NodeId, &GossipDigest> =
            digest.iter().map(|entry| (entry.id, entry)).collect();
        self.entries
            .values()
            .filter(|entry| match known.get(&entry.node.id) {
                None => true,
                Some(theirs) => {
                    entry.version > theirs.version
                        || (entry.version == theirs.version
                            && entry.status.precedence() > theirs.status.precedence())
                }
            })
            .cloned()
            .collect()
    }

    /// Merges incoming rumors. Per node the higher version wins; ties break
    /// by status precedence and union-merge their suspicion sets. A
    /// strictly newer entry is authoritative for its suspicions too, which
    /// is what lets a recovered peer clear stale ones.
    /// Returns whether anything changed.
    pub fn merge(&mut self, rumors: impl IntoIterator<Item = GossipEntry>) -> bool {
        let mut changed = false;
        for rumor in rumors {
            let id = rumor.node.id;
            match self.entries.get_mut(&id) {
                None => {
                    self.entries.insert(id, rumor);
                    changed = true;
                }
                Some(current) => {
                    if rumor.version > current.version {
                        let keep_order = if rumor.node.join_order == JOIN_ORDER_UNASSIGNED {
                            current.node.join_order
                        } else {
                            rumor.node.join_order
                        };
                        *current = rumor;
                        current.node.join_order = keep_order;
                        changed = true;
                    } else if rumor.version == current.version {
                        if rumor.status.precedence() > current.status.precedence() {
                            current.status = rumor.status;
                            changed = true;
                        }
                        let before = current.suspicions.len();
                        current.suspicions.extend(rumor.suspicions.iter().copied());
                        if current.suspicions.len() > before {
                            changed = true;
                        }
                        if current.node.join_order == JOIN_ORDER_UNASSIGNED
                            && rumor.node.join_order != JOIN_ORDER_UNASSIGNED
                        {
                            current.node.join_order = rumor.node.join_order;
                            changed = true;
                        }
                    } else if current.node.join_order == JOIN_ORDER_UNASSIGNED
                        && rumor.node.join_order != JOIN_ORDER_UNASSIGNED
                    {
                        current.node.join_order = rumor.node.join_order;
                        changed = true;
                    }
                }
            }
        }
        changed
    }

    /// Records that `by` suspects `target`, bumping the target's entry so
    /// the suspicion propagates. Returns whether the set grew.
    pub fn suspect(&mut self, by: NodeId, target: NodeId) -> bool {
        match self.entries.get_mut(&target) {
            Some(entry) if entry.status.is_reachable() => {
                if entry.suspicions.insert(by) {
                    entry.version += 1;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// Clears a suspicion after successful contact.
    pub fn unsuspect(&mut self, by: NodeId, target: NodeId) {
        if let Some(entry) = self.entries.get_mut(&target) {
            if entry.suspicions.remove(&by) {
                entry.version += 1;
            }
        }
    }

    /// Current coordinator: the oldest `Up` member, falling back to the
    /// lowest node id while join orders are still unassigned.
    #[must_use]
    pub fn coordinator(&self) -> Option<&GossipEntry> {
        self.entries
            .values()
            .filter(|entry| entry.status == GossipStatus::Up)
            .min_by_key(|entry| {
                let order = if entry.node.join_order == JOIN_ORDER_UNASSIGNED {
                    u64::MAX
                } else {
                    entry.node.join_order
                };
                (order, entry.node.id)
            })
    }

    /// Whether the local node currently acts as coordinator.
    #[must_use]
    pub fn local_is_coordinator(&self) -> bool {
        self.coordinator()
            .is_some_and(|entry| entry.node.id == self.local_id)
    }

    /// Coordinator duty: admit `Joining` nodes with dense ascending join
    /// orders. Returns the admitted node ids.
    pub fn assign_join_orders(&mut self) -> Vec<NodeId> {
        let mut next_order = self
            .entries
            .values()
            .map(|entry| entry.node.join_order)
            .max()
            .unwrap_or(JOIN_ORDER_UNASSIGNED)
            + 1;

        let joining: Vec<NodeId> = self
            .entries
            .values()
            .filter(|entry| entry.status == GossipStatus::Joining)
            .map(|entry| entry.node.id)
            .collect();

        let mut admitted = Vec::with_capacity(joining.len());
        for id in joining {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.status = GossipStatus::Up;
                entry.node.join_order = next_order;
                entry.version += 1;
                admitted.push(id);
                next_order += 1;
                self.epoch += 1;
            }
        }
        admitted
    }

    /// Coordinator duty: retire acknowledged leavers from the membership.
    /// Returns the retired node ids.
    pub fn retire_leaving(&mut self) -> Vec<NodeId> {
        let mut retired = Vec::new();
        for entry in self.entries.values_mut() {
            if entry.status == GossipStatus::Leaving && entry.node.id != self.local_id {
                entry.status = GossipStatus::Down;
                entry.version += 1;
                self.epoch += 1;
                retired.push(entry.node.id);
            }
        }
        retired
    }

    /// Applies the failure quorum: a suspect becomes `Failed` once the
    /// suspicions from eligible voters (other `Up` members) strictly exceed
    /// `fraction * voters`. Returns newly failed node ids.
    pub fn apply_failure_quorum(&mut self, fraction: f64) -> Vec<NodeId> {
        let up_members: BTreeSet<NodeId> = self
            .entries
            .values()
            .filter(|entry| entry.status == GossipStatus::Up)
            .map(|entry| entry.node.id)
            .collect();

        let candidates: Vec<NodeId> = self
            .entries
            .values()
            .filter(|entry| entry.status.is_reachable() && !entry.suspicions.is_empty())
            .map(|entry| entry.node.id)
            .collect();

        let mut failed = Vec::new();
        for id in candidates {
            let voters = up_members.iter().filter(|voter| **voter != id).count();
            if voters == 0 {
                continue;
            }
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            let votes = entry
                .suspicions
                .iter()
                .filter(|s| up_members.contains(s) && **s != id)
                .count();
            if votes as f64 > fraction * voters as f64 {
                entry.status = GossipStatus::Failed;
                entry.version += 1;
                self.epoch += 1;
                failed.push(id);
            }
        }
        failed
    }

    /// Nodes of the visible topology (`Up` and `Leaving` members).
    #[must_use]
    pub fn topology_nodes(&self) -> BTreeSet<Node> {
        self.entries
            .values()
            .filter(|entry| entry.status.is_member())
            .map(|entry| entry.node.clone())
            .collect()
    }

    /// Peers worth gossiping with (reachable, not the local node).
    #[must_use]
    pub fn gossip_peers(&self) -> Vec<Node> {
        self.entries
            .values()
            .filter(|entry| entry.status.is_reachable() && entry.node.id != self.local_id)
            .map(|entry| entry.node.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn node(id: u128) -> Node {
        let mut node = Node::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 20_000 + id as u16),
            Some(format!("n{id}")),
            BTreeSet::new(),
            Map::new(),
        );
        node.id = NodeId::from_u128(id);
        node
    }

    fn founder_state() -> GossipState {
        let mut founder = node(1);
        founder.join_order = 1;
        GossipState::new(GossipEntry::new(founder, GossipStatus::Up))
    }

    #[test]
    fn higher_version_wins_merge() {
        let mut state = founder_state();
        let mut entry = GossipEntry::new(node(2), GossipStatus::Up);
        entry.version = 3;
        state.merge([entry.clone()]);

        let mut stale = entry.clone();
        stale.version = 2;
        stale.status = GossipStatus::Down;
        assert!(!state.merge([stale]));
        assert_eq!(state.get(NodeId::from_u128(2)).unwrap().status, GossipStatus::Up);

        let mut newer = entry;
        newer.version = 4;
        newer.status = GossipStatus::Leaving;
        assert!(state.merge([newer]));
        assert_eq!(
            state.get(NodeId::from_u128(2)).unwrap().status,
            GossipStatus::Leaving
        );
    }

    #[test]
    fn equal_version_breaks_by_status_precedence() {
        let mut state = founder_state();
        let mut up = GossipEntry::new(node(2), GossipStatus::Up);
        up.version = 5;
        state.merge([up]);

        let mut failed = GossipEntry::new(node(2), GossipStatus::Failed);
        failed.version = 5;
        assert!(state.merge([failed]));
        assert_eq!(
            state.get(NodeId::from_u128(2)).unwrap().status,
            GossipStatus::Failed
        );
    }

    #[test]
    fn suspicions_union_merge_at_equal_version() {
        let mut state = founder_state();
        let mut entry = GossipEntry::new(node(2), GossipStatus::Up);
        entry.version = 2;
        entry.suspicions.insert(NodeId::from_u128(7));
        state.merge([entry]);

        // Concurrent suspicion at the same version is unioned in.
        let mut concurrent = GossipEntry::new(node(2), GossipStatus::Up);
        concurrent.version = 2;
        concurrent.suspicions.insert(NodeId::from_u128(8));
        assert!(state.merge([concurrent]));

        let merged = state.get(NodeId::from_u128(2)).unwrap();
        assert_eq!(merged.suspicions.len(), 2);
        assert_eq!(merged.version, 2);
    }

    #[test]
    fn newer_entry_clears_stale_suspicions() {
        let mut state = founder_state();
        let mut suspected = GossipEntry::new(node(2), GossipStatus::Up);
        suspected.version = 2;
        suspected.suspicions.insert(NodeId::from_u128(1));
        state.merge([suspected]);

        // The peer recovered and published a newer view of itself.
        let mut recovered = GossipEntry::new(node(2), GossipStatus::Up);
        recovered.version = 3;
        assert!(state.merge([recovered]));
        assert!(state.get(NodeId::from_u128(2)).unwrap().suspicions.is_empty());
    }

    #[test]
    fn deltas_cover_missing_and_stale() {
        let mut state = founder_state();
        let mut entry = GossipEntry::new(node(2), GossipStatus::Up);
        entry.version = 4;
        state.merge([entry]);

        // Peer knows nothing about node 2 and has an older local entry.
        let digest = vec![GossipDigest {
            id: NodeId::from_u128(1),
            status: GossipStatus::Up,
            version: 1,
        }];
        let deltas = state.deltas_for(&digest);
        let ids: Vec<u128> = deltas.iter().map(|e| e.node.id.as_u128()).collect();
        assert_eq!(ids, vec![2]);

        // Peer fully caught up: nothing to ship.
        let digest = state.digest();
        assert!(state.deltas_for(&digest).is_empty());
    }

    #[test]
    fn join_orders_are_dense_and_ascending() {
        let mut state = founder_state();
        state.add_joining(node(2));
        state.add_joining(node(3));

        let admitted = state.assign_join_orders();
        assert_eq!(admitted.len(), 2);

        let orders: BTreeSet<u64> = state
            .entries()
            .map(|entry| entry.node.join_order)
            .collect();
        assert_eq!(orders, [1, 2, 3].into_iter().collect());
        assert!(state
            .entries()
            .all(|entry| entry.status == GossipStatus::Up));
    }

    #[test]
    fn failure_quorum_majority() {
        let mut state = founder_state();
        for id in 2..=3 {
            let mut entry = GossipEntry::new(node(id), GossipStatus::Up);
            entry.node.join_order = id as u64;
            entry.version = 2;
            state.merge([entry]);
        }

        // One of three members suspects node 3: not enough.
        state.suspect(NodeId::from_u128(1), NodeId::from_u128(3));
        assert!(state.apply_failure_quorum(0.5).is_empty());

        // Second voter pushes it over the majority.
        state.suspect(NodeId::from_u128(2), NodeId::from_u128(3));
        let failed = state.apply_failure_quorum(0.5);
        assert_eq!(failed, vec![NodeId::from_u128(3)]);
        assert_eq!(
            state.get(NodeId::from_u128(3)).unwrap().status,
            GossipStatus::Failed
        );
    }

    #[test]
    fn two_node_cluster_single_suspicion_suffices() {
        let mut state = founder_state();
        let mut peer = GossipEntry::new(node(2), GossipStatus::Up);
        peer.node.join_order = 2;
        state.merge([peer]);

        state.suspect(NodeId::from_u128(1), NodeId::from_u128(2));
        let failed = state.apply_failure_quorum(0.5);
        assert_eq!(failed, vec![NodeId::from_u128(2)]);
    }

    #[test]
    fn coordinator_is_oldest_up() {
        let mut state = founder_state();
        let mut peer = GossipEntry::new(node(2), GossipStatus::Up);
        peer.node.join_order = 2;
        state.merge([peer]);

        assert_eq!(state.coordinator().unwrap().node.id, NodeId::from_u128(1));
        assert!(state.local_is_coordinator());
    }

    #[test]
    fn topology_excludes_failed_and_down() {
        let mut state = founder_state();
        let mut leaving = GossipEntry::new(node(2), GossipStatus::Leaving);
        leaving.node.join_order = 2;
        let mut down = GossipEntry::new(node(3), GossipStatus::Down);
        down.node.join_order = 3;
        let mut failed = GossipEntry::new(node(4), GossipStatus::Failed);
        failed.node.join_order = 4;
        state.merge([leaving, down, failed]);

        let ids: Vec<u128> = state
            .topology_nodes()
            .iter()
            .map(|node| node.id.as_u128())
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn join_order_survives_unassigned_rumor() {
        let mut state = founder_state();
        let mut assigned = GossipEntry::new(node(2), GossipStatus::Up);
        assigned.node.join_order = 2;
        assigned.version = 2;
        state.merge([assigned]);

        // Newer rumor from a node that has not yet learned the join order.
        let mut unassigned = GossipEntry::new(node(2), GossipStatus::Up);
        unassigned.node.join_order = JOIN_ORDER_UNASSIGNED;
        unassigned.version = 3;
        state.merge([unassigned]);

        assert_eq!(state.get(NodeId::from_u128(2)).unwrap().node.join_order, 2);
    }
}
