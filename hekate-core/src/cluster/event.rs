//! Cluster membership events.

use std::fmt;

use crate::cluster::topology::Topology;
use crate::node::Node;

/// Event delivered to cluster listeners, strictly ordered by topology
/// version per listener.
#[derive(Clone)]
pub enum ClusterEvent {
    /// Local node joined; the first event every listener observes.
    Join(Topology),
    /// Membership changed while the local node stayed in the cluster.
    Change {
        /// Topology after the change.
        topology: Topology,
        /// Members present now but not before.
        added: Vec<Node>,
        /// Members present before but not now.
        removed: Vec<Node>,
    },
    /// Local node left; the last event every listener observes.
    Leave(Topology),
}

impl ClusterEvent {
    /// Topology carried by the event.
    #[must_use]
    pub fn topology(&self) -> &Topology {
        match self {
            Self::Join(topology) | Self::Leave(topology) => topology,
            Self::Change { topology, .. } => topology,
        }
    }

    /// Whether this is the terminal leave event.
    #[must_use]
    pub const fn is_leave(&self) -> bool {
        matches!(self, Self::Leave(_))
    }
}

impl fmt::Debug for ClusterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Join(topology) => f.debug_tuple("Join").field(&topology.version()).finish(),
            Self::Change {
                topology,
                added,
                removed,
            } => f
                .debug_struct("Change")
                .field("version", &topology.version())
                .field("added", &added.len())
                .field("removed", &removed.len())
                .finish(),
            Self::Leave(topology) => f.debug_tuple("Leave").field(&topology.version()).finish(),
        }
    }
}
