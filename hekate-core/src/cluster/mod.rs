//! Cluster membership: gossip engine, topology views, split-brain handling.

/// Error types surfaced by the membership subsystem.
pub mod error;
/// Membership events delivered to listeners.
pub mod event;
/// Versioned gossip roster and merge rules.
pub mod gossip;
/// Join validation chain.
pub mod join;
/// Gossip wire protocol.
pub mod protocol;
/// The membership service itself.
pub mod service;
/// Split-brain detection hooks.
pub mod split_brain;
/// Immutable topology snapshots.
pub mod topology;
/// Observable, filterable topology views.
pub mod view;

pub use error::ClusterError;
pub use event::ClusterEvent;
pub use gossip::{GossipDigest, GossipEntry, GossipState, GossipStatus};
pub use join::{AddressFamilyValidator, ClusterNameValidator, JoinAttempt, JoinValidator};
pub use protocol::{GossipCodec, GossipMessage};
pub use service::{CLUSTER_PROTOCOL, ClusterFault, ClusterService};
pub use split_brain::{
    AddressReachabilityDetector, GroupDetector, SplitBrainAction, SplitBrainDetector,
};
pub use topology::{Topology, TopologyHash};
pub use view::{ClusterEventFn, ClusterView};
