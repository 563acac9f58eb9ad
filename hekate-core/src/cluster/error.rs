//! Errors surfaced by the membership subsystem.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::network::NetworkError;
use crate::seed::SeedError;

/// Membership failures.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// A join validator on the contacted node refused this node.
    #[error("join rejected by {rejected_by}: {reason}")]
    JoinRejected {
        /// Reason produced by the validator chain.
        reason: String,
        /// Address of the rejecting node.
        rejected_by: SocketAddr,
    },
    /// The join sequence did not reach `Up` in time.
    #[error("join timed out after {0:?}")]
    JoinTimeout(Duration),
    /// Seed discovery failed.
    #[error(transparent)]
    Seed(#[from] SeedError),
    /// Transport failure while talking to peers.
    #[error(transparent)]
    Network(#[from] NetworkError),
    /// A topology future was cancelled because the node left.
    #[error("topology future cancelled")]
    FutureCancelled,
    /// Operation requires cluster membership.
    #[error("local node is not joined")]
    NotJoined,
    /// The split-brain detector itself failed; the node terminates.
    #[error("split-brain detector failed: {0}")]
    DetectorFailure(String),
    /// The node was terminated while the operation was in flight.
    #[error("node terminated")]
    Terminated,
}
