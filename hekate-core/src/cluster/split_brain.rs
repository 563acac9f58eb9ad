//! Split-brain detection hooks.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cluster::ClusterError;
use crate::network::{NetworkService, PingResult};
use crate::node::Node;

pub use crate::config::SplitBrainAction;

/// Decides whether the local node is still part of the real cluster.
///
/// Consulted at join time (repeatedly while invalid) and whenever gossip
/// leaves this node as the only remaining `Up` member of a recent
/// partition. A detector error terminates the node unconditionally.
#[async_trait]
pub trait SplitBrainDetector: Send + Sync {
    /// `true` when the local node's view of the world is trustworthy.
    async fn is_valid(&self, local: &Node) -> Result<bool, ClusterError>;
}

/// Detector that considers the local node valid while a well-known address
/// (a gateway, a load balancer, a quorum host) answers transport pings.
pub struct AddressReachabilityDetector {
    target: SocketAddr,
    network: Arc<NetworkService>,
}

impl AddressReachabilityDetector {
    /// Creates a detector probing `target` through the local transport.
    #[must_use]
    pub fn new(target: SocketAddr, network: Arc<NetworkService>) -> Self {
        Self { target, network }
    }
}

#[async_trait]
impl SplitBrainDetector for AddressReachabilityDetector {
    async fn is_valid(&self, _local: &Node) -> Result<bool, ClusterError> {
        Ok(matches!(
            self.network.ping(self.target).await,
            PingResult::Success
        ))
    }
}

/// Detector composed of several others; all must report valid.
pub struct GroupDetector {
    detectors: Vec<Arc<dyn SplitBrainDetector>>,
}

impl GroupDetector {
    /// Groups the given detectors.
    #[must_use]
    pub fn new(detectors: Vec<Arc<dyn SplitBrainDetector>>) -> Self {
        Self { detectors }
    }
}

#[async_trait]
impl SplitBrainDetector for GroupDetector {
    async fn is_valid(&self, local: &Node) -> Result<bool, ClusterError> {
        for detector in &self.detectors {
            if !detector.is_valid(local).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
