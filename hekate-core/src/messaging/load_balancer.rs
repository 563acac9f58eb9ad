//! Routing policy contract and built-in balancers.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::cluster::Topology;
use crate::messaging::failover::FailureInfo;
use crate::node::NodeId;

/// Everything a balancer may consult for one physical send (retries
/// included).
pub struct LoadBalancerContext<'a> {
    /// Topology the request may route to (channel filter applied).
    pub topology: &'a Topology,
    /// Affinity hash, when the request carries an affinity key.
    pub affinity: Option<u32>,
    /// Failure of the previous attempt, present on retries.
    pub failure: Option<&'a FailureInfo>,
}

/// Picks the target node for one physical send.
///
/// Must be deterministic for identical contexts when an affinity is
/// present; `None` means no suitable receiver and fails the routing.
pub trait LoadBalancer: Send + Sync {
    /// Chooses a node from the context's topology.
    fn route(&self, ctx: &LoadBalancerContext<'_>) -> Option<NodeId>;
}

impl<F> LoadBalancer for F
where
    F: Fn(&LoadBalancerContext<'_>) -> Option<NodeId> + Send + Sync,
{
    fn route(&self, ctx: &LoadBalancerContext<'_>) -> Option<NodeId> {
        self(ctx)
    }
}

/// Default balancer: affinity keys map deterministically onto the sorted
/// node set, everything else round-robins. Retries avoid the failed node
/// when an alternative exists.
pub struct DefaultLoadBalancer {
    counter: AtomicUsize,
}

impl DefaultLoadBalancer {
    /// Creates the balancer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for DefaultLoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for DefaultLoadBalancer {
    fn route(&self, ctx: &LoadBalancerContext<'_>) -> Option<NodeId> {
        let exclude = ctx.failure.and_then(|failure| failure.last_node);
        let candidates: Vec<NodeId> = ctx
            .topology
            .nodes()
            .map(|node| node.id)
            .filter(|id| exclude != Some(*id) || ctx.topology.size() == 1)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let index = match ctx.affinity {
            Some(affinity) => affinity as usize % candidates.len(),
            None => self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len(),
        };
        Some(candidates[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    use crate::node::Node;

    fn topology(ids: &[u128]) -> Topology {
        let nodes = ids
            .iter()
            .map(|id| {
                let mut node = Node::new(
                    format!("127.0.0.1:{}", 23_000 + *id as u16).parse().unwrap(),
                    None,
                    BTreeSet::new(),
                    BTreeMap::new(),
                );
                node.id = NodeId::from_u128(*id);
                node.join_order = *id as u64;
                node
            })
            .collect();
        Topology::new(1, nodes)
    }

    #[test]
    fn affinity_routes_deterministically() {
        let balancer = DefaultLoadBalancer::new();
        let topology = topology(&[1, 2, 3]);
        let ctx = LoadBalancerContext {
            topology: &topology,
            affinity: Some(17),
            failure: None,
        };
        let first = balancer.route(&ctx).unwrap();
        for _ in 0..10 {
            assert_eq!(balancer.route(&ctx).unwrap(), first);
        }
    }

    #[test]
    fn round_robin_covers_all_nodes() {
        let balancer = DefaultLoadBalancer::new();
        let topology = topology(&[1, 2, 3]);
        let mut seen = BTreeSet::new();
        for _ in 0..3 {
            let ctx = LoadBalancerContext {
                topology: &topology,
                affinity: None,
                failure: None,
            };
            seen.insert(balancer.route(&ctx).unwrap());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn retry_avoids_failed_node() {
        let balancer = DefaultLoadBalancer::new();
        let topology = topology(&[1, 2]);
        let failure = FailureInfo {
            attempt: 1,
            last_node: Some(NodeId::from_u128(1)),
            error: "read timed out".into(),
        };
        for _ in 0..5 {
            let ctx = LoadBalancerContext {
                topology: &topology,
                affinity: None,
                failure: Some(&failure),
            };
            assert_eq!(balancer.route(&ctx).unwrap(), NodeId::from_u128(2));
        }
    }

    #[test]
    fn empty_topology_routes_nowhere() {
        let balancer = DefaultLoadBalancer::new();
        let topology = topology(&[]);
        let ctx = LoadBalancerContext {
            topology: &topology,
            affinity: None,
            failure: None,
        };
        assert!(balancer.route(&ctx).is_none());
    }
}
