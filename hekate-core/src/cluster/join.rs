//! Join validation chain run by the contacted node.

use async_trait::async_trait;

use crate::node::Node;

/// Everything a validator can inspect about a join attempt.
pub struct JoinAttempt<'a> {
    /// Node requesting admission.
    pub joining: &'a Node,
    /// Cluster name carried in the join request.
    pub cluster: &'a str,
    /// Cluster name of the validating node.
    pub local_cluster: &'a str,
    /// The validating node.
    pub local: &'a Node,
}

/// One link of the join validation chain. Returning a reason rejects the
/// join; the reason travels back to the joiner verbatim.
#[async_trait]
pub trait JoinValidator: Send + Sync {
    /// Inspects the attempt; `None` accepts.
    async fn validate(&self, attempt: &JoinAttempt<'_>) -> Option<String>;
}

/// Rejects joiners that target a differently named cluster.
pub struct ClusterNameValidator;

#[async_trait]
impl JoinValidator for ClusterNameValidator {
    async fn validate(&self, attempt: &JoinAttempt<'_>) -> Option<String> {
        if attempt.cluster == attempt.local_cluster {
            None
        } else {
            Some(format!(
                "cluster name mismatch: joining '{}', local '{}'",
                attempt.cluster, attempt.local_cluster
            ))
        }
    }
}

/// Rejects joiners whose address family differs from the local node's.
pub struct AddressFamilyValidator;

#[async_trait]
impl JoinValidator for AddressFamilyValidator {
    async fn validate(&self, attempt: &JoinAttempt<'_>) -> Option<String> {
        if attempt.joining.addr.is_ipv4() == attempt.local.addr.is_ipv4() {
            None
        } else {
            Some("address family mismatch".to_string())
        }
    }
}

/// Runs the chain in order; the first rejection wins.
pub(crate) async fn run_validators(
    validators: &[std::sync::Arc<dyn JoinValidator>],
    attempt: &JoinAttempt<'_>,
) -> Option<String> {
    for validator in validators {
        if let Some(reason) = validator.validate(attempt).await {
            return Some(reason);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    fn node(addr: &str) -> Node {
        Node::new(addr.parse().unwrap(), None, BTreeSet::new(), BTreeMap::new())
    }

    #[tokio::test]
    async fn cluster_name_must_match() {
        let joining = node("127.0.0.1:1001");
        let local = node("127.0.0.1:1002");
        let attempt = JoinAttempt {
            joining: &joining,
            cluster: "a",
            local_cluster: "b",
            local: &local,
        };
        let reason = ClusterNameValidator.validate(&attempt).await.unwrap();
        assert!(reason.contains("mismatch"));
    }

    #[tokio::test]
    async fn address_family_must_match() {
        let joining = node("[::1]:1001");
        let local = node("127.0.0.1:1002");
        let attempt = JoinAttempt {
            joining: &joining,
            cluster: "a",
            local_cluster: "a",
            local: &local,
        };
        assert!(AddressFamilyValidator.validate(&attempt).await.is_some());
    }
}
