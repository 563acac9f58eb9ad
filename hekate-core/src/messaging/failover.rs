//! Failover policy contracts applied to failed sends.

use crate::messaging::MessagingError;
use crate::node::NodeId;

/// Context handed to failover policies after a failed attempt.
#[derive(Debug, Clone)]
pub struct FailureInfo {
    /// 1-based attempt number that just failed.
    pub attempt: usize,
    /// Node the failed attempt was routed to.
    pub last_node: Option<NodeId>,
    /// Rendering of the failure.
    pub error: String,
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverDecision {
    /// Retry against the same node.
    RetrySameNode,
    /// Re-route and retry on a (possibly) different node.
    ReRoute,
    /// Give up; the caller sees the original error.
    Fail,
}

/// Chooses the reaction to a failed attempt.
pub trait FailoverPolicy: Send + Sync {
    /// Decides based on the failure so far.
    fn apply(&self, failure: &FailureInfo) -> FailoverDecision;
}

impl<F> FailoverPolicy for F
where
    F: Fn(&FailureInfo) -> FailoverDecision + Send + Sync,
{
    fn apply(&self, failure: &FailureInfo) -> FailoverDecision {
        self(failure)
    }
}

/// Gates which errors are worth handing to the policy at all.
pub trait FailoverCondition: Send + Sync {
    /// Whether the error is eligible for failover.
    fn applies(&self, error: &MessagingError) -> bool;
}

impl<F> FailoverCondition for F
where
    F: Fn(&MessagingError) -> bool + Send + Sync,
{
    fn applies(&self, error: &MessagingError) -> bool {
        self(error)
    }
}

/// Default condition: transient transport failures are retried, everything
/// else (remote application errors, codec bugs, overload) surfaces.
pub struct TransientFailoverCondition;

impl FailoverCondition for TransientFailoverCondition {
    fn applies(&self, error: &MessagingError) -> bool {
        matches!(error, MessagingError::Network(_))
    }
}

/// Retries up to `max_attempts`, re-routing each time.
pub struct MaxAttemptsPolicy {
    max_attempts: usize,
}

impl MaxAttemptsPolicy {
    /// Creates a policy retrying up to `max_attempts` times.
    #[must_use]
    pub const fn new(max_attempts: usize) -> Self {
        Self { max_attempts }
    }
}

impl FailoverPolicy for MaxAttemptsPolicy {
    fn apply(&self, failure: &FailureInfo) -> FailoverDecision {
        if failure.attempt < self.max_attempts {
            FailoverDecision::ReRoute
        } else {
            FailoverDecision::Fail
        }
    }
}
