//! Top-level error hierarchy.
//!
//! Every public operation surfaces a [`HekateError`]; subsystem modules own
//! their error enums and convert into this one at the API boundary. Errors
//! are categorized by failure kind rather than by source component, so
//! callers can match on recovery strategy.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, HekateError>;

/// Uniform failure hierarchy for all Hekate services.
#[derive(Debug, Error)]
pub enum HekateError {
    /// Invalid or conflicting configuration, detected before join.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// Transport-level failure (connect/read timeouts, codec, closed channel).
    #[error(transparent)]
    Network(#[from] crate::network::NetworkError),

    /// Membership failure (join rejection, seed provider, gossip).
    #[error(transparent)]
    Cluster(#[from] crate::cluster::ClusterError),

    /// Messaging failure (routing, backpressure, remote error reply).
    #[error(transparent)]
    Messaging(#[from] crate::messaging::MessagingError),

    /// Distributed lock failure.
    #[error(transparent)]
    Lock(#[from] crate::lock::LockError),

    /// Coordination process failure.
    #[error(transparent)]
    Coordination(#[from] crate::coordinate::CoordinationError),

    /// Operation invoked outside of the `Initialized` lifecycle state.
    #[error("{component} is not initialized (state: {state})")]
    IllegalState {
        /// Component that rejected the call.
        component: &'static str,
        /// Lifecycle state the component was in.
        state: &'static str,
    },
}

impl HekateError {
    /// Whether the error represents a lifecycle violation rather than a
    /// runtime failure.
    #[must_use]
    pub const fn is_illegal_state(&self) -> bool {
        matches!(self, Self::IllegalState { .. })
    }
}
