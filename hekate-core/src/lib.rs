//! Hekate: a toolkit for building clusters of cooperating processes.
//!
//! Nodes discover each other through a pluggable seed source, converge on a
//! shared membership view via gossip, and exchange messages over a
//! protocol-multiplexed TCP transport with failover and load balancing.
//! Higher-level primitives (distributed locks, coordinator-driven
//! coordination rounds, leader election) build on those layers.
//!
//! ```no_run
//! use hekate_core::HekateBootstrap;
//! use hekate_core::config::HekateConfig;
//!
//! # async fn example() -> hekate_core::Result<()> {
//! let mut config = HekateConfig::default();
//! config.cluster.name = "example".to_string();
//! config.network.port = 0;
//!
//! let node = HekateBootstrap::new(config).join().await?;
//! println!("joined as {:?}", node.local_node());
//! node.leave().await?;
//! # Ok(())
//! # }
//! ```

/// Membership: gossip engine, topology views, split-brain handling.
pub mod cluster;
/// Wire codecs and framing primitives.
pub mod codec;
/// Node configuration tree.
pub mod config;
/// Coordination kernel and leader election.
pub mod coordinate;
mod error;
mod instance;
/// Distributed locks.
pub mod lock;
/// Messaging channels.
pub mod messaging;
/// Counter registry and export sink.
pub mod metrics;
/// TCP transport.
pub mod network;
/// Node identity and lifecycle states.
pub mod node;
/// Seed node discovery.
pub mod seed;
/// Service lifecycle kernel.
pub mod service;
/// Shared utilities (lifecycle guard).
pub mod util;

pub use error::{HekateError, Result};
pub use instance::{HekateBootstrap, HekateNode, LifecycleListener};
pub use node::{Node, NodeId, NodeState};

/// Commonly used types.
pub mod prelude {
    pub use crate::cluster::{ClusterEvent, ClusterView, Topology};
    pub use crate::config::{
        HekateConfig, LockRegionConfig, MessagingChannelConfig, SeedConfig,
    };
    pub use crate::coordinate::{
        BroadcastResult, CoordinationContext, CoordinationHandler, LeaderElection,
    };
    pub use crate::lock::{DistributedLock, LockRegion};
    pub use crate::messaging::{
        ChannelSetup, Message, MessageOpts, MessageReceiver, MessagingChannel,
    };
    pub use crate::{HekateBootstrap, HekateError, HekateNode, Node, NodeId, NodeState, Result};
}
