//! Shared helpers for multi-node integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hekate_core::config::{HekateConfig, SeedConfig};
use hekate_core::{HekateBootstrap, HekateNode};

/// Opt-in log output for debugging (`RUST_LOG=hekate_core=debug`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Test-friendly configuration: OS-assigned port, fast gossip, short
/// heartbeats.
pub fn test_config(cluster: &str, seeds: &[SocketAddr]) -> HekateConfig {
    init_tracing();
    let mut config = HekateConfig::default();
    config.cluster.name = cluster.to_string();
    config.cluster.gossip_interval = Duration::from_millis(100);
    config.cluster.gossip_fanout = 4;
    config.cluster.join_timeout = Duration::from_secs(20);
    config.cluster.leave_timeout = Duration::from_secs(5);
    config.cluster.split_brain_check_interval = Duration::from_millis(50);
    config.cluster.seed = SeedConfig::Static {
        seeds: seeds.iter().map(ToString::to_string).collect(),
    };
    config.network.port = 0;
    config.network.connect_timeout = Duration::from_secs(1);
    config.network.heartbeat_interval = Duration::from_millis(250);
    config.network.heartbeat_loss_threshold = 4;
    config
}

/// Joins a node with the given config.
pub async fn join_node(config: HekateConfig) -> Arc<HekateNode> {
    HekateBootstrap::new(config)
        .join()
        .await
        .expect("node should join")
}

/// Address of a joined node.
pub fn addr_of(node: &HekateNode) -> SocketAddr {
    node.local_node().expect("node has identity").addr
}

/// Polls `predicate` until it holds or `budget` elapses.
pub async fn eventually<F>(budget: Duration, mut predicate: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if predicate() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition did not hold within {budget:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
