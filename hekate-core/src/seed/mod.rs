//! Seed node discovery: the bootstrap source of candidate peer addresses.

use std::collections::BTreeSet;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::network::{NetworkService, PingResult};

/// Seed discovery failures.
#[derive(Debug, Error)]
pub enum SeedError {
    /// A configured seed entry could not be parsed or resolved.
    #[error("invalid seed node '{addr}': {reason}")]
    InvalidSeed {
        /// Original entry from configuration.
        addr: String,
        /// Parse/resolve failure description.
        reason: String,
    },
    /// The underlying provider failed.
    #[error("seed provider failure: {0}")]
    Provider(String),
}

/// Source of candidate peer addresses for cluster bootstrap.
///
/// Implementations back onto shared media (static config, filesystem,
/// multicast, cloud registries); the core only depends on this contract.
#[async_trait]
pub trait SeedNodeProvider: Send + Sync {
    /// Returns the current candidate set for `cluster`.
    async fn find_seed_nodes(&self, cluster: &str) -> Result<Vec<SocketAddr>, SeedError>;

    /// Called when the local node starts discovery, advertising `local`.
    async fn start_discovery(&self, cluster: &str, local: SocketAddr) -> Result<(), SeedError> {
        let _ = (cluster, local);
        Ok(())
    }

    /// Called when the local node pauses advertising (e.g. while leaving).
    async fn suspend_discovery(&self) -> Result<(), SeedError> {
        Ok(())
    }

    /// Called when the local node stops discovery for good.
    async fn stop_discovery(&self, cluster: &str, local: SocketAddr) -> Result<(), SeedError> {
        let _ = (cluster, local);
        Ok(())
    }

    /// Records a remote address observed to be part of the cluster.
    async fn register_remote(&self, cluster: &str, addr: SocketAddr) -> Result<(), SeedError> {
        let _ = (cluster, addr);
        Ok(())
    }

    /// Drops a remote address from the shared medium.
    async fn unregister_remote(&self, cluster: &str, addr: SocketAddr) -> Result<(), SeedError> {
        let _ = (cluster, addr);
        Ok(())
    }

    /// Cadence of the manager's liveness cleanup; `None` disables it.
    fn cleanup_interval(&self) -> Option<Duration> {
        None
    }
}

/// Provider backed by a fixed list from configuration.
///
/// Entries parse as socket addresses with a DNS fallback. Addresses
/// registered at runtime are merged into the returned set, which keeps the
/// cleanup loop meaningful in tests and single-medium deployments.
#[derive(Debug)]
pub struct StaticSeedNodeProvider {
    seeds: RwLock<BTreeSet<SocketAddr>>,
}

impl StaticSeedNodeProvider {
    /// Resolves every configured entry; fails on the first bad one.
    pub fn new(entries: &[String]) -> Result<Self, SeedError> {
        let mut seeds = BTreeSet::new();
        for entry in entries {
            match entry.parse::<SocketAddr>() {
                Ok(addr) => {
                    seeds.insert(addr);
                }
                Err(parse_err) => {
                    let mut resolved =
                        entry
                            .to_socket_addrs()
                            .map_err(|err| SeedError::InvalidSeed {
                                addr: entry.clone(),
                                reason: err.to_string(),
                            })?;
                    match resolved.next() {
                        Some(addr) => {
                            seeds.insert(addr);
                        }
                        None => {
                            return Err(SeedError::InvalidSeed {
                                addr: entry.clone(),
                                reason: parse_err.to_string(),
                            });
                        }
                    }
                }
            }
        }
        Ok(Self {
            seeds: RwLock::new(seeds),
        })
    }
}

#[async_trait]
impl SeedNodeProvider for StaticSeedNodeProvider {
    async fn find_seed_nodes(&self, _cluster: &str) -> Result<Vec<SocketAddr>, SeedError> {
        Ok(self.seeds.read().iter().copied().collect())
    }

    async fn register_remote(&self, _cluster: &str, addr: SocketAddr) -> Result<(), SeedError> {
        self.seeds.write().insert(addr);
        Ok(())
    }

    async fn unregister_remote(&self, _cluster: &str, addr: SocketAddr) -> Result<(), SeedError> {
        self.seeds.write().remove(&addr);
        Ok(())
    }
}

/// Wraps a provider with the guarantees the cluster service relies on:
/// no nulls (empty list instead), typed failures, and a periodic cleanup
/// loop that unregisters unreachable addresses.
pub struct SeedNodeManager {
    cluster: String,
    provider: Arc<dyn SeedNodeProvider>,
    network: Arc<NetworkService>,
    alive: Arc<RwLock<BTreeSet<SocketAddr>>>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl SeedNodeManager {
    /// Creates a manager for the given cluster.
    #[must_use]
    pub fn new(
        cluster: impl Into<String>,
        provider: Arc<dyn SeedNodeProvider>,
        network: Arc<NetworkService>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            cluster: cluster.into(),
            provider,
            network,
            alive: Arc::new(RwLock::new(BTreeSet::new())),
            cleanup: Mutex::new(None),
            shutdown_tx,
        }
    }

    /// Candidate seed addresses, deduplicated, never failing with a null
    /// result.
    pub async fn find_seed_nodes(&self) -> Result<Vec<SocketAddr>, SeedError> {
        let mut addrs = self.provider.find_seed_nodes(&self.cluster).await?;
        addrs.sort_unstable();
        addrs.dedup();
        Ok(addrs)
    }

    /// Starts provider discovery and the cleanup loop.
    pub async fn start_discovery(&self, local: SocketAddr) -> Result<(), SeedError> {
        self.provider.start_discovery(&self.cluster, local).await?;
        self.provider.register_remote(&self.cluster, local).await?;

        if let Some(interval) = self.provider.cleanup_interval() {
            let mut slot = self.cleanup.lock();
            if slot.is_none() {
                *slot = Some(tokio::spawn(cleanup_loop(
                    self.cluster.clone(),
                    Arc::clone(&self.provider),
                    Arc::clone(&self.network),
                    Arc::clone(&self.alive),
                    local,
                    interval,
                    self.shutdown_tx.subscribe(),
                )));
            }
        }
        Ok(())
    }

    /// Pauses advertising without dropping registrations.
    pub async fn suspend_discovery(&self) {
        if let Err(err) = self.provider.suspend_discovery().await {
            warn!("seed discovery suspend failed: {err}");
        }
    }

    /// Stops discovery, the cleanup loop, and unregisters the local node.
    pub async fn stop_discovery(&self, local: SocketAddr) {
        let _ = self.shutdown_tx.send(true);
        let task = self.cleanup.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        if let Err(err) = self.provider.unregister_remote(&self.cluster, local).await {
            warn!("seed unregister failed: {err}");
        }
        if let Err(err) = self.provider.stop_discovery(&self.cluster, local).await {
            warn!("seed discovery stop failed: {err}");
        }
    }

    /// Updates the set of addresses known to be alive cluster members;
    /// these are never unregistered by the cleanup loop.
    pub fn update_alive(&self, alive: BTreeSet<SocketAddr>) {
        *self.alive.write() = alive;
    }
}

async fn cleanup_loop(
    cluster: String,
    provider: Arc<dyn SeedNodeProvider>,
    network: Arc<NetworkService>,
    alive: Arc<RwLock<BTreeSet<SocketAddr>>>,
    local: SocketAddr,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let candidates = match provider.find_seed_nodes(&cluster).await {
                    Ok(addrs) => addrs,
                    Err(err) => {
                        warn!("seed cleanup skipped: {err}");
                        continue;
                    }
                };
                for addr in candidates {
                    if addr == local || alive.read().contains(&addr) {
                        continue;
                    }
                    match network.ping(addr).await {
                        PingResult::Success => {}
                        PingResult::Timeout | PingResult::Failure => {
                            debug!(%addr, "unregistering unreachable seed");
                            if let Err(err) = provider.unregister_remote(&cluster, addr).await {
                                warn!(%addr, "seed unregister failed: {err}");
                            }
                        }
                    }
                }
            }
        }
    }
}
