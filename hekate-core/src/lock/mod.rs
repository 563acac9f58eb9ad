//! Distributed locks: region-scoped mutual exclusion with ownership
//! migration on topology changes.

/// Lock wire protocol.
pub mod protocol;
/// Manager-side region state and migration.
pub mod region;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

pub use protocol::{
    LockMigrationInfo, LockMigrationKey, LockProtocol, LockProtocolCodec, LockStatus,
    MigrationStatus, OwnerStatus, UnlockStatus,
};
pub use region::{LockHolder, lock_name_hash, manager_of};

use crate::cluster::view::ClusterView;
use crate::codec::{CodecFactory, SingletonCodecFactory};
use crate::config::{LockServiceConfig, MessagingChannelConfig};
use crate::messaging::{
    ChannelSetup, Message, MessageOpts, MessageReceiver, MessagingError, MessagingService,
    ReceiverError,
};
use crate::metrics::MetricsRegistry;
use crate::node::NodeId;
use region::{HeldLock, RegionInner};

/// Name of the messaging channel carrying lock traffic.
pub const LOCK_CHANNEL: &str = "hekate.locks";

static THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Node property advertising membership in a lock region.
#[must_use]
pub fn region_property(region: &str) -> String {
    format!("hekate.locks.region.{region}")
}

/// Lock service failures.
#[derive(Debug, Error)]
pub enum LockError {
    /// No region with that name is configured locally.
    #[error("unknown lock region: {0}")]
    UnknownRegion(String),
    /// The region currently has no members to manage locks.
    #[error("no members in lock region '{0}'")]
    NoRegionMembers(String),
    /// Unlock attempted on a lock this handle does not hold.
    #[error("lock '{region}/{name}' is not held by this handle")]
    NotHeld {
        /// Region name.
        region: String,
        /// Lock name.
        name: String,
    },
    /// Messaging failure talking to the manager.
    #[error(transparent)]
    Messaging(#[from] MessagingError),
}

/// Reported lock ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOwnerInfo {
    /// Owning node.
    pub node: NodeId,
    /// Owner's acquirer token.
    pub thread_id: u64,
}

/// Region-scoped lock namespace.
#[derive(Clone)]
pub struct LockRegion {
    inner: Arc<RegionInner>,
}

impl LockRegion {
    /// Region name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.region
    }

    /// Handle for the named lock. Handles are identified by
    /// `(region, name)`; each carries its own acquirer token.
    #[must_use]
    pub fn get_lock(&self, name: impl Into<String>) -> DistributedLock {
        DistributedLock {
            inner: Arc::clone(&self.inner),
            name: name.into(),
            thread_token: THREAD_TOKEN.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Queries the current owner of a lock from its manager.
    pub async fn owner_of(&self, name: &str) -> Result<Option<LockOwnerInfo>, LockError> {
        query_owner(&self.inner, name).await
    }

    /// Locks currently arbitrated by the local node (diagnostics).
    #[must_use]
    pub fn locally_managed(&self) -> HashMap<String, LockHolder> {
        self.inner.managed_locks()
    }
}

/// One named distributed lock.
pub struct DistributedLock {
    inner: Arc<RegionInner>,
    name: String,
    thread_token: u64,
}

impl DistributedLock {
    /// Lock name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning region name.
    #[must_use]
    pub fn region(&self) -> &str {
        &self.inner.region
    }

    /// Acquires the lock, waiting without bound.
    pub async fn lock(&self) -> Result<(), LockError> {
        loop {
            if self.acquire(30_000).await? {
                return Ok(());
            }
        }
    }

    /// Acquires the lock within the given budget; `false` on timeout.
    pub async fn lock_with_timeout(&self, budget: Duration) -> Result<bool, LockError> {
        self.acquire(budget.as_millis().min(i64::MAX as u128) as i64)
            .await
    }

    /// Immediate attempt; `false` when the lock is busy.
    pub async fn try_lock(&self) -> Result<bool, LockError> {
        self.acquire(0).await
    }

    /// Releases the lock.
    pub async fn unlock(&self) -> Result<(), LockError> {
        let held = self
            .inner
            .held
            .lock()
            .get(&self.name)
            .copied()
            .ok_or_else(|| LockError::NotHeld {
                region: self.inner.region.clone(),
                name: self.name.clone(),
            })?;

        let mut empty_views = 0u32;
        loop {
            let topology = self.inner.topology();
            let Some(manager) = manager_of(&self.name, &topology) else {
                empty_views += 1;
                if empty_views > 100 {
                    return Err(LockError::NoRegionMembers(self.inner.region.clone()));
                }
                tokio::time::sleep(self.inner.retry_interval).await;
                continue;
            };
            let request = LockProtocol::UnlockRequest {
                lock_id: held.lock_id,
                region: self.inner.region.clone(),
                name: self.name.clone(),
                topology: topology.hash(),
                node: self.inner.local_id,
            };
            let opts = MessageOpts::to(manager).with_timeout(Duration::from_secs(5));
            match self.inner.channel.request_with(&request, opts).await {
                Ok(LockProtocol::UnlockResponse { status }) => match status {
                    UnlockStatus::Ok => {
                        self.inner.held.lock().remove(&self.name);
                        return Ok(());
                    }
                    UnlockStatus::NotOwner => {
                        self.inner.held.lock().remove(&self.name);
                        return Err(LockError::NotHeld {
                            region: self.inner.region.clone(),
                            name: self.name.clone(),
                        });
                    }
                    UnlockStatus::Retry => {
                        tokio::time::sleep(self.inner.retry_interval).await;
                    }
                },
                Ok(other) => {
                    debug!(?other, "unexpected unlock reply");
                    tokio::time::sleep(self.inner.retry_interval).await;
                }
                Err(err) if is_transient(&err) => {
                    tokio::time::sleep(self.inner.retry_interval).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Queries the current owner from the manager.
    pub async fn owner(&self) -> Result<Option<LockOwnerInfo>, LockError> {
        query_owner(&self.inner, &self.name).await
    }

    /// Whether this handle believes it holds the lock.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.inner.held.lock().contains_key(&self.name)
    }

    /// One acquire pass bounded by `budget_ms` (zero is an immediate
    /// attempt). Topology staleness is retried transparently within the
    /// budget.
    async fn acquire(&self, budget_ms: i64) -> Result<bool, LockError> {
        let lock_id = self.inner.next_lock_id();
        let deadline = Instant::now() + Duration::from_millis(budget_ms.max(0) as u64);

        loop {
            let topology = self.inner.topology();
            let Some(manager) = manager_of(&self.name, &topology) else {
                // The filtered region view fills in shortly after join;
                // wait for members within the caller's budget.
                if budget_ms == 0 || Instant::now() >= deadline {
                    return Err(LockError::NoRegionMembers(self.inner.region.clone()));
                }
                tokio::time::sleep(self.inner.retry_interval).await;
                continue;
            };

            let remaining_ms = if budget_ms == 0 {
                0
            } else {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(false);
                }
                remaining.as_millis() as i64
            };

            let request = LockProtocol::LockRequest {
                lock_id,
                region: self.inner.region.clone(),
                name: self.name.clone(),
                timeout_ms: remaining_ms,
                with_feedback: false,
                thread_id: self.thread_token,
                topology: topology.hash(),
                node: self.inner.local_id,
            };
            let opts = MessageOpts::to(manager)
                .with_timeout(Duration::from_millis(remaining_ms as u64) + Duration::from_secs(5));

            match self.inner.channel.request_with(&request, opts).await {
                Ok(LockProtocol::LockResponse { status, .. }) => match status {
                    LockStatus::Ok => {
                        self.inner.held.lock().insert(
                            self.name.clone(),
                            HeldLock {
                                lock_id,
                                thread_id: self.thread_token,
                            },
                        );
                        return Ok(true);
                    }
                    LockStatus::Busy | LockStatus::Timeout => return Ok(false),
                    LockStatus::Retry => {
                        tokio::time::sleep(self.inner.retry_interval).await;
                    }
                },
                Ok(other) => {
                    debug!(?other, "unexpected lock reply");
                    tokio::time::sleep(self.inner.retry_interval).await;
                }
                Err(err) if is_transient(&err) => {
                    tokio::time::sleep(self.inner.retry_interval).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn is_transient(err: &MessagingError) -> bool {
    matches!(
        err,
        MessagingError::Network(_)
            | MessagingError::Timeout(_)
            | MessagingError::UnknownDestination(_)
            | MessagingError::NoReceivers
    )
}

async fn query_owner(
    inner: &Arc<RegionInner>,
    name: &str,
) -> Result<Option<LockOwnerInfo>, LockError> {
    let mut empty_views = 0u32;
    loop {
        let topology = inner.topology();
        let Some(manager) = manager_of(name, &topology) else {
            empty_views += 1;
            if empty_views > 100 {
                return Err(LockError::NoRegionMembers(inner.region.clone()));
            }
            tokio::time::sleep(inner.retry_interval).await;
            continue;
        };
        let request = LockProtocol::OwnerRequest {
            region: inner.region.clone(),
            name: name.to_string(),
            topology: topology.hash(),
        };
        let opts = MessageOpts::to(manager).with_timeout(Duration::from_secs(5));
        match inner.channel.request_with(&request, opts).await {
            Ok(LockProtocol::OwnerResponse {
                thread_id,
                owner,
                status,
            }) => match status {
                OwnerStatus::Ok => {
                    return Ok(owner.map(|node| LockOwnerInfo { node, thread_id }));
                }
                OwnerStatus::Retry => tokio::time::sleep(inner.retry_interval).await,
            },
            Ok(other) => {
                debug!(?other, "unexpected owner reply");
                tokio::time::sleep(inner.retry_interval).await;
            }
            Err(err) if is_transient(&err) => {
                tokio::time::sleep(inner.retry_interval).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Partitioned lock service hosting the configured regions.
pub struct LockService {
    regions: HashMap<String, LockRegion>,
}

impl LockService {
    /// Builds the service: one shared lock channel plus the configured
    /// regions, each bound to its filtered topology view.
    pub fn new(
        config: &LockServiceConfig,
        local_id: NodeId,
        messaging: &MessagingService,
        view: &ClusterView,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, LockError> {
        let routing: Arc<DashMap<String, Arc<RegionInner>>> = Arc::new(DashMap::new());
        let codec: Arc<dyn CodecFactory<LockProtocol>> =
            Arc::new(SingletonCodecFactory::new(LockProtocolCodec));

        let mut channel_config = MessagingChannelConfig::named(LOCK_CHANNEL);
        channel_config.worker_threads = 4;
        channel_config.request_timeout = Duration::from_secs(5);

        let channel = messaging.register_channel(
            ChannelSetup::new(channel_config, codec).with_receiver(Arc::new(
                LockMessageReceiver {
                    routing: Arc::clone(&routing),
                },
            )),
        )?;

        let mut regions = HashMap::new();
        for region_config in &config.regions {
            let name = region_config.name.clone();
            let property = region_property(&name);
            let region_view = view.filter(move |node| node.property(&property).is_some());
            let inner = RegionInner::new(
                name.clone(),
                local_id,
                channel.clone(),
                region_view,
                config.retry_interval,
                Arc::clone(&metrics),
            );
            routing.insert(name.clone(), Arc::clone(&inner));
            regions.insert(name.clone(), LockRegion { inner });
        }

        Ok(Self { regions })
    }

    /// Looks up a configured region.
    pub fn region(&self, name: &str) -> Result<LockRegion, LockError> {
        self.regions
            .get(name)
            .cloned()
            .ok_or_else(|| LockError::UnknownRegion(name.to_string()))
    }

    /// Names of the locally configured regions.
    pub fn region_names(&self) -> impl Iterator<Item = &str> {
        self.regions.keys().map(String::as_str)
    }
}

/// Routes inbound lock traffic to its region.
struct LockMessageReceiver {
    routing: Arc<DashMap<String, Arc<RegionInner>>>,
}

impl LockMessageReceiver {
    fn region(&self, name: &str) -> Result<Arc<RegionInner>, ReceiverError> {
        self.routing
            .get(name)
            .map(|entry| Arc::clone(&entry))
            .ok_or_else(|| format!("unknown lock region: {name}").into())
    }
}

#[async_trait]
impl MessageReceiver<LockProtocol> for LockMessageReceiver {
    async fn receive(&self, msg: Message<LockProtocol>) -> Result<(), ReceiverError> {
        match msg.payload().clone() {
            LockProtocol::LockRequest {
                lock_id,
                region,
                name,
                timeout_ms,
                thread_id,
                topology,
                node,
                ..
            } => {
                let region = self.region(&region)?;
                region
                    .on_lock_request(msg, name, lock_id, timeout_ms, thread_id, topology, node)
                    .await;
            }
            LockProtocol::UnlockRequest {
                lock_id,
                region,
                name,
                topology,
                node,
            } => {
                let region = self.region(&region)?;
                region
                    .on_unlock_request(msg, name, lock_id, topology, node)
                    .await;
            }
            LockProtocol::OwnerRequest {
                region,
                name,
                topology,
            } => {
                let region = self.region(&region)?;
                region.on_owner_request(msg, name, topology).await;
            }
            LockProtocol::MigrationPrepare {
                region,
                key,
                first_pass,
                topologies,
                locks,
            } => {
                let region = self.region(&region)?;
                region
                    .on_migration_prepare(msg, key, first_pass, topologies, locks)
                    .await;
            }
            LockProtocol::MigrationApply { region, key, locks } => {
                let region = self.region(&region)?;
                region.on_migration_apply(msg, key, locks).await;
            }
            // Responses never arrive at the receiver.
            LockProtocol::LockResponse { .. }
            | LockProtocol::UnlockResponse { .. }
            | LockProtocol::OwnerResponse { .. }
            | LockProtocol::MigrationResponse { .. } => {}
        }
        Ok(())
    }
}
