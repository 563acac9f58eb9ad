//! Declarative configuration for a Hekate node.
//!
//! Everything here is plain data; runtime plug-ins (message receivers,
//! coordination handlers, join validators, split-brain detectors) are
//! attached through the node builder instead. Durations accept humantime
//! strings (`"3s"`, `"250ms"`) when loaded from serialized form.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invalid or conflicting configuration, reported before join.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required option was left empty.
    #[error("configuration option '{0}' must not be empty")]
    Empty(&'static str),
    /// Two entries of the same kind share a name.
    #[error("duplicate {kind} name: '{name}'")]
    DuplicateName {
        /// Entry kind (channel, lock region, coordination process).
        kind: &'static str,
        /// The conflicting name.
        name: String,
    },
    /// An option value is outside its valid domain.
    #[error("invalid value for '{option}': {reason}")]
    InvalidValue {
        /// Offending option name.
        option: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
    /// An option names a feature this build delegates to an external
    /// collaborator.
    #[error("configuration option '{0}' is not supported by this build")]
    Unsupported(&'static str),
}

/// Top-level configuration for one node instance.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HekateConfig {
    /// Cluster membership options.
    pub cluster: ClusterConfig,
    /// Local node identity options.
    pub node: NodeConfig,
    /// Transport options.
    pub network: NetworkConfig,
    /// Messaging channel definitions.
    pub messaging: MessagingConfig,
    /// Distributed lock regions.
    pub locks: LockServiceConfig,
    /// Coordination process definitions.
    pub coordination: CoordinationConfig,
}

impl HekateConfig {
    /// Validates the whole tree; any error here fails the node before join.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.name.trim().is_empty() {
            return Err(ConfigError::Empty("cluster.name"));
        }
        if !(0.0..=1.0).contains(&self.cluster.failure_quorum_fraction) {
            return Err(ConfigError::InvalidValue {
                option: "cluster.failure_quorum_fraction",
                reason: format!(
                    "must be within [0, 1], got {}",
                    self.cluster.failure_quorum_fraction
                ),
            });
        }
        if self.network.ssl.is_some() {
            return Err(ConfigError::Unsupported("network.ssl"));
        }
        check_unique("channel", self.messaging.channels.iter().map(|c| &c.name))?;
        check_unique("lock region", self.locks.regions.iter().map(|r| &r.name))?;
        check_unique(
            "coordination process",
            self.coordination.processes.iter().map(|p| &p.name),
        )?;
        for channel in &self.messaging.channels {
            if channel.name.trim().is_empty() {
                return Err(ConfigError::Empty("messaging.channels[*].name"));
            }
            if channel.sockets == 0 {
                return Err(ConfigError::InvalidValue {
                    option: "messaging.channels[*].sockets",
                    reason: "at least one connection per peer is required".into(),
                });
            }
            if channel.worker_threads == 0 {
                return Err(ConfigError::InvalidValue {
                    option: "messaging.channels[*].worker_threads",
                    reason: "at least one worker is required".into(),
                });
            }
            channel.backpressure.validate()?;
        }
        for region in &self.locks.regions {
            if region.name.trim().is_empty() {
                return Err(ConfigError::Empty("locks.regions[*].name"));
            }
        }
        for process in &self.coordination.processes {
            if process.name.trim().is_empty() {
                return Err(ConfigError::Empty("coordination.processes[*].name"));
            }
        }
        Ok(())
    }
}

fn check_unique<'a>(
    kind: &'static str,
    names: impl Iterator<Item = &'a String>,
) -> Result<(), ConfigError> {
    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(ConfigError::DuplicateName {
                kind,
                name: name.clone(),
            });
        }
    }
    Ok(())
}

/// Cluster membership options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster name; join requests to a differently named cluster are
    /// rejected.
    pub name: String,
    /// Seed node source used for bootstrap.
    pub seed: SeedConfig,
    /// Cadence of gossip rounds.
    #[serde(with = "humantime_serde")]
    pub gossip_interval: Duration,
    /// Peers contacted per gossip round.
    pub gossip_fanout: usize,
    /// Fraction of UP members whose suspicion marks a node failed
    /// (strictly-greater-than threshold; `0.5` means majority).
    pub failure_quorum_fraction: f64,
    /// Action applied when the split-brain detector reports this node
    /// invalid.
    pub split_brain_action: SplitBrainAction,
    /// Re-check cadence while the detector keeps reporting invalid.
    #[serde(with = "humantime_serde")]
    pub split_brain_check_interval: Duration,
    /// Upper bound for the whole join sequence.
    #[serde(with = "humantime_serde")]
    pub join_timeout: Duration,
    /// Graceful-leave budget before escalating to terminate.
    #[serde(with = "humantime_serde")]
    pub leave_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "hekate".to_string(),
            seed: SeedConfig::default(),
            gossip_interval: Duration::from_millis(250),
            gossip_fanout: 3,
            failure_quorum_fraction: 0.5,
            split_brain_action: SplitBrainAction::Terminate,
            split_brain_check_interval: Duration::from_secs(1),
            join_timeout: Duration::from_secs(30),
            leave_timeout: Duration::from_secs(10),
        }
    }
}

/// Seed node sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SeedConfig {
    /// Static `host:port` list resolved at startup.
    Static {
        /// Candidate peer endpoints.
        seeds: Vec<String>,
    },
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self::Static { seeds: Vec::new() }
    }
}

/// Reaction to a split-brain verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SplitBrainAction {
    /// Terminate and rejoin with a fresh identity.
    Rejoin,
    /// Transition to `Down` without rejoin attempts.
    #[default]
    Terminate,
}

/// Local node identity options.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NodeConfig {
    /// Optional explicit node name (auto-generated when empty).
    pub name: Option<String>,
    /// Roles advertised to the cluster.
    pub roles: BTreeSet<String>,
    /// Properties advertised to the cluster.
    pub properties: BTreeMap<String, String>,
}

/// Socket transport selection. Tokio abstracts readiness polling, so the
/// value is validated and logged for parity with deployments that pin it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Let the runtime pick.
    #[default]
    Auto,
    /// Prefer epoll (Linux).
    Epoll,
    /// Portable non-blocking I/O.
    Nio,
}

/// Transport options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Bind host.
    pub host: String,
    /// First port to try binding (`0` for OS-assigned).
    pub port: u16,
    /// Number of consecutive ports to try on bind failure.
    pub port_range: u16,
    /// Outbound connect budget.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Delay before the acceptor rebinds after a runtime failure.
    #[serde(with = "humantime_serde")]
    pub accept_retry_interval: Duration,
    /// I/O parallelism hint (informational under tokio).
    pub nio_threads: usize,
    /// Readiness-polling backend selection.
    pub transport: TransportMode,
    /// Disables Nagle's algorithm on accepted/dialed sockets.
    pub tcp_no_delay: bool,
    /// SO_RCVBUF override.
    pub so_receive_buffer: Option<u32>,
    /// SO_SNDBUF override.
    pub so_send_buffer: Option<u32>,
    /// SO_REUSEADDR for the listener.
    pub so_reuse_address: bool,
    /// Listener backlog.
    pub so_backlog: u32,
    /// Write-idle interval after which a heartbeat frame is pushed.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Missed heartbeats tolerated before a read timeout fires.
    pub heartbeat_loss_threshold: u32,
    /// TLS material; termination is delegated to an external collaborator,
    /// so setting this is rejected by [`HekateConfig::validate`].
    pub ssl: Option<SslConfig>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 10_012,
            port_range: 100,
            connect_timeout: Duration::from_secs(3),
            accept_retry_interval: Duration::from_secs(1),
            nio_threads: 0,
            transport: TransportMode::Auto,
            tcp_no_delay: true,
            so_receive_buffer: None,
            so_send_buffer: None,
            so_reuse_address: true,
            so_backlog: 1_024,
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_loss_threshold: 3,
            ssl: None,
        }
    }
}

/// TLS trust/key material locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslConfig {
    /// Trust store path.
    pub trust: String,
    /// Key store path.
    pub key: String,
}

/// Messaging options.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MessagingConfig {
    /// Channel definitions; receivers are attached at build time.
    pub channels: Vec<MessagingChannelConfig>,
}

/// One messaging channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingChannelConfig {
    /// Channel name (also the transport protocol id suffix).
    pub name: String,
    /// Pooled connections per remote peer (affinity hashing domain).
    pub sockets: usize,
    /// I/O parallelism hint for this channel (informational under tokio).
    pub nio_threads: usize,
    /// Async workers dispatching receiver callbacks.
    pub worker_threads: usize,
    /// Idle timeout for pooled connections.
    #[serde(with = "humantime_serde", default)]
    pub idle_timeout: Option<Duration>,
    /// Default per-request timeout (individual requests may override).
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Outbound/inbound pressure limits.
    pub backpressure: BackpressureConfig,
}

impl Default for MessagingChannelConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            sockets: 1,
            nio_threads: 0,
            worker_threads: 2,
            idle_timeout: None,
            request_timeout: Duration::from_secs(5),
            backpressure: BackpressureConfig::default(),
        }
    }
}

impl MessagingChannelConfig {
    /// Convenience constructor for a named channel with defaults.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Behavior when the outbound high watermark is hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Park the sender until the queue drains to the low watermark.
    #[default]
    Block,
    /// Fail the send immediately.
    Fail,
}

/// Send/receive pressure limits for one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// In-flight outbound messages that trigger the overflow policy.
    pub out_high_watermark: usize,
    /// Outbound level at which blocked senders resume.
    pub out_low_watermark: usize,
    /// Policy applied at the outbound high watermark.
    pub out_overflow: OverflowPolicy,
    /// Queued inbound messages per channel before the reader is paused.
    pub in_high_watermark: usize,
    /// Inbound level at which reading resumes.
    pub in_low_watermark: usize,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            out_high_watermark: 10_000,
            out_low_watermark: 5_000,
            out_overflow: OverflowPolicy::Block,
            in_high_watermark: 10_000,
            in_low_watermark: 5_000,
        }
    }
}

impl BackpressureConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.out_low_watermark > self.out_high_watermark {
            return Err(ConfigError::InvalidValue {
                option: "messaging.channels[*].backpressure.out_low_watermark",
                reason: "low watermark exceeds high watermark".into(),
            });
        }
        if self.in_low_watermark > self.in_high_watermark {
            return Err(ConfigError::InvalidValue {
                option: "messaging.channels[*].backpressure.in_low_watermark",
                reason: "low watermark exceeds high watermark".into(),
            });
        }
        Ok(())
    }
}

/// Lock service options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockServiceConfig {
    /// Lock regions hosted by this node.
    pub regions: Vec<LockRegionConfig>,
    /// Client retry backoff when the manager reports a stale topology.
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
}

impl Default for LockServiceConfig {
    fn default() -> Self {
        Self {
            regions: Vec::new(),
            retry_interval: Duration::from_millis(50),
        }
    }
}

/// One lock region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRegionConfig {
    /// Region name; partitioning and migration are scoped to it.
    pub name: String,
}

impl LockRegionConfig {
    /// Convenience constructor.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Coordination options.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Process definitions; handlers are attached at build time.
    pub processes: Vec<CoordinationProcessConfig>,
}

/// One coordination process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationProcessConfig {
    /// Process name; participants register it as a service property.
    pub name: String,
}

impl CoordinationProcessConfig {
    /// Convenience constructor.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        HekateConfig::default().validate().unwrap();
    }

    #[test]
    fn empty_cluster_name_rejected() {
        let mut config = HekateConfig::default();
        config.cluster.name = "  ".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Empty("cluster.name"))
        ));
    }

    #[test]
    fn duplicate_channel_rejected() {
        let mut config = HekateConfig::default();
        config.messaging.channels = vec![
            MessagingChannelConfig::named("tasks"),
            MessagingChannelConfig::named("tasks"),
        ];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateName { kind: "channel", .. })
        ));
    }

    #[test]
    fn ssl_is_rejected() {
        let mut config = HekateConfig::default();
        config.network.ssl = Some(SslConfig {
            trust: "trust.pem".into(),
            key: "key.pem".into(),
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Unsupported("network.ssl"))
        ));
    }

    #[test]
    fn watermark_ordering_enforced() {
        let mut config = HekateConfig::default();
        let mut channel = MessagingChannelConfig::named("tasks");
        channel.backpressure.out_low_watermark = 100;
        channel.backpressure.out_high_watermark = 10;
        config.messaging.channels = vec![channel];
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = HekateConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: HekateConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.cluster.name, config.cluster.name);
        assert_eq!(back.network.port, config.network.port);
    }
}
