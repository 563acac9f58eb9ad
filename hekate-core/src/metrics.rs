//! Lock-free counter registry with a pluggable export sink.
//!
//! Subsystems record counters through a shared [`MetricsRegistry`]; an
//! optional [`MetricsSink`] mirrors every increment so external publishers
//! (statsd, prometheus, ...) can export without the core depending on them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Connections currently established by the transport.
pub const NETWORK_CONNECTIONS_ACTIVE: &str = "hekate.network.connections.active";
/// Messages written to peers.
pub const NETWORK_MESSAGES_OUT: &str = "hekate.network.messages.out";
/// Messages read from peers.
pub const NETWORK_MESSAGES_IN: &str = "hekate.network.messages.in";
/// Payload bytes written to peers.
pub const NETWORK_BYTES_OUT: &str = "hekate.network.bytes.out";
/// Payload bytes read from peers.
pub const NETWORK_BYTES_IN: &str = "hekate.network.bytes.in";
/// Sends that failed before reaching the wire.
pub const NETWORK_SEND_ERRORS: &str = "hekate.network.send.errors";
/// Gossip rounds initiated by the local node.
pub const GOSSIP_ROUNDS: &str = "hekate.cluster.gossip.rounds";
/// Cluster topology events published to listeners.
pub const CLUSTER_EVENTS: &str = "hekate.cluster.events";
/// Requests enqueued by messaging channels.
pub const MESSAGING_ENQUEUED: &str = "hekate.messaging.enqueued";
/// Requests completed (any outcome) by messaging channels.
pub const MESSAGING_DEQUEUED: &str = "hekate.messaging.dequeued";
/// Failover retries performed by messaging channels.
pub const MESSAGING_RETRIES: &str = "hekate.messaging.retries";
/// Lock migrations coordinated by the local node.
pub const LOCK_MIGRATIONS: &str = "hekate.lock.migrations";

/// Receives a copy of every counter update.
pub trait MetricsSink: Send + Sync {
    /// Called after the named counter changed by `delta` (negative for
    /// decrements).
    fn on_counter(&self, name: &'static str, delta: i64);
}

/// Process-local counter registry.
///
/// Counters are created on first touch and never removed; updates are a
/// single atomic add.
#[derive(Default)]
pub struct MetricsRegistry {
    counters: DashMap<&'static str, Arc<AtomicU64>>,
    sink: Option<Arc<dyn MetricsSink>>,
}

impl MetricsRegistry {
    /// Creates a registry without an export sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry mirroring updates into `sink`.
    #[must_use]
    pub fn with_sink(sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            counters: DashMap::new(),
            sink: Some(sink),
        }
    }

    fn counter(&self, name: &'static str) -> Arc<AtomicU64> {
        Arc::clone(
            &self
                .counters
                .entry(name)
                .or_insert_with(|| Arc::new(AtomicU64::new(0))),
        )
    }

    /// Adds `delta` to the named counter.
    pub fn add(&self, name: &'static str, delta: u64) {
        self.counter(name).fetch_add(delta, Ordering::Relaxed);
        if let Some(sink) = &self.sink {
            sink.on_counter(name, delta as i64);
        }
    }

    /// Increments the named counter by one.
    pub fn increment(&self, name: &'static str) {
        self.add(name, 1);
    }

    /// Subtracts `delta` from the named counter (saturating at zero).
    pub fn sub(&self, name: &'static str, delta: u64) {
        let counter = self.counter(name);
        let mut current = counter.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(delta);
            match counter.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        if let Some(sink) = &self.sink {
            sink.on_counter(name, -(delta as i64));
        }
    }

    /// Current value of the named counter (zero if never touched).
    #[must_use]
    pub fn value(&self, name: &'static str) -> u64 {
        self.counters
            .get(name)
            .map_or(0, |entry| entry.load(Ordering::Relaxed))
    }

    /// Snapshot of all counters for diagnostics.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        let mut all: Vec<_> = self
            .counters
            .iter()
            .map(|entry| (*entry.key(), entry.value().load(Ordering::Relaxed)))
            .collect();
        all.sort_unstable_by_key(|(name, _)| *name);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn counters_accumulate() {
        let metrics = MetricsRegistry::new();
        metrics.increment(NETWORK_MESSAGES_OUT);
        metrics.add(NETWORK_MESSAGES_OUT, 2);
        assert_eq!(metrics.value(NETWORK_MESSAGES_OUT), 3);
        assert_eq!(metrics.value(NETWORK_MESSAGES_IN), 0);
    }

    #[test]
    fn sub_saturates_at_zero() {
        let metrics = MetricsRegistry::new();
        metrics.add(NETWORK_CONNECTIONS_ACTIVE, 1);
        metrics.sub(NETWORK_CONNECTIONS_ACTIVE, 5);
        assert_eq!(metrics.value(NETWORK_CONNECTIONS_ACTIVE), 0);
    }

    #[test]
    fn sink_observes_updates() {
        struct Recorder(Mutex<Vec<(&'static str, i64)>>);
        impl MetricsSink for Recorder {
            fn on_counter(&self, name: &'static str, delta: i64) {
                self.0.lock().push((name, delta));
            }
        }

        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let metrics = MetricsRegistry::with_sink(Arc::clone(&recorder) as Arc<dyn MetricsSink>);
        metrics.increment(GOSSIP_ROUNDS);
        metrics.sub(GOSSIP_ROUNDS, 1);

        let seen = recorder.0.lock();
        assert_eq!(seen.as_slice(), &[(GOSSIP_ROUNDS, 1), (GOSSIP_ROUNDS, -1)]);
    }
}
