//! Send and receive pressure guards.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::{BackpressureConfig, OverflowPolicy};
use crate::messaging::MessagingError;
use crate::messaging::protocol::MessagingFrame;
use crate::network::ServerConnection;

/// Bounds the number of in-flight outbound messages per channel.
///
/// At the high watermark, senders either park until the level drains to the
/// low watermark or fail immediately, depending on the configured policy.
pub struct SendPressureGuard {
    inflight: AtomicUsize,
    high: usize,
    low: usize,
    policy: OverflowPolicy,
    drained: Notify,
}

impl SendPressureGuard {
    /// Creates the guard from channel configuration.
    #[must_use]
    pub fn new(config: &BackpressureConfig) -> Self {
        Self {
            inflight: AtomicUsize::new(0),
            high: config.out_high_watermark,
            low: config.out_low_watermark,
            policy: config.out_overflow,
            drained: Notify::new(),
        }
    }

    /// Claims one in-flight slot, enforcing the overflow policy.
    pub async fn acquire(&self) -> Result<(), MessagingError> {
        loop {
            let current = self.inflight.load(Ordering::Acquire);
            if current < self.high {
                if self
                    .inflight
                    .compare_exchange_weak(
                        current,
                        current + 1,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }
            match self.policy {
                OverflowPolicy::Fail => return Err(MessagingError::Overloaded),
                OverflowPolicy::Block => {
                    // Register interest before re-checking so a release
                    // landing in between cannot be missed.
                    let mut notified = std::pin::pin!(self.drained.notified());
                    notified.as_mut().enable();
                    if self.inflight.load(Ordering::Acquire) >= self.high {
                        notified.await;
                    }
                }
            }
        }
    }

    /// Releases one slot, waking parked senders once the level drains to
    /// the low watermark.
    pub fn release(&self) {
        let before = self.inflight.fetch_sub(1, Ordering::AcqRel);
        if before.saturating_sub(1) <= self.low {
            self.drained.notify_waiters();
        }
    }

    /// Current in-flight level.
    #[must_use]
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }
}

/// Pauses transport reads when the inbound worker queue grows past the
/// high watermark; resumes at the low watermark.
pub struct ReceivePressureGuard {
    queued: AtomicUsize,
    high: usize,
    low: usize,
    paused: Mutex<Vec<ServerConnection<MessagingFrame>>>,
}

impl ReceivePressureGuard {
    /// Creates the guard from channel configuration.
    #[must_use]
    pub fn new(config: &BackpressureConfig) -> Self {
        Self {
            queued: AtomicUsize::new(0),
            high: config.in_high_watermark,
            low: config.in_low_watermark,
            paused: Mutex::new(Vec::new()),
        }
    }

    /// Records one queued message; pauses the delivering connection when
    /// the queue is past the high watermark.
    pub fn on_enqueue(&self, from: &ServerConnection<MessagingFrame>) {
        let level = self.queued.fetch_add(1, Ordering::AcqRel) + 1;
        if level > self.high {
            from.pause_receiving();
            self.paused.lock().push(from.clone());
        }
    }

    /// Records one dispatched message; resumes paused connections once the
    /// queue drains to the low watermark.
    pub fn on_dequeue(&self) {
        let level = self.queued.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        if level <= self.low {
            let mut paused = self.paused.lock();
            for connection in paused.drain(..) {
                connection.resume_receiving();
            }
        }
    }

    /// Current queue depth.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn guard(high: usize, low: usize, policy: OverflowPolicy) -> SendPressureGuard {
        SendPressureGuard::new(&BackpressureConfig {
            out_high_watermark: high,
            out_low_watermark: low,
            out_overflow: policy,
            ..BackpressureConfig::default()
        })
    }

    #[tokio::test]
    async fn fail_policy_rejects_at_high_watermark() {
        let guard = guard(2, 1, OverflowPolicy::Fail);
        guard.acquire().await.unwrap();
        guard.acquire().await.unwrap();
        assert!(matches!(
            guard.acquire().await,
            Err(MessagingError::Overloaded)
        ));
        guard.release();
        guard.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn block_policy_parks_until_drained() {
        let guard = Arc::new(guard(2, 0, OverflowPolicy::Block));
        guard.acquire().await.unwrap();
        guard.acquire().await.unwrap();

        let blocked = {
            let guard = Arc::clone(&guard);
            tokio::spawn(async move {
                guard.acquire().await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished(), "sender should be parked");

        // Drain to the low watermark (0): both slots must clear.
        guard.release();
        guard.release();
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("parked sender should resume")
            .unwrap();
    }
}
