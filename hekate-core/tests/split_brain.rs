//! Split-brain detector scenarios.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use common::test_config;
use hekate_core::cluster::{ClusterError, SplitBrainDetector};
use hekate_core::config::SplitBrainAction;
use hekate_core::node::Node;
use hekate_core::{HekateBootstrap, NodeState};

/// Detector that reports invalid for the first `deny` polls.
struct FlakyDetector {
    polls: AtomicUsize,
    deny: usize,
}

#[async_trait]
impl SplitBrainDetector for FlakyDetector {
    async fn is_valid(&self, _local: &Node) -> Result<bool, ClusterError> {
        let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(polls > self.deny)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn join_blocks_until_detector_reports_valid() {
    let detector = Arc::new(FlakyDetector {
        polls: AtomicUsize::new(0),
        deny: 4,
    });

    let mut config = test_config("split-brain-join", &[]);
    config.cluster.split_brain_action = SplitBrainAction::Rejoin;

    let node = timeout(
        Duration::from_secs(15),
        HekateBootstrap::new(config)
            .with_split_brain_detector(Arc::clone(&detector) as Arc<dyn SplitBrainDetector>)
            .join(),
    )
    .await
    .expect("join should finish once the detector turns valid")
    .unwrap();

    assert!(
        detector.polls.load(Ordering::SeqCst) >= 5,
        "detector should be polled through the invalid streak"
    );
    assert_eq!(node.state(), NodeState::Up);
    node.leave().await.unwrap();
}

/// Detector that always fails.
struct BrokenDetector;

#[async_trait]
impl SplitBrainDetector for BrokenDetector {
    async fn is_valid(&self, _local: &Node) -> Result<bool, ClusterError> {
        Err(ClusterError::DetectorFailure("probe backend is gone".into()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn detector_failure_terminates_the_join() {
    let config = test_config("split-brain-broken", &[]);
    let result = HekateBootstrap::new(config)
        .with_split_brain_detector(Arc::new(BrokenDetector))
        .join()
        .await;
    assert!(result.is_err(), "a failing detector must abort the join");
}
