//! Coordination scenarios: multi-round broadcast completion, leader
//! election.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::timeout;

use common::{addr_of, test_config};
use hekate_core::config::{CoordinationProcessConfig, HekateConfig};
use hekate_core::coordinate::{CoordinationContext, CoordinationHandler, LeaderElection};
use hekate_core::{HekateBootstrap, NodeId};

fn coordination_config(cluster: &str, seeds: &[std::net::SocketAddr]) -> HekateConfig {
    let mut config = test_config(cluster, seeds);
    config.coordination.processes = vec![CoordinationProcessConfig::named("rounds")];
    config
}

/// Observation recorded by each member during `process`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Observation {
    members: usize,
    coordinator: NodeId,
}

/// Coordinator drives three broadcast rounds, then completes.
struct ThreeRounds {
    observations: Arc<Mutex<Vec<Observation>>>,
}

#[async_trait]
impl CoordinationHandler for ThreeRounds {
    async fn coordinate(&self, ctx: Arc<CoordinationContext>) {
        for round in 0u8..3 {
            let request = Bytes::copy_from_slice(&[round]);
            match ctx.broadcast(request).await {
                Ok(result) => {
                    assert_eq!(
                        result.replies.len(),
                        ctx.size(),
                        "broadcast must collect one reply per member"
                    );
                }
                // A topology change restarted the round; the new
                // coordinator runs it again.
                Err(_) => return,
            }
        }
        ctx.complete().await;
    }

    async fn process(&self, request: Bytes, ctx: Arc<CoordinationContext>) -> Bytes {
        self.observations.lock().push(Observation {
            members: ctx.size(),
            coordinator: ctx.coordinator(),
        });
        request
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn three_nodes_complete_three_rounds() {
    let observations: Vec<Arc<Mutex<Vec<Observation>>>> =
        (0..3).map(|_| Arc::new(Mutex::new(Vec::new()))).collect();

    let n1 = HekateBootstrap::new(coordination_config("rounds", &[]))
        .with_coordination_handler(
            "rounds",
            Arc::new(ThreeRounds {
                observations: Arc::clone(&observations[0]),
            }),
        )
        .join()
        .await
        .unwrap();
    let seeds = [addr_of(&n1)];
    let n2 = HekateBootstrap::new(coordination_config("rounds", &seeds))
        .with_coordination_handler(
            "rounds",
            Arc::new(ThreeRounds {
                observations: Arc::clone(&observations[1]),
            }),
        )
        .join()
        .await
        .unwrap();
    let n3 = HekateBootstrap::new(coordination_config("rounds", &seeds))
        .with_coordination_handler(
            "rounds",
            Arc::new(ThreeRounds {
                observations: Arc::clone(&observations[2]),
            }),
        )
        .join()
        .await
        .unwrap();

    let nodes = [&n1, &n2, &n3];
    for node in &nodes {
        let view = node.cluster_view().unwrap();
        timeout(Duration::from_secs(15), view.future_of(|t| t.size() == 3))
            .await
            .expect("convergence")
            .unwrap();
    }

    // Every node's coordination future completes.
    for node in &nodes {
        let process = node.coordination().unwrap().process("rounds").unwrap();
        timeout(Duration::from_secs(20), process.completion())
            .await
            .expect("coordination should complete on every member");
    }

    // Each member observed the full three-member round driven by the
    // oldest node.
    let n1_id = n1.local_node().unwrap().id;
    for observations in &observations {
        let observations = observations.lock();
        let last = observations
            .last()
            .expect("every member should process broadcast requests");
        assert_eq!(
            *last,
            Observation {
                members: 3,
                coordinator: n1_id
            }
        );
    }

    for node in nodes {
        node.leave().await.unwrap();
    }
}

fn election_config(cluster: &str, seeds: &[std::net::SocketAddr]) -> HekateConfig {
    let mut config = test_config(cluster, seeds);
    config.coordination.processes = vec![CoordinationProcessConfig::named("leader")];
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn leader_election_follows_the_oldest_member() {
    let (election1, handler1) = LeaderElection::new();
    let n1 = HekateBootstrap::new(election_config("election", &[]))
        .with_coordination_handler("leader", handler1)
        .join()
        .await
        .unwrap();

    let (election2, handler2) = LeaderElection::new();
    let n2 = HekateBootstrap::new(election_config("election", &[addr_of(&n1)]))
        .with_coordination_handler("leader", handler2)
        .join()
        .await
        .unwrap();

    let n1_id = n1.local_node().unwrap().id;
    let n2_id = n2.local_node().unwrap().id;

    for election in [&election1, &election2] {
        let leader = timeout(Duration::from_secs(20), election.leader())
            .await
            .expect("a leader should be announced")
            .unwrap();
        assert_eq!(leader, n1_id, "the oldest member leads");
    }

    // Leader failure: the survivor elects itself.
    n1.terminate().await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        if election2.current() == Some(n2_id) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "survivor should take over leadership"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    n2.leave().await.unwrap();
}
