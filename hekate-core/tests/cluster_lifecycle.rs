//! Cluster lifecycle scenarios: single-node up/down, three-node
//! membership, failure detection, version ordering.

mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::timeout;

use common::{addr_of, eventually, join_node, test_config};
use hekate_core::NodeState;
use hekate_core::cluster::ClusterEvent;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_cluster_up_and_down() {
    let node = join_node(test_config("single", &[])).await;

    assert_eq!(node.state(), NodeState::Up);
    let topology = node.topology();
    assert_eq!(topology.size(), 1);

    let local = node.local_node().unwrap();
    assert_eq!(local.join_order, 1, "founder takes join order 1");

    node.leave().await.unwrap();
    assert_eq!(node.state(), NodeState::Down);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn three_nodes_converge_and_survive_oldest_failure() {
    let n1 = join_node(test_config("rolling", &[])).await;
    let seeds = [addr_of(&n1)];
    let n2 = join_node(test_config("rolling", &seeds)).await;
    let n3 = join_node(test_config("rolling", &seeds)).await;

    let n1_id = n1.local_node().unwrap().id;
    let n2_id = n2.local_node().unwrap().id;

    // Every node converges on a 3-member topology with version >= 3 and
    // n1 as the oldest member.
    for node in [&n1, &n2, &n3] {
        let view = node.cluster_view().unwrap();
        let topology = timeout(
            Duration::from_secs(15),
            view.future_of(|t| t.size() == 3),
        )
        .await
        .expect("topology should converge")
        .unwrap();
        assert!(topology.version() >= 3, "version {} < 3", topology.version());
        assert_eq!(topology.oldest().unwrap().id, n1_id);
    }

    // Join orders are dense and ascending.
    let orders: Vec<u64> = {
        let topology = n3.topology();
        let mut orders: Vec<u64> = topology.nodes().map(|n| n.join_order).collect();
        orders.sort_unstable();
        orders
    };
    assert_eq!(orders, vec![1, 2, 3]);

    // Watch n2 for the change that removes n1.
    let removed_log = Arc::new(Mutex::new(Vec::new()));
    {
        let removed_log = Arc::clone(&removed_log);
        n2.cluster_view().unwrap().listen(Box::new(move |event| {
            if let ClusterEvent::Change { removed, .. } = event {
                removed_log
                    .lock()
                    .extend(removed.iter().map(|node| node.id));
            }
        }));
    }

    n1.terminate().await;

    for node in [&n2, &n3] {
        let view = node.cluster_view().unwrap();
        let topology = timeout(
            Duration::from_secs(15),
            view.future_of(move |t| t.size() == 2),
        )
        .await
        .expect("survivors should detect the failure")
        .unwrap();
        assert_eq!(topology.oldest().unwrap().id, n2_id);
    }
    assert!(
        removed_log.lock().contains(&n1_id),
        "n2 should observe a change event removing n1"
    );

    n2.leave().await.unwrap();
    n3.leave().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn topology_versions_are_strictly_increasing_per_listener() {
    let n1 = join_node(test_config("versions", &[])).await;
    let seeds = [addr_of(&n1)];

    let versions = Arc::new(Mutex::new(Vec::new()));
    {
        let versions = Arc::clone(&versions);
        n1.cluster_view().unwrap().listen(Box::new(move |event| {
            versions.lock().push(event.topology().version());
        }));
    }

    let n2 = join_node(test_config("versions", &seeds)).await;
    let n3 = join_node(test_config("versions", &seeds)).await;
    {
        let view = n1.cluster_view().unwrap();
        timeout(Duration::from_secs(15), view.future_of(|t| t.size() == 3))
            .await
            .expect("convergence")
            .unwrap();
    }
    n3.leave().await.unwrap();
    {
        let view = n1.cluster_view().unwrap();
        timeout(Duration::from_secs(15), view.future_of(|t| t.size() == 2))
            .await
            .expect("leave should shrink the topology")
            .unwrap();
    }

    let seen = versions.lock().clone();
    assert!(seen.len() >= 3, "expected several events, saw {seen:?}");
    for pair in seen.windows(2) {
        assert!(pair[0] < pair[1], "versions must increase: {seen:?}");
    }

    n1.leave().await.unwrap();
    n2.leave().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn rejoining_node_gets_fresh_identity_and_higher_join_order() {
    let n1 = join_node(test_config("rejoin-order", &[])).await;
    let seeds = [addr_of(&n1)];

    let n2 = join_node(test_config("rejoin-order", &seeds)).await;
    let first_id = n2.local_node().unwrap().id;
    let first_order = n2.local_node().unwrap().join_order;
    assert_eq!(first_order, 2);

    n2.terminate().await;
    {
        let view = n1.cluster_view().unwrap();
        timeout(Duration::from_secs(15), view.future_of(|t| t.size() == 1))
            .await
            .expect("n1 should detect the departure")
            .unwrap();
    }

    let n2_again = join_node(test_config("rejoin-order", &seeds)).await;
    let second = n2_again.local_node().unwrap();
    assert_ne!(second.id, first_id, "rejoin must produce a fresh identity");
    assert!(
        second.join_order > first_order,
        "join order {} should exceed the pre-restart order {first_order}",
        second.join_order
    );

    n1.leave().await.unwrap();
    n2_again.leave().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_listener_receives_synthetic_join() {
    let node = join_node(test_config("late-listener", &[])).await;

    let events = Arc::new(Mutex::new(Vec::new()));
    {
        let events = Arc::clone(&events);
        node.cluster_view().unwrap().listen(Box::new(move |event| {
            let kind = match event {
                ClusterEvent::Join(_) => "join",
                ClusterEvent::Change { .. } => "change",
                ClusterEvent::Leave(_) => "leave",
            };
            events.lock().push(kind);
        }));
    }

    eventually(Duration::from_secs(5), || {
        events.lock().first() == Some(&"join")
    })
    .await;

    node.leave().await.unwrap();
}
