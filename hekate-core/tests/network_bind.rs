//! Transport boundary behaviors: port-range binding and ping semantics.

use std::sync::Arc;
use std::time::Duration;

use hekate_core::config::NetworkConfig;
use hekate_core::metrics::MetricsRegistry;
use hekate_core::network::{NetworkError, NetworkService, PingResult};

fn config(port: u16, port_range: u16) -> NetworkConfig {
    NetworkConfig {
        port,
        port_range,
        connect_timeout: Duration::from_secs(1),
        ..NetworkConfig::default()
    }
}

#[tokio::test]
async fn os_assigned_port_binds() {
    let service = NetworkService::new(config(0, 10), Arc::new(MetricsRegistry::new()));
    let addr = service.start().unwrap();
    assert_ne!(addr.port(), 0);
    service.stop().await;
}

#[tokio::test]
async fn exhausted_port_range_fails_with_typed_error() {
    // Occupy one port, then try to bind exactly that port with a range of
    // one.
    let first = NetworkService::new(config(0, 1), Arc::new(MetricsRegistry::new()));
    let taken = first.start().unwrap();

    let second = NetworkService::new(
        config(taken.port(), 1),
        Arc::new(MetricsRegistry::new()),
    );
    match second.start() {
        Err(NetworkError::BindExhausted {
            start_port,
            attempts,
            ..
        }) => {
            assert_eq!(start_port, taken.port());
            assert_eq!(attempts, 1);
        }
        other => panic!("expected BindExhausted, got {other:?}"),
    }

    first.stop().await;
}

#[tokio::test]
async fn port_range_walks_past_taken_ports() {
    let first = NetworkService::new(config(0, 1), Arc::new(MetricsRegistry::new()));
    let taken = first.start().unwrap();

    let second = NetworkService::new(
        config(taken.port(), 16),
        Arc::new(MetricsRegistry::new()),
    );
    let bound = second.start().unwrap();
    assert!(bound.port() > taken.port());
    assert!(u32::from(bound.port()) < u32::from(taken.port()) + 16);

    first.stop().await;
    second.stop().await;
}

#[tokio::test]
async fn ping_reports_success_timeout_and_failure() {
    let service = NetworkService::new(config(0, 1), Arc::new(MetricsRegistry::new()));
    let addr = service.start().unwrap();

    // A live transport answers.
    assert_eq!(service.ping(addr).await, PingResult::Success);

    // Refused connection (nothing listens on port 1).
    assert_eq!(
        service.ping("127.0.0.1:1".parse().unwrap()).await,
        PingResult::Failure
    );

    // A non-routable address times out within the connect budget.
    let started = tokio::time::Instant::now();
    let result = service.ping("10.255.255.1:9".parse().unwrap()).await;
    let elapsed = started.elapsed();
    assert!(
        matches!(result, PingResult::Timeout | PingResult::Failure),
        "unroutable ping should not succeed"
    );
    assert!(elapsed < Duration::from_secs(5));

    service.stop().await;
}
