//! Cluster membership integration tests over real localhost sockets.
//!
//! Timings are compressed (fast ticks, tight suspicion windows) so the
//! full join → probe → fail cycle runs in seconds.

use simurgh::{HealthStatus, Monitor, NodeAddr, SimurghConfig};
use std::time::Duration;

fn fast_config() -> SimurghConfig {
    let mut config = SimurghConfig::with_secret("membership-test-secret");
    config.boot_wait = Duration::from_millis(100);
    config.health_poll_interval = Duration::from_millis(200);
    config.health_check_timeout = Duration::from_millis(250);
    config.cleanup_interval = Duration::from_secs(30);
    config.registration_timeout = Duration::from_secs(5);
    config.tcp_connect_retries = 0;
    config.min_suspect_timeout_multiplier = 1.0;
    config.max_suspect_timeout_multiplier = 2.0;
    config
}

fn addr(port: u16) -> NodeAddr {
    ("127.0.0.1".to_string(), port)
}

/// Poll until `check` passes or the budget runs out.
async fn wait_for<F>(budget: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let started = tokio::time::Instant::now();
    while started.elapsed() < budget {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    check()
}

#[tokio::test]
async fn test_join_and_probe() {
    let config = fast_config();

    let seed = Monitor::new("127.0.0.1", 18000, 1, &config);
    seed.start().await.unwrap();
    seed.start_standalone();

    let joiner = Monitor::new("127.0.0.1", 18010, 1, &config);
    joiner.start().await.unwrap();
    joiner.register(&addr(18000)).await.unwrap();

    assert_eq!(joiner.status(), HealthStatus::Healthy);
    assert_eq!(joiner.status_of(&addr(18000)), Some(HealthStatus::Healthy));

    // Within boot wait plus a couple of probe ticks both tables hold
    // the other node as healthy.
    let seen = wait_for(Duration::from_secs(5), || {
        seed.status_of(&addr(18010)) == Some(HealthStatus::Healthy)
            && joiner.status_of(&addr(18000)) == Some(HealthStatus::Healthy)
    })
    .await;
    assert!(seen, "nodes never converged: seed={:?} joiner={:?}",
        seed.node_statuses(), joiner.node_statuses());

    joiner.shutdown().await;
    seed.shutdown().await;
}

#[tokio::test]
async fn test_newcomer_learns_cluster_through_seed() {
    let config = fast_config();

    let seed = Monitor::new("127.0.0.1", 18100, 1, &config);
    seed.start().await.unwrap();
    seed.start_standalone();

    let second = Monitor::new("127.0.0.1", 18110, 1, &config);
    second.start().await.unwrap();
    second.register(&addr(18100)).await.unwrap();

    let third = Monitor::new("127.0.0.1", 18120, 1, &config);
    third.start().await.unwrap();
    third.register(&addr(18100)).await.unwrap();

    // The seed introduces the peers to each other; the mesh closes
    // without the second and third node ever dialing each other
    // explicitly.
    let meshed = wait_for(Duration::from_secs(8), || {
        second.status_of(&addr(18120)) == Some(HealthStatus::Healthy)
            && third.status_of(&addr(18110)) == Some(HealthStatus::Healthy)
    })
    .await;
    assert!(meshed, "mesh never closed: second={:?} third={:?}",
        second.node_statuses(), third.node_statuses());

    third.shutdown().await;
    second.shutdown().await;
    seed.shutdown().await;
}

#[tokio::test]
async fn test_killed_node_becomes_failed() {
    let config = fast_config();

    let seed = Monitor::new("127.0.0.1", 18200, 1, &config);
    seed.start().await.unwrap();
    seed.start_standalone();

    let survivor = Monitor::new("127.0.0.1", 18210, 1, &config);
    survivor.start().await.unwrap();
    survivor.register(&addr(18200)).await.unwrap();

    let victim = Monitor::new("127.0.0.1", 18220, 1, &config);
    victim.start().await.unwrap();
    victim.register(&addr(18200)).await.unwrap();

    let meshed = wait_for(Duration::from_secs(8), || {
        seed.status_of(&addr(18220)) == Some(HealthStatus::Healthy)
            && survivor.status_of(&addr(18220)) == Some(HealthStatus::Healthy)
    })
    .await;
    assert!(meshed, "mesh never formed");

    victim.shutdown().await;

    // Every surviving node ends up reporting the victim as failed
    // (or already reaped) once the suspicion window closes.
    let gone = |status: Option<HealthStatus>| {
        status.is_none() || status == Some(HealthStatus::Failed)
    };

    let detected = wait_for(Duration::from_secs(20), || {
        gone(seed.status_of(&addr(18220))) && gone(survivor.status_of(&addr(18220)))
    })
    .await;
    assert!(detected, "victim never marked failed: seed={:?} survivor={:?}",
        seed.node_statuses(), survivor.node_statuses());

    // The survivors still consider each other healthy.
    assert_eq!(seed.status_of(&addr(18210)), Some(HealthStatus::Healthy));
    assert_eq!(survivor.status_of(&addr(18200)), Some(HealthStatus::Healthy));

    survivor.shutdown().await;
    seed.shutdown().await;
}
