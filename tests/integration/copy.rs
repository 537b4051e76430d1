//! Integration test: copy.
//!
//! Everything one daemon holds is copied to another, directly or offloaded
//! to the destination.

use bucky_integration_tests::{LocalNet, samples};
use bucky_sync::{SyncConfig, SyncEngine, SyncError, workflow};

fn seeded_net(count: usize) -> std::sync::Arc<LocalNet> {
    let net = LocalNet::new();
    net.add_daemon("old001:4242");
    net.add_daemon("new001:4242");
    for i in 0..count {
        net.ingest("old001:4242", &format!("apps.api.req{i:03}"), &samples(6, i as f64));
    }
    net
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_copy_all_metrics() {
    let net = seeded_net(25);
    let engine = SyncEngine::new(SyncConfig::default(), net.clone());

    let report = workflow::copy(&engine, "old001:4242", "new001:4242")
        .await
        .unwrap();
    assert!(report.success);
    assert_eq!(report.stats.finished_jobs, 25);

    assert_eq!(net.metrics_on("new001:4242"), net.metrics_on("old001:4242"));
    for m in net.metrics_on("old001:4242") {
        assert_eq!(net.points("new001:4242", &m), net.points("old001:4242", &m));
    }
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_copy_offloaded_with_delete() {
    let net = seeded_net(10);
    let config = SyncConfig {
        offload: true,
        delete: true,
        workers: 2,
        ..SyncConfig::default()
    };
    let engine = SyncEngine::new(config, net.clone());

    let report = workflow::copy(&engine, "old001:4242", "new001:4242")
        .await
        .unwrap();
    assert!(report.success);
    assert_eq!(net.metrics_on("new001:4242").len(), 10);
    assert!(net.metrics_on("old001:4242").is_empty());
    assert!(report.stats.stage(bucky_sync::Stage::Download).count > 0);
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_copy_from_empty_daemon() {
    let net = seeded_net(0);
    let engine = SyncEngine::new(SyncConfig::default(), net.clone());
    let report = workflow::copy(&engine, "old001:4242", "new001:4242")
        .await
        .unwrap();
    assert!(report.success);
    assert_eq!(report.stats.total_jobs, 0);
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_copy_from_unreachable_daemon() {
    let net = seeded_net(3);
    net.set_down("old001:4242", true);
    let engine = SyncEngine::new(SyncConfig::default(), net.clone());

    let err = workflow::copy(&engine, "old001:4242", "new001:4242")
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Listing { ref server, .. } if server == "old001:4242"));
    assert!(net.metrics_on("new001:4242").is_empty());
}
