//! Integration test: rebalance.
//!
//! Metrics written to the wrong daemons are moved to their ring owners,
//! merged into whatever the owner already holds.

use std::sync::Arc;

use bucky_cluster::{ClusterError, resolve};
use bucky_integration_tests::{LocalNet, NOW, descriptor, samples};
use bucky_store::Point;
use bucky_sync::{SyncConfig, SyncEngine, SyncError, workflow};

const HOSTS: [&str; 3] = ["graphite001", "graphite002", "graphite003"];

fn engine(net: &Arc<LocalNet>, delete: bool) -> SyncEngine {
    let config = SyncConfig {
        workers: 3,
        delete,
        ..SyncConfig::default()
    };
    SyncEngine::new(config, net.clone())
}

fn metric_names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("servers.web{i:02}.loadavg.01")).collect()
}

/// Every metric starts on graphite001; afterwards each lives on its owner
/// only, with its samples intact.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_rebalance_moves_metrics_to_owner() {
    let net = LocalNet::new();
    net.add_cluster(&HOSTS, 4242, "jump_fnv1a");
    for (i, m) in metric_names(30).iter().enumerate() {
        net.ingest("graphite001:4242", m, &samples(10, i as f64 * 100.0));
    }

    let cluster = resolve("graphite001:4242", net.as_ref()).await.unwrap();
    assert!(cluster.is_healthy());

    let report = workflow::rebalance(&engine(&net, true), &cluster, &[], &[])
        .await
        .unwrap();
    assert!(report.success);
    assert!(report.stats.finished_jobs > 0);
    assert_eq!(report.stats.copy_errors, 0);

    for (i, m) in metric_names(30).iter().enumerate() {
        let owner = cluster.owner(m);
        assert_eq!(
            net.points(&owner, m),
            Some(samples(10, i as f64 * 100.0).into_iter().rev().collect()),
            "{m} on its owner {owner}"
        );
        for host in HOSTS {
            let addr = format!("{host}:4242");
            if addr != owner {
                assert!(net.points(&addr, m).is_none(), "{m} left on {addr}");
            }
        }
    }

    // A second pass has nothing left to do.
    let again = workflow::rebalance(&engine(&net, true), &cluster, &[], &[])
        .await
        .unwrap();
    assert!(again.success);
    assert_eq!(again.stats.total_jobs, 0);
}

/// A misplaced copy fills the gaps of the owner's copy without touching
/// samples the owner already has.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_rebalance_heals_existing_metric() {
    let net = LocalNet::new();
    net.add_cluster(&HOSTS, 4242, "jump_fnv1a");
    let cluster = resolve("graphite002:4242", net.as_ref()).await.unwrap();

    let metric = "servers.db01.disk.used";
    let owner = cluster.owner(metric);
    let stray = HOSTS
        .iter()
        .map(|h| format!("{h}:4242"))
        .find(|a| *a != owner)
        .unwrap();

    // The owner misses minutes 5 through 10; the stray copy has them all
    // with different values.
    let owner_points: Vec<Point> = samples(20, 0.0)
        .into_iter()
        .filter(|p| !(NOW - 600..=NOW - 300).contains(&p.timestamp))
        .collect();
    net.ingest(&owner, metric, &owner_points);
    net.ingest(&stray, metric, &samples(20, 1000.0));

    let report = workflow::rebalance(&engine(&net, true), &cluster, &[], &[])
        .await
        .unwrap();
    assert!(report.success);
    assert_eq!(report.stats.finished_jobs, 1);

    let healed = net.points(&owner, metric).unwrap();
    assert_eq!(healed.len(), 20);
    for p in healed {
        let k = (NOW - p.timestamp) / 60;
        let expected = if (5..=10).contains(&k) {
            1000.0 + k as f64
        } else {
            k as f64
        };
        assert_eq!(p.value, expected, "sample {k} minutes ago");
    }
    assert!(net.points(&stray, metric).is_none());
}

/// A daemon outside the ring is drained when passed as an extra server.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_rebalance_drains_retired_daemon() {
    let net = LocalNet::new();
    net.add_cluster(&HOSTS, 4242, "jump_fnv1a");
    net.add_daemon("graphite009:4242");
    for m in metric_names(12) {
        net.ingest("graphite009:4242", &m, &samples(5, 1.0));
    }

    let cluster = resolve("graphite003:4242", net.as_ref()).await.unwrap();
    let report = workflow::rebalance(
        &engine(&net, true),
        &cluster,
        &["graphite009:4242".to_string()],
        &[],
    )
    .await
    .unwrap();

    assert!(report.success);
    assert_eq!(report.stats.finished_jobs, 12);
    assert!(net.metrics_on("graphite009:4242").is_empty());
    for m in metric_names(12) {
        assert!(net.points(&cluster.owner(&m), &m).is_some());
    }
}

/// Only the allowed destinations receive metrics.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_rebalance_respects_allowed_destinations() {
    let net = LocalNet::new();
    net.add_cluster(&HOSTS, 4242, "jump_fnv1a");
    for m in metric_names(30) {
        net.ingest("graphite001:4242", &m, &samples(3, 1.0));
    }
    let cluster = resolve("graphite001:4242", net.as_ref()).await.unwrap();

    let allowed = ["graphite002:4242".to_string()];
    let report = workflow::rebalance(&engine(&net, true), &cluster, &[], &allowed)
        .await
        .unwrap();
    assert!(report.success);

    assert!(net.metrics_on("graphite003:4242").is_empty());
    for m in net.metrics_on("graphite001:4242") {
        assert_ne!(cluster.owner(&m), "graphite002:4242", "{m} was not moved");
    }
}

/// Copies that fail never delete their source.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_failed_copy_keeps_source() {
    let net = LocalNet::new();
    net.add_cluster(&HOSTS, 4242, "jump_fnv1a");
    for m in metric_names(30) {
        net.ingest("graphite001:4242", &m, &samples(3, 1.0));
    }
    let cluster = resolve("graphite001:4242", net.as_ref()).await.unwrap();
    let before = net.metrics_on("graphite001:4242");

    net.set_read_only("graphite002:4242", true);
    let report = workflow::rebalance(&engine(&net, true), &cluster, &[], &[])
        .await
        .unwrap();

    assert!(!report.success);
    assert!(report.stats.copy_errors > 0);
    let after = net.metrics_on("graphite001:4242");
    for m in &before {
        if cluster.owner(m) == "graphite002:4242" {
            assert!(after.contains(m), "{m} deleted although its copy failed");
        } else if cluster.owner(m) != "graphite001:4242" {
            assert!(!after.contains(m), "{m} should have moved");
        }
    }
}

/// Members disagreeing about the ring stop the workflow before any move.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_unhealthy_cluster_is_refused() {
    let net = LocalNet::new();
    net.add_cluster(&HOSTS, 4242, "jump_fnv1a");
    net.set_ring(
        "graphite003:4242",
        descriptor("graphite003", &HOSTS, "carbon"),
    );
    net.ingest("graphite001:4242", "a.b.c", &samples(3, 1.0));

    let cluster = resolve("graphite001:4242", net.as_ref()).await.unwrap();
    assert!(!cluster.is_healthy());

    let err = workflow::rebalance(&engine(&net, true), &cluster, &[], &[])
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Cluster(ClusterError::Unhealthy)));
    assert_eq!(net.metrics_on("graphite001:4242"), ["a.b.c"]);
}

/// Listing misplaced metrics is read only and goes ahead on an unhealthy
/// cluster.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_inconsistent_lists_despite_unhealthy_cluster() {
    let net = LocalNet::new();
    net.add_cluster(&HOSTS, 4242, "jump_fnv1a");
    net.add_daemon("graphite009:4242");
    net.set_ring(
        "graphite003:4242",
        descriptor("graphite003", &HOSTS, "carbon"),
    );
    net.ingest("graphite009:4242", "retired.metric", &samples(3, 1.0));

    let cluster = resolve("graphite001:4242", net.as_ref()).await.unwrap();
    assert!(!cluster.is_healthy());

    let found = workflow::inconsistent(net.clone(), &cluster, &["graphite009:4242".to_string()])
        .await
        .unwrap();
    assert_eq!(found["graphite009:4242"], ["retired.metric"]);
    // Nothing was moved.
    assert_eq!(net.metrics_on("graphite009:4242"), ["retired.metric"]);
}

/// A dry run plans the moves but leaves every daemon untouched.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_dry_run_moves_nothing() {
    let net = LocalNet::new();
    net.add_cluster(&HOSTS, 4242, "jump_fnv1a");
    for m in metric_names(10) {
        net.ingest("graphite001:4242", &m, &samples(3, 1.0));
    }
    let cluster = resolve("graphite001:4242", net.as_ref()).await.unwrap();

    let config = SyncConfig {
        dry_run: true,
        delete: true,
        ..SyncConfig::default()
    };
    let report = workflow::rebalance(
        &SyncEngine::new(config, net.clone()),
        &cluster,
        &[],
        &[],
    )
    .await
    .unwrap();

    assert!(report.success);
    assert!(report.dry_run);
    assert_eq!(net.metrics_on("graphite001:4242").len(), 10);
    assert!(net.metrics_on("graphite002:4242").is_empty());
}
