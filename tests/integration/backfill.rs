//! Integration test: backfill.
//!
//! Metrics are copied under new names, within a cluster or into another
//! one, and the old names removed only when asked.

use std::collections::BTreeMap;

use bucky_cluster::resolve;
use bucky_integration_tests::{LocalNet, samples};
use bucky_sync::{SyncConfig, SyncEngine, workflow};

const SRC_HOSTS: [&str; 2] = ["graphite001", "graphite002"];
const DST_HOSTS: [&str; 3] = ["graphite101", "graphite102", "graphite103"];

fn renames(n: usize) -> BTreeMap<String, String> {
    (0..n)
        .map(|i| {
            (
                format!("servers.web{i:02}.cpu.user"),
                format!("hosts.web{i:02}.cpu.user"),
            )
        })
        .collect()
}

/// Renaming inside one cluster with `delete` leaves only the new names.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_backfill_renames_within_cluster() {
    let net = LocalNet::new();
    net.add_cluster(&SRC_HOSTS, 4242, "carbon");
    let cluster = resolve("graphite001:4242", net.as_ref()).await.unwrap();

    let map = renames(10);
    for (i, old) in map.keys().enumerate() {
        net.ingest(&cluster.owner(old), old, &samples(8, i as f64));
    }

    let config = SyncConfig {
        delete: true,
        ..SyncConfig::default()
    };
    let engine = SyncEngine::new(config, net.clone());
    let report = workflow::backfill(&engine, &cluster, &cluster, &map)
        .await
        .unwrap();
    assert!(report.success);
    assert_eq!(report.stats.finished_jobs, 10);

    for (i, (old, new)) in map.iter().enumerate() {
        assert!(net.points(&cluster.owner(old), old).is_none(), "{old} kept");
        let moved = net.points(&cluster.owner(new), new).expect("new name present");
        assert_eq!(moved, samples(8, i as f64).into_iter().rev().collect::<Vec<_>>());
    }
}

/// Backfilling into another cluster routes by the destination's ring and
/// keeps the sources without `delete`.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_backfill_into_other_cluster() {
    let net = LocalNet::new();
    net.add_cluster(&SRC_HOSTS, 4242, "carbon");
    net.add_cluster(&DST_HOSTS, 4343, "jump_fnv1a");
    let src = resolve("graphite002:4242", net.as_ref()).await.unwrap();
    let dst = resolve("graphite101:4343", net.as_ref()).await.unwrap();
    assert!(src.is_healthy() && dst.is_healthy());

    let map = renames(20);
    for old in map.keys() {
        net.ingest(&src.owner(old), old, &samples(4, 0.0));
    }

    let engine = SyncEngine::new(SyncConfig::default(), net.clone());
    let report = workflow::backfill(&engine, &src, &dst, &map).await.unwrap();
    assert!(report.success);

    for (old, new) in &map {
        assert!(net.points(&src.owner(old), old).is_some());
        let owner = dst.owner(new);
        assert!(owner.ends_with(":4343"));
        assert_eq!(net.points(&owner, new).map(|p| p.len()), Some(4));
    }
}

/// Old names that do not exist fail the run unless 404s are ignored.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_backfill_missing_metrics() {
    let net = LocalNet::new();
    net.add_cluster(&SRC_HOSTS, 4242, "carbon");
    let cluster = resolve("graphite001:4242", net.as_ref()).await.unwrap();

    let map = renames(4);
    let present = map.keys().next().unwrap().clone();
    net.ingest(&cluster.owner(&present), &present, &samples(2, 0.0));

    let strict = SyncEngine::new(SyncConfig::default(), net.clone());
    let report = workflow::backfill(&strict, &cluster, &cluster, &map)
        .await
        .unwrap();
    assert!(!report.success);
    assert_eq!(report.stats.not_found, 3);

    let lenient = SyncEngine::new(
        SyncConfig {
            ignore_not_found: true,
            ..SyncConfig::default()
        },
        net.clone(),
    );
    let report = workflow::backfill(&lenient, &cluster, &cluster, &map)
        .await
        .unwrap();
    assert!(report.success);
    assert_eq!(report.stats.not_found, 3);
}
