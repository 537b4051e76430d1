//! Job builders and drivers for the relocation workflows.
//!
//! - rebalance: move every metric found off its ring owner to that owner.
//! - backfill: copy metrics under new names, possibly into another cluster.
//! - copy: copy everything one daemon holds to another daemon.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bucky_cluster::ClusterConfig;
use bucky_net::MetricTransport;
use bucky_types::{SyncJob, clean_metric, host_of};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::engine::{JobSet, SyncEngine, SyncReport, count_jobs};
use crate::error::SyncError;
use crate::stats::StatsSnapshot;

/// Metrics with this prefix are injected by relays after hashing and never
/// live on their ring owner.
pub const AGENT_PREFIX: &str = "carbon.agents.";

/// Fetch the metric list of every server concurrently.
///
/// Every server is asked even when one fails; the first failure is
/// returned.
pub async fn list_all(
    transport: Arc<dyn MetricTransport>,
    servers: &[String],
) -> Result<BTreeMap<String, Vec<String>>, SyncError> {
    let mut requests = JoinSet::new();
    for server in servers {
        let transport = transport.clone();
        let server = server.clone();
        requests.spawn(async move {
            let result = transport.list_metrics(&server).await;
            (server, result)
        });
    }

    let mut listing = BTreeMap::new();
    let mut failure = None;
    while let Some(joined) = requests.join_next().await {
        let (server, result) = joined?;
        match result {
            Ok(metrics) => {
                info!(%server, count = metrics.len(), "listed metrics");
                listing.insert(server, metrics);
            }
            Err(source) => {
                error!(%server, error = %source, "listing metrics failed");
                if failure.is_none() {
                    failure = Some(SyncError::Listing { server, source });
                }
            }
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(listing),
    }
}

/// Metrics found on a server that does not own them, keyed by the
/// `host:port` they were found on and sorted.
pub fn inconsistent_metrics(
    cluster: &ClusterConfig,
    listing: &BTreeMap<String, Vec<String>>,
) -> BTreeMap<String, Vec<String>> {
    let mut result: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (server, metrics) in listing {
        let host = host_of(server);
        let mut misplaced: Vec<String> = metrics
            .iter()
            .filter(|m| !m.starts_with(AGENT_PREFIX))
            .filter(|m| cluster.owner_host(m) != host)
            .cloned()
            .collect();
        if misplaced.is_empty() {
            continue;
        }
        misplaced.sort();
        info!(%server, count = misplaced.len(), "inconsistent metrics found");
        result.insert(server.clone(), misplaced);
    }
    if result.is_empty() {
        info!("no inconsistent metrics found");
    }
    result
}

/// List the cluster's daemons plus `extra_servers` and report the metrics
/// stored off their owner.
///
/// Read only, so an unhealthy cluster is only warned about.
pub async fn inconsistent(
    transport: Arc<dyn MetricTransport>,
    cluster: &ClusterConfig,
    extra_servers: &[String],
) -> Result<BTreeMap<String, Vec<String>>, SyncError> {
    if !cluster.is_healthy() {
        warn!("cluster is not healthy, listing anyway");
    }
    let mut servers = cluster.host_ports();
    servers.extend(extra_servers.iter().cloned());
    let listing = list_all(transport, &servers).await?;
    Ok(inconsistent_metrics(cluster, &listing))
}

/// Jobs moving every inconsistent metric in `listing` to its owner.
///
/// A non-empty `allowed_dsts` drops jobs whose destination is not listed.
pub fn rebalance_jobs(
    cluster: &ClusterConfig,
    listing: &BTreeMap<String, Vec<String>>,
    allowed_dsts: &[String],
) -> JobSet {
    let allowed: BTreeSet<&str> = allowed_dsts.iter().map(|s| s.trim()).collect();
    let mut jobs = JobSet::new();
    for (src, metrics) in inconsistent_metrics(cluster, listing) {
        info!(server = %src, count = metrics.len(), "metrics must be relocated");
        for metric in metrics {
            let dst = cluster.owner(&metric);
            if !allowed.is_empty() && !allowed.contains(dst.as_str()) {
                continue;
            }
            let job = SyncJob::relocate(metric, src.clone(), dst.clone());
            jobs.entry(dst).or_default().entry(src.clone()).or_default().push(job);
        }
    }
    jobs
}

/// Jobs copying each `old` metric of `map` to its `new` name.
///
/// Sources are located with `src_cluster`'s ring and destinations with
/// `dst_cluster`'s; both may be the same cluster. New names are cleaned.
pub fn backfill_jobs(
    src_cluster: &ClusterConfig,
    dst_cluster: &ClusterConfig,
    map: &BTreeMap<String, String>,
) -> JobSet {
    let mut jobs = JobSet::new();
    for (old, new) in map {
        let new = clean_metric(new);
        let src = src_cluster.owner(old);
        let dst = dst_cluster.owner(&new);
        let job = SyncJob {
            old_name: old.clone(),
            new_name: new,
            src: src.clone(),
            dst: dst.clone(),
        };
        jobs.entry(dst).or_default().entry(src).or_default().push(job);
    }
    for (dst, by_src) in &jobs {
        for (src, list) in by_src {
            info!(%src, %dst, count = list.len(), "backfill route");
        }
    }
    jobs
}

/// Jobs copying `metrics` from `src` to `dst` under the same names.
pub fn copy_jobs(src: &str, dst: &str, metrics: &[String]) -> JobSet {
    let jobs: Vec<SyncJob> = metrics
        .iter()
        .map(|m| SyncJob::relocate(m.clone(), src, dst))
        .collect();
    JobSet::from([(dst.to_string(), BTreeMap::from([(src.to_string(), jobs)]))])
}

fn nothing_to_do(engine: &SyncEngine) -> SyncReport {
    SyncReport {
        success: true,
        dry_run: engine.config().dry_run,
        stats: StatsSnapshot::default(),
    }
}

/// Relocate every metric in a healthy cluster to its ring owner.
///
/// `extra_servers` (`host:port`) are listed as well, which drains daemons
/// being removed from the ring.
pub async fn rebalance(
    engine: &SyncEngine,
    cluster: &ClusterConfig,
    extra_servers: &[String],
    allowed_dsts: &[String],
) -> Result<SyncReport, SyncError> {
    cluster.require_healthy()?;
    let mut servers = cluster.host_ports();
    servers.extend(extra_servers.iter().cloned());

    let listing = list_all(engine.transport(), &servers).await?;
    let jobs = rebalance_jobs(cluster, &listing, allowed_dsts);
    if jobs.is_empty() {
        info!("cluster is balanced");
        return Ok(nothing_to_do(engine));
    }
    engine.run(jobs).await
}

/// Copy metrics to new names as given by `map` (old name to new name).
pub async fn backfill(
    engine: &SyncEngine,
    src_cluster: &ClusterConfig,
    dst_cluster: &ClusterConfig,
    map: &BTreeMap<String, String>,
) -> Result<SyncReport, SyncError> {
    src_cluster.require_healthy()?;
    dst_cluster.require_healthy()?;
    info!(count = map.len(), "backfilling metrics");
    engine.run(backfill_jobs(src_cluster, dst_cluster, map)).await
}

/// Copy every metric held by `src` to `dst`.
pub async fn copy(engine: &SyncEngine, src: &str, dst: &str) -> Result<SyncReport, SyncError> {
    let mut listing = list_all(engine.transport(), &[src.to_string()]).await?;
    let metrics = listing.remove(src).unwrap_or_default();
    let jobs = copy_jobs(src, dst, &metrics);
    info!(count = count_jobs(&jobs), %src, %dst, "metrics to copy");
    if metrics.is_empty() {
        return Ok(nothing_to_do(engine));
    }
    engine.run(jobs).await
}
