//! Shared test harness for bucky integration tests.
//!
//! Provides [`LocalNet`], a set of in-memory daemons reachable by
//! `host:port`. It implements both [`MetricTransport`] and
//! [`ClusterDirectory`], so the real workflows run end to end against it:
//! metrics live in [`MemorySeries`], incoming points are buffered in a
//! [`WriteCache`] and posting onto an existing metric heals it with
//! [`bucky_fill::fill_all`].

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bucky_cluster::ClusterDirectory;
use bucky_net::{DeleteStatus, MetricTransport, NetError};
use bucky_store::{MemorySeries, Point, Retention, StoreError, TimeSeriesStore, WriteCache};
use bucky_types::{HealStats, MetricData, MetricStat, Node, RingDescriptor};
use bytes::Bytes;
use tracing::debug;

/// Clock shared by every daemon. Aligned to every retention step below.
pub const NOW: i64 = 1_700_000_100;

/// Points a daemon buffers before flushing its largest metric.
const CACHE_POINTS: usize = 64;

/// One minute for an hour, then five minutes for a day.
pub fn retentions() -> Vec<Retention> {
    vec![Retention::new(60, 60), Retention::new(300, 288)]
}

/// Descriptor every member of a cluster of `hosts` reports, as seen from
/// `name`.
pub fn descriptor(name: &str, hosts: &[&str], algo: &str) -> RingDescriptor {
    RingDescriptor {
        name: name.to_string(),
        nodes: hosts
            .iter()
            .enumerate()
            .map(|(i, h)| Node::new(*h, 2004, Some(&i.to_string())))
            .collect(),
        algo: algo.to_string(),
        replicas: 1,
    }
}

/// `count` samples one minute apart, the newest one minute before [`NOW`].
pub fn samples(count: i64, base: f64) -> Vec<Point> {
    (1..=count)
        .map(|k| Point::new(NOW - 60 * k, base + k as f64))
        .collect()
}

// =========================================================================
// Daemons
// =========================================================================

struct LocalDaemon {
    ring: Option<RingDescriptor>,
    series: BTreeMap<String, Arc<MemorySeries>>,
    cache: WriteCache,
}

impl LocalDaemon {
    fn new(ring: Option<RingDescriptor>) -> Self {
        Self {
            ring,
            series: BTreeMap::new(),
            cache: WriteCache::new(CACHE_POINTS),
        }
    }

    fn series_for(&mut self, metric: &str) -> Result<Arc<MemorySeries>, StoreError> {
        if let Some(s) = self.series.get(metric) {
            return Ok(s.clone());
        }
        let s = Arc::new(MemorySeries::new(retentions(), NOW)?);
        self.series.insert(metric.to_string(), s.clone());
        Ok(s)
    }

    fn flush_largest(&mut self) -> Result<(), StoreError> {
        if let Some(entry) = self.cache.pop_largest() {
            self.series_for(&entry.metric)?.update_many(&entry.points)?;
        }
        Ok(())
    }

    fn flush_metric(&mut self, metric: &str) -> Result<(), StoreError> {
        if let Some(entry) = self.cache.take(metric) {
            self.series_for(metric)?.update_many(&entry.points)?;
        }
        Ok(())
    }

    fn flush_all(&mut self) -> Result<(), StoreError> {
        while !self.cache.is_empty() {
            self.flush_largest()?;
        }
        Ok(())
    }
}

/// In-memory daemons keyed by `host:port`.
///
/// Supports failure injection: daemons in the down set refuse every
/// request, read-only daemons refuse writes.
#[derive(Default)]
pub struct LocalNet {
    daemons: Mutex<BTreeMap<String, LocalDaemon>>,
    down: Mutex<HashSet<String>>,
    read_only: Mutex<HashSet<String>>,
}

fn unavailable(server: &str) -> NetError {
    NetError::Status {
        code: 503,
        body: format!("{server} is down"),
    }
}

fn store_failure(e: StoreError) -> NetError {
    NetError::Status {
        code: 500,
        body: e.to_string(),
    }
}

impl LocalNet {
    /// Create an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start one daemon per host at `host:port`, each reporting the ring of
    /// `hosts` under its own name.
    pub fn add_cluster(&self, hosts: &[&str], port: u16, algo: &str) {
        let mut daemons = self.daemons.lock().expect("lock poisoned");
        for host in hosts {
            let ring = descriptor(host, hosts, algo);
            daemons.insert(format!("{host}:{port}"), LocalDaemon::new(Some(ring)));
        }
    }

    /// Start a daemon outside any ring (a retired member being drained).
    pub fn add_daemon(&self, addr: &str) {
        let mut daemons = self.daemons.lock().expect("lock poisoned");
        daemons.insert(addr.to_string(), LocalDaemon::new(None));
    }

    /// Replace the ring `addr` reports.
    pub fn set_ring(&self, addr: &str, ring: RingDescriptor) {
        let mut daemons = self.daemons.lock().expect("lock poisoned");
        if let Some(d) = daemons.get_mut(addr) {
            d.ring = Some(ring);
        }
    }

    /// Take `addr` down or bring it back.
    pub fn set_down(&self, addr: &str, down: bool) {
        let mut set = self.down.lock().expect("lock poisoned");
        if down {
            set.insert(addr.to_string());
        } else {
            set.remove(addr);
        }
    }

    /// Make `addr` refuse incoming metrics while still serving reads.
    pub fn set_read_only(&self, addr: &str, read_only: bool) {
        let mut set = self.read_only.lock().expect("lock poisoned");
        if read_only {
            set.insert(addr.to_string());
        } else {
            set.remove(addr);
        }
    }

    /// Buffer `points` for `metric` on `addr`, as a relay would send them.
    pub fn ingest(&self, addr: &str, metric: &str, points: &[Point]) {
        let mut daemons = self.daemons.lock().expect("lock poisoned");
        let daemon = daemons.get_mut(addr).expect("unknown daemon");
        for point in points {
            daemon.cache.push(metric, *point);
            if daemon.cache.is_full() {
                daemon.flush_largest().expect("ingest within retention");
            }
        }
    }

    /// Stored samples of `metric` on `addr` over the whole retention, or
    /// `None` if the daemon does not hold it.
    pub fn points(&self, addr: &str, metric: &str) -> Option<Vec<Point>> {
        let mut daemons = self.daemons.lock().expect("lock poisoned");
        let daemon = daemons.get_mut(addr)?;
        daemon.flush_metric(metric).expect("flush");
        let series = daemon.series.get(metric)?;

        let mut points = Vec::new();
        let mut until = NOW;
        for retention in series.retentions() {
            let from = NOW - retention.max_retention();
            if let Some(ts) = series.fetch(from, until).expect("fetch") {
                points.extend(ts.points());
            }
            until = from;
        }
        points.sort_by_key(|p| p.timestamp);
        Some(points)
    }

    /// Metric names stored on `addr`.
    pub fn metrics_on(&self, addr: &str) -> Vec<String> {
        let mut daemons = self.daemons.lock().expect("lock poisoned");
        let Some(daemon) = daemons.get_mut(addr) else {
            return Vec::new();
        };
        daemon.flush_all().expect("flush");
        daemon.series.keys().cloned().collect()
    }

    /// Run `f` against a reachable daemon.
    fn with_daemon<T>(
        &self,
        server: &str,
        f: impl FnOnce(&mut LocalDaemon) -> Result<T, NetError>,
    ) -> Result<T, NetError> {
        if self.down.lock().expect("lock poisoned").contains(server) {
            return Err(unavailable(server));
        }
        let mut daemons = self.daemons.lock().expect("lock poisoned");
        let daemon = daemons.get_mut(server).ok_or_else(|| unavailable(server))?;
        f(daemon)
    }

    fn read(&self, server: &str, name: &str) -> Result<(MetricStat, Vec<u8>), NetError> {
        self.with_daemon(server, |d| {
            d.flush_metric(name).map_err(store_failure)?;
            let series = d.series.get(name).ok_or_else(|| NetError::NotFound {
                server: server.to_string(),
                metric: name.to_string(),
            })?;
            let bytes = series.snapshot().map_err(store_failure)?;
            let stat = MetricStat {
                name: name.to_string(),
                size: bytes.len() as i64,
                mode: 0o644,
                mod_time: NOW,
                encoding: 0,
            };
            Ok((stat, bytes))
        })
    }
}

#[async_trait]
impl MetricTransport for LocalNet {
    async fn get_metric(&self, server: &str, name: &str) -> Result<MetricData, NetError> {
        let (stat, bytes) = self.read(server, name)?;
        Ok(MetricData {
            stat,
            data: Bytes::from(bytes),
        })
    }

    async fn post_metric(&self, server: &str, metric: &MetricData) -> Result<HealStats, NetError> {
        if self.read_only.lock().expect("lock poisoned").contains(server) {
            return Err(NetError::Status {
                code: 507,
                body: "disk full".to_string(),
            });
        }
        let name = metric.stat.name.clone();
        self.with_daemon(server, |d| {
            let started = Instant::now();
            let incoming = MemorySeries::from_snapshot(&metric.data, NOW).map_err(store_failure)?;
            let dump = started.elapsed();

            d.flush_metric(&name).map_err(store_failure)?;
            let started = Instant::now();
            match d.series.get(&name) {
                Some(existing) => {
                    let report =
                        bucky_fill::fill_all(&incoming, existing.as_ref(), NOW).map_err(store_failure)?;
                    debug!(%server, metric = %name, points = report.points_written, "healed");
                    Ok(HealStats {
                        dump,
                        fill: started.elapsed(),
                        ..HealStats::default()
                    })
                }
                None => {
                    d.series.insert(name, Arc::new(incoming));
                    Ok(HealStats {
                        dump,
                        copy: started.elapsed(),
                        ..HealStats::default()
                    })
                }
            }
        })
    }

    async fn copy_metric(
        &self,
        src: &str,
        dst: &str,
        old_name: &str,
        new_name: &str,
    ) -> Result<HealStats, NetError> {
        let started = Instant::now();
        let metric = self.get_metric(src, old_name).await?.renamed(new_name);
        let download = started.elapsed().max(Duration::from_nanos(1));
        let heal = self.post_metric(dst, &metric).await?;
        Ok(HealStats { download, ..heal })
    }

    async fn delete_metric(&self, server: &str, name: &str) -> Result<DeleteStatus, NetError> {
        self.with_daemon(server, |d| {
            d.cache.take(name);
            Ok(match d.series.remove(name) {
                Some(_) => DeleteStatus::Deleted,
                None => DeleteStatus::NotFound,
            })
        })
    }

    async fn stat_metric(&self, server: &str, name: &str) -> Result<MetricStat, NetError> {
        Ok(self.read(server, name)?.0)
    }

    async fn list_metrics(&self, server: &str) -> Result<Vec<String>, NetError> {
        self.with_daemon(server, |d| {
            d.flush_all().map_err(store_failure)?;
            Ok(d.series.keys().cloned().collect())
        })
    }
}

#[async_trait]
impl ClusterDirectory for LocalNet {
    async fn ring_descriptor(&self, server: &str) -> Result<RingDescriptor, NetError> {
        self.with_daemon(server, |d| d.ring.clone().ok_or_else(|| unavailable(server)))
    }
}
