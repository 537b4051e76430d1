//! Per-node sync pacing driven by go-carbon cache health.
//!
//! Every node touched by a run gets a token bucket refilled at its current
//! metrics-per-second rate. A job takes one token from its destination and
//! one from its source. Rates start at the configured base and creep up on
//! each speed-up tick while the node's go-carbon cache stays below the
//! threshold; an overloaded or unobserved cache drops the rate back to base.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use bucky_net::{CacheInfo, CacheSource};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, Interval};
use tracing::{debug, info, warn};

/// Tokens a node may bank while nobody is asking.
const TOKEN_BUCKET: usize = 120;

/// Cache readings older than this no longer justify a raised rate.
const STALE_AFTER: Duration = Duration::from_secs(15 * 60);

/// Pacing settings of a sync run.
#[derive(Debug, Clone)]
pub struct PacingConfig {
    /// Starting and floor rate per node.
    pub metrics_per_second: u64,
    /// How often a healthy node's rate grows. `None` keeps rates fixed.
    pub speed_up_interval: Option<Duration>,
    /// How often go-carbon caches are read.
    pub check_interval: Duration,
    /// Share of the cache limit at which a node counts as overloaded.
    pub cache_threshold: f64,
    /// Randomly slow down nodes running at three times the base rate.
    pub random_easing: bool,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            metrics_per_second: 1,
            speed_up_interval: Some(Duration::from_secs(600)),
            check_interval: Duration::from_secs(10),
            cache_threshold: 0.75,
            random_easing: true,
        }
    }
}

/// Pacing state of one node at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHealth {
    /// Current rate.
    pub metrics_per_second: u64,
    /// Last cache size read.
    pub cache_size: i64,
    /// Last cache limit read.
    pub cache_limit: i64,
}

struct NodePace {
    addr: String,
    rate: AtomicU64,
    cache_size: AtomicI64,
    cache_limit: AtomicI64,
    refreshed_at: StdMutex<Option<Instant>>,
    tokens: Semaphore,
    reset: Notify,
}

/// Token buckets for every node of a run.
pub struct Pacer {
    config: PacingConfig,
    nodes: BTreeMap<String, Arc<NodePace>>,
}

impl Pacer {
    /// Buckets for `nodes` (`host:port`), all empty and at the base rate.
    pub fn new(config: PacingConfig, nodes: impl IntoIterator<Item = String>) -> Arc<Self> {
        let base = config.metrics_per_second.max(1);
        let nodes = nodes
            .into_iter()
            .map(|addr| {
                let pace = NodePace {
                    addr: addr.clone(),
                    rate: AtomicU64::new(base),
                    cache_size: AtomicI64::new(0),
                    cache_limit: AtomicI64::new(0),
                    refreshed_at: StdMutex::new(None),
                    tokens: Semaphore::new(0),
                    reset: Notify::new(),
                };
                (addr, Arc::new(pace))
            })
            .collect();
        Arc::new(Self { config, nodes })
    }

    /// Spawn the refill task of every node and, given a cache source, the
    /// cache monitor. The tasks run until aborted.
    pub fn start(self: &Arc<Self>, source: Option<Arc<dyn CacheSource>>) -> Vec<JoinHandle<()>> {
        let mut handles: Vec<JoinHandle<()>> = self
            .nodes
            .values()
            .map(|node| tokio::spawn(self.clone().refill(node.clone())))
            .collect();
        if let Some(source) = source {
            handles.push(tokio::spawn(self.clone().monitor(source)));
        }
        info!(
            nodes = self.nodes.len(),
            base = self.base_rate(),
            "sync pacing enabled"
        );
        handles
    }

    /// Wait for a token of `node`. Nodes outside the run are not paced.
    pub async fn acquire(&self, node: &str) {
        let Some(pace) = self.nodes.get(node) else {
            return;
        };
        if let Ok(permit) = pace.tokens.acquire().await {
            permit.forget();
        }
    }

    /// Current rate of `node`.
    pub fn rate(&self, node: &str) -> Option<u64> {
        self.nodes.get(node).map(|p| p.rate.load(Ordering::Relaxed))
    }

    /// Record a cache reading for `node`. An overloaded reading drops the
    /// node back to the base rate at once.
    pub fn record_cache(&self, node: &str, info: CacheInfo) {
        if let Some(pace) = self.nodes.get(node) {
            self.observe(pace, info);
        }
    }

    /// Pacing state of every node.
    pub fn health(&self) -> BTreeMap<String, NodeHealth> {
        self.nodes
            .iter()
            .map(|(addr, p)| {
                let health = NodeHealth {
                    metrics_per_second: p.rate.load(Ordering::Relaxed),
                    cache_size: p.cache_size.load(Ordering::Relaxed),
                    cache_limit: p.cache_limit.load(Ordering::Relaxed),
                };
                (addr.clone(), health)
            })
            .collect()
    }

    fn base_rate(&self) -> u64 {
        self.config.metrics_per_second.max(1)
    }

    /// A node whose cache was never read counts as overloaded.
    fn is_overloaded(&self, pace: &NodePace) -> bool {
        let size = pace.cache_size.load(Ordering::Relaxed) as f64;
        let limit = pace.cache_limit.load(Ordering::Relaxed) as f64;
        size >= limit * self.config.cache_threshold
    }

    fn is_stale(pace: &NodePace) -> bool {
        pace.refreshed_at
            .lock()
            .expect("lock poisoned")
            .is_some_and(|at| at.elapsed() >= STALE_AFTER)
    }

    fn observe(&self, pace: &NodePace, info: CacheInfo) {
        pace.cache_size.store(info.size, Ordering::Relaxed);
        pace.cache_limit.store(info.limit, Ordering::Relaxed);
        *pace.refreshed_at.lock().expect("lock poisoned") = Some(Instant::now());
        if self.is_overloaded(pace) {
            warn!(node = %pace.addr, size = info.size, limit = info.limit, "go-carbon cache overloaded, slowing down");
            pace.rate.store(self.base_rate(), Ordering::Relaxed);
            pace.reset.notify_one();
        }
    }

    async fn refill(self: Arc<Self>, pace: Arc<NodePace>) {
        let base = self.base_rate();
        let mut rng = StdRng::from_os_rng();
        let mut speed_up = self
            .config
            .speed_up_interval
            .map(|p| tokio::time::interval_at(Instant::now() + p, p));
        let mut next_token = Instant::now() + token_period(base);

        loop {
            tokio::select! {
                _ = pace.reset.notified() => {
                    pace.rate.store(base, Ordering::Relaxed);
                    next_token = Instant::now() + token_period(base);
                }
                _ = next_tick(&mut speed_up) => {
                    let current = pace.rate.load(Ordering::Relaxed);
                    let next = next_rate(
                        current,
                        base,
                        self.is_overloaded(&pace),
                        Self::is_stale(&pace),
                        self.config.random_easing,
                        &mut rng,
                    );
                    debug!(node = %pace.addr, from = current, to = next, "sync rate adjusted");
                    pace.rate.store(next, Ordering::Relaxed);
                    next_token = Instant::now() + token_period(next);
                }
                _ = tokio::time::sleep_until(next_token) => {
                    if pace.tokens.available_permits() < TOKEN_BUCKET {
                        pace.tokens.add_permits(1);
                    }
                    next_token = Instant::now() + token_period(pace.rate.load(Ordering::Relaxed));
                }
            }
        }
    }

    async fn monitor(self: Arc<Self>, source: Arc<dyn CacheSource>) {
        let period = self.config.check_interval.max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let mut checks = JoinSet::new();
            for pace in self.nodes.values() {
                let source = source.clone();
                let pace = pace.clone();
                checks.spawn(async move {
                    let result = source.cache_info(&pace.addr).await;
                    (pace, result)
                });
            }
            while let Some(joined) = checks.join_next().await {
                let Ok((pace, result)) = joined else {
                    continue;
                };
                match result {
                    Ok(info) => self.observe(&pace, info),
                    Err(e) => warn!(node = %pace.addr, error = %e, "failed to read go-carbon health"),
                }
            }
        }
    }
}

fn token_period(rate: u64) -> Duration {
    Duration::from_secs(1) / rate.clamp(1, u32::MAX as u64) as u32
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Rate of a node after one speed-up tick.
///
/// Overloaded or stale nodes return to `base`. Otherwise the rate grows by
/// one to five, except that with `easing` a node at three times `base` or
/// more is slowed to a random rate four times in ten.
pub fn next_rate(
    current: u64,
    base: u64,
    overloaded: bool,
    stale: bool,
    easing: bool,
    rng: &mut impl Rng,
) -> u64 {
    if overloaded || stale {
        return base;
    }
    if easing && current >= base * 3 && rng.random_range(0..10) <= 3 {
        return base.max(rng.random_range(1..=current));
    }
    current + rng.random_range(1..=5)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pacer(rate: u64, speed_up: Option<Duration>) -> Arc<Pacer> {
        let config = PacingConfig {
            metrics_per_second: rate,
            speed_up_interval: speed_up,
            random_easing: false,
            ..Default::default()
        };
        Pacer::new(config, ["g1:4242".to_string(), "g2:4242".to_string()])
    }

    fn healthy() -> CacheInfo {
        CacheInfo {
            size: 10,
            limit: 1000,
        }
    }

    #[test]
    fn test_next_rate_resets_when_overloaded_or_stale() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(next_rate(40, 4, true, false, false, &mut rng), 4);
        assert_eq!(next_rate(40, 4, false, true, false, &mut rng), 4);
    }

    #[test]
    fn test_next_rate_grows_by_one_to_five() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let next = next_rate(10, 4, false, false, false, &mut rng);
            assert!((11..=15).contains(&next), "{next}");
        }
    }

    #[test]
    fn test_next_rate_easing_slows_fast_nodes() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut eased = 0;
        let mut grown = 0;
        for _ in 0..200 {
            let next = next_rate(30, 2, false, false, true, &mut rng);
            if next <= 30 {
                assert!(next >= 2);
                eased += 1;
            } else {
                assert!(next <= 35);
                grown += 1;
            }
        }
        assert!(eased > 0 && grown > 0, "eased {eased}, grown {grown}");

        // Below three times the base easing never applies.
        for _ in 0..100 {
            assert!(next_rate(5, 2, false, false, true, &mut rng) > 5);
        }
    }

    #[test]
    fn test_unread_cache_counts_as_overloaded() {
        let pacer = pacer(1, None);
        let pace = pacer.nodes["g1:4242"].clone();
        assert!(pacer.is_overloaded(&pace));

        pacer.record_cache("g1:4242", healthy());
        assert!(!pacer.is_overloaded(&pace));

        pacer.record_cache("g1:4242", CacheInfo { size: 750, limit: 1000 });
        assert!(pacer.is_overloaded(&pace));
        let health = pacer.health();
        assert_eq!(health["g1:4242"].cache_size, 750);
        assert_eq!(health["g1:4242"].cache_limit, 1000);
        assert_eq!(health["g2:4242"].cache_limit, 0);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn test_acquire_follows_rate() {
        let pacer = pacer(20, None);
        let tasks = pacer.start(None);

        let started = Instant::now();
        for _ in 0..6 {
            pacer.acquire("g1:4242").await;
        }
        // Buckets start empty; one token every 50ms.
        assert!(started.elapsed() >= Duration::from_millis(250), "{:?}", started.elapsed());

        // Unknown nodes are never held up.
        let started = Instant::now();
        pacer.acquire("elsewhere:4242").await;
        assert!(started.elapsed() < Duration::from_millis(50));

        for task in tasks {
            task.abort();
        }
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn test_healthy_nodes_speed_up_and_overload_resets() {
        let pacer = pacer(2, Some(Duration::from_millis(20)));
        pacer.record_cache("g1:4242", healthy());
        let tasks = pacer.start(None);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(pacer.rate("g1:4242").unwrap() > 2);
        // g2 never reported its cache.
        assert_eq!(pacer.rate("g2:4242"), Some(2));

        pacer.record_cache("g1:4242", CacheInfo { size: 900, limit: 1000 });
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(pacer.rate("g1:4242"), Some(2));

        for task in tasks {
            task.abort();
        }
    }
}
