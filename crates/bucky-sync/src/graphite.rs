//! Periodic push of sync counters to a carbon plaintext endpoint.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bucky_types::host_of;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::pacer::{NodeHealth, Pacer};
use crate::stats::{Stage, StatsSnapshot, SyncStats};

/// Where and how often run counters are sent.
#[derive(Debug, Clone)]
pub struct GraphiteConfig {
    /// Carbon plaintext listener, `host:port`.
    pub endpoint: String,
    /// Prefix of every metric name.
    pub prefix: String,
    /// Time between pushes.
    pub interval: Duration,
}

impl GraphiteConfig {
    /// Push to `endpoint` every minute under `carbon.buckytools`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            prefix: "carbon.buckytools".to_string(),
            interval: Duration::from_secs(60),
        }
    }
}

/// Sends [`SyncStats`] (and pacing state, when paced) to Graphite.
pub struct GraphiteReporter {
    config: GraphiteConfig,
    stats: Arc<SyncStats>,
    pacer: Option<Arc<Pacer>>,
}

impl GraphiteReporter {
    /// Report `stats` as configured by `config`.
    pub fn new(config: GraphiteConfig, stats: Arc<SyncStats>, pacer: Option<Arc<Pacer>>) -> Self {
        Self {
            config,
            stats,
            pacer,
        }
    }

    /// Push on every tick until `done` turns true, then push once more.
    ///
    /// A failed push is logged and retried on the next tick.
    pub async fn run(self, mut done: watch::Receiver<bool>) {
        let period = self.config.interval.max(Duration::from_millis(100));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            let finished = tokio::select! {
                _ = ticker.tick() => false,
                changed = done.changed() => changed.is_err() || *done.borrow(),
            };
            if let Err(e) = self.push().await {
                warn!(endpoint = %self.config.endpoint, error = %e, "failed to report to graphite");
            }
            if finished {
                break;
            }
        }
    }

    async fn push(&self) -> std::io::Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs() as i64);
        let health = self.pacer.as_ref().map(|p| p.health()).unwrap_or_default();
        let body = render_lines(&self.config.prefix, &self.stats.snapshot(), &health, now);

        let mut conn = TcpStream::connect(&self.config.endpoint).await?;
        conn.write_all(body.as_bytes()).await?;
        conn.shutdown().await?;
        debug!(endpoint = %self.config.endpoint, bytes = body.len(), "reported to graphite");
        Ok(())
    }
}

/// Carbon plaintext lines for one snapshot taken at `ts`.
pub fn render_lines(
    prefix: &str,
    stats: &StatsSnapshot,
    health: &BTreeMap<String, NodeHealth>,
    ts: i64,
) -> String {
    let mut out = String::new();
    let mut line = |name: &str, value: &dyn std::fmt::Display| {
        let _ = writeln!(out, "{prefix}.{name}.last {value} {ts}");
    };

    line("main.total_jobs", &stats.total_jobs);
    line("main.finished_jobs", &stats.finished_jobs);
    line("main.not_found", &stats.not_found);
    line("main.copy_error", &stats.copy_errors);
    line("main.delete_error", &stats.delete_errors);
    for stage in Stage::ALL {
        let stat = stats.stage(stage);
        let stage = stage.name().to_lowercase();
        line(&format!("stage.{stage}.count"), &stat.count);
        line(&format!("stage.{stage}.seconds"), &stat.total.as_secs_f64());
    }
    for (node, finished) in &stats.nodes {
        let name = node_name(node);
        line(&format!("node.{name}.finished_jobs"), finished);
        if let Some(h) = health.get(node) {
            line(&format!("node.{name}.metrics_per_second"), &h.metrics_per_second);
            line(&format!("node.{name}.cache_limit"), &h.cache_limit);
            line(&format!("node.{name}.cache_size"), &h.cache_size);
        }
    }
    out
}

/// Metric-safe name of a node: its host with dots replaced.
fn node_name(addr: &str) -> String {
    host_of(addr).replace('.', "_")
}
