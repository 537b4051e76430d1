//! Periodic progress reporting for a sync run.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::stats::SyncStats;

/// Why the reporter stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReporterExit {
    /// The run finished.
    Completed,
    /// A forced exit was requested.
    ForceQuit,
}

/// Logs throughput and ETA on a fixed tick until the run finishes.
pub struct ProgressReporter {
    stats: Arc<SyncStats>,
    interval: Duration,
    delete: bool,
}

impl ProgressReporter {
    /// Report on `stats` every `interval`.
    pub fn new(stats: Arc<SyncStats>, interval: Duration, delete: bool) -> Self {
        Self {
            stats,
            interval,
            delete,
        }
    }

    /// Run until `done` turns true or `force_quit` is notified.
    ///
    /// A final line is logged in both cases.
    pub async fn run(self, mut done: watch::Receiver<bool>, force_quit: Arc<Notify>) -> ReporterExit {
        let start = Instant::now();
        let mut last = start;
        let mut last_done = 0;
        let period = self.interval.max(Duration::from_millis(100));
        let mut ticker = tokio::time::interval_at(start + period, period);

        loop {
            let exit = tokio::select! {
                _ = ticker.tick() => None,
                _ = force_quit.notified() => Some(ReporterExit::ForceQuit),
                changed = done.changed() => {
                    // A dropped sender means the run is over as well.
                    if changed.is_err() || *done.borrow() {
                        Some(ReporterExit::Completed)
                    } else {
                        None
                    }
                }
            };

            let now = Instant::now();
            let finished = self.stats.finished_jobs();
            info!(
                "{}",
                progress_line(
                    finished,
                    self.stats.total_jobs(),
                    last_done,
                    now - start,
                    now - last,
                    self.delete
                )
            );
            last_done = finished;
            last = now;

            match exit {
                Some(ReporterExit::ForceQuit) => {
                    warn!("received forced exit request, exiting");
                    return ReporterExit::ForceQuit;
                }
                Some(exit) => return exit,
                None => {}
            }
        }
    }
}

/// One progress line.
///
/// Rates use whole seconds with a floor of one, so a report right after
/// the start does not divide by zero.
pub fn progress_line(
    done: u64,
    total: u64,
    prev_done: u64,
    since_start: Duration,
    since_last: Duration,
    delete: bool,
) -> String {
    let all_secs = since_start.as_secs().max(1) as f64;
    let current_secs = since_last.as_secs().max(1) as f64;
    let delta = done.saturating_sub(prev_done);

    let pct = if total > 0 {
        100.0 * done as f64 / total as f64
    } else {
        100.0
    };
    let remaining = total.saturating_sub(done) as f64;
    let speed_all = done as f64 / all_secs;
    // The current-rate ETA assumes at least one job per interval.
    let speed_current = delta.max(1) as f64 / current_secs;

    format!(
        "Progress {done} / {total}: {pct:.2}%  Metrics/second: {:.2}  Delete: {delete} ETA_All/Current: {}/{}",
        delta as f64 / current_secs,
        eta(remaining, speed_all),
        eta(remaining, speed_current),
    )
}

/// `remaining / speed` seconds as `1h2m3s`, or `unknown` with no rate.
fn eta(remaining: f64, speed: f64) -> String {
    if remaining <= 0.0 {
        return "0s".to_string();
    }
    if speed <= 0.0 {
        return "unknown".to_string();
    }
    let secs = (remaining / speed).round() as u64;
    let (h, m, s) = (secs / 3600, secs / 60 % 60, secs % 60);
    match (h, m) {
        (0, 0) => format!("{s}s"),
        (0, _) => format!("{m}m{s}s"),
        _ => format!("{h}h{m}m{s}s"),
    }
}
