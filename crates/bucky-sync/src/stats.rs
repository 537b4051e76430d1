//! Counters shared by every worker of a sync run.
//!
//! All updates are atomic; readers take an eventually consistent
//! [`StatsSnapshot`] without coordinating with workers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bucky_types::HealStats;
use tracing::info;

/// Phases of a job whose time is accounted separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Destination fetching the metric from the source (offload).
    Download,
    /// Destination writing the payload to a scratch file.
    Dump,
    /// Destination merging into an existing series.
    Fill,
    /// Destination decompressing the payload.
    Compress,
    /// Destination copying a brand new file into place.
    Copy,
    /// Removing the source copy.
    Delete,
}

impl Stage {
    /// Every stage in reporting order.
    pub const ALL: [Stage; 6] = [
        Stage::Download,
        Stage::Dump,
        Stage::Fill,
        Stage::Compress,
        Stage::Copy,
        Stage::Delete,
    ];

    /// Label used in the summary.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Download => "Download",
            Stage::Dump => "Dump",
            Stage::Fill => "Fill",
            Stage::Compress => "Compress",
            Stage::Copy => "Copy",
            Stage::Delete => "Delete",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Default)]
struct TimeCounter {
    count: AtomicU64,
    nanos: AtomicU64,
}

impl TimeCounter {
    fn record(&self, elapsed: Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TimeStat {
        TimeStat {
            count: self.count.load(Ordering::Relaxed),
            total: Duration::from_nanos(self.nanos.load(Ordering::Relaxed)),
        }
    }
}

/// Number of occurrences and accumulated time of one measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeStat {
    /// How many times it was recorded.
    pub count: u64,
    /// Sum of all recorded durations.
    pub total: Duration,
}

/// Live counters of a sync run.
pub struct SyncStats {
    total_jobs: u64,
    finished_jobs: AtomicU64,
    not_found: AtomicU64,
    copy_errors: AtomicU64,
    delete_errors: AtomicU64,
    jobs: TimeCounter,
    stages: [TimeCounter; 6],
    /// Finished jobs per node. The key set is fixed when the run starts.
    nodes: BTreeMap<String, AtomicU64>,
}

impl SyncStats {
    /// Counters for a run of `total_jobs` jobs touching `nodes`.
    pub fn new(total_jobs: u64, nodes: impl IntoIterator<Item = String>) -> Self {
        Self {
            total_jobs,
            finished_jobs: AtomicU64::new(0),
            not_found: AtomicU64::new(0),
            copy_errors: AtomicU64::new(0),
            delete_errors: AtomicU64::new(0),
            jobs: TimeCounter::default(),
            stages: Default::default(),
            nodes: nodes
                .into_iter()
                .map(|n| (n, AtomicU64::new(0)))
                .collect(),
        }
    }

    /// Jobs in the run.
    pub fn total_jobs(&self) -> u64 {
        self.total_jobs
    }

    /// Jobs finished so far, successful or not.
    pub fn finished_jobs(&self) -> u64 {
        self.finished_jobs.load(Ordering::Relaxed)
    }

    /// Count a source metric that did not exist.
    pub fn record_not_found(&self) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed copy.
    pub fn record_copy_error(&self) {
        self.copy_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed source delete.
    pub fn record_delete_error(&self) {
        self.delete_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Account time spent in `stage`.
    pub fn record_stage(&self, stage: Stage, elapsed: Duration) {
        self.stages[stage.index()].record(elapsed);
    }

    /// Account the stage timings a daemon reported. Stages it did not go
    /// through are reported as zero and skipped.
    pub fn record_heal(&self, heal: &HealStats) {
        let reported = [
            (Stage::Download, heal.download),
            (Stage::Dump, heal.dump),
            (Stage::Fill, heal.fill),
            (Stage::Compress, heal.compress),
            (Stage::Copy, heal.copy),
        ];
        for (stage, elapsed) in reported {
            if !elapsed.is_zero() {
                self.record_stage(stage, elapsed);
            }
        }
    }

    /// Mark a job between `src` and `dst` finished after `elapsed`.
    pub fn record_job(&self, src: &str, dst: &str, elapsed: Duration) {
        self.finished_jobs.fetch_add(1, Ordering::Relaxed);
        self.jobs.record(elapsed);
        for node in [src, dst] {
            if let Some(counter) = self.nodes.get(node) {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_jobs: self.total_jobs,
            finished_jobs: self.finished_jobs(),
            not_found: self.not_found.load(Ordering::Relaxed),
            copy_errors: self.copy_errors.load(Ordering::Relaxed),
            delete_errors: self.delete_errors.load(Ordering::Relaxed),
            jobs: self.jobs.snapshot(),
            stages: Stage::ALL.map(|s| self.stages[s.index()].snapshot()),
            nodes: self
                .nodes
                .iter()
                .map(|(n, c)| (n.clone(), c.load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

/// Counters of a sync run at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Jobs in the run.
    pub total_jobs: u64,
    /// Jobs finished, successful or not.
    pub finished_jobs: u64,
    /// Source metrics that did not exist.
    pub not_found: u64,
    /// Copies that failed for any other reason.
    pub copy_errors: u64,
    /// Source deletes that failed after a successful copy.
    pub delete_errors: u64,
    /// Wall time of whole jobs.
    pub jobs: TimeStat,
    stages: [TimeStat; 6],
    /// Finished jobs per node, as source or destination.
    pub nodes: BTreeMap<String, u64>,
}

impl StatsSnapshot {
    /// Accumulated time of one stage.
    pub fn stage(&self, stage: Stage) -> TimeStat {
        self.stages[stage.index()]
    }

    /// Job time not attributed to any stage.
    pub fn rest(&self) -> Duration {
        let staged: Duration = self.stages.iter().map(|s| s.total).sum();
        self.jobs.total.saturating_sub(staged)
    }

    /// Whether the run counts as successful.
    ///
    /// Missing source metrics only fail the run when not ignored; copy and
    /// delete failures always do.
    pub fn is_success(&self, ignore_not_found: bool) -> bool {
        let not_found_fails = self.not_found > 0 && !ignore_not_found;
        !(not_found_fails || self.copy_errors > 0 || self.delete_errors > 0)
    }

    /// Summary lines, one per log record.
    pub fn summary_lines(&self) -> Vec<String> {
        let total = self.jobs.total;
        let pct_time = |d: Duration| percent(d.as_secs_f64(), total.as_secs_f64());
        let pct_count = |n: u64| percent(n as f64, self.jobs.count as f64);

        let mut lines = vec![
            "Sync completed:".to_string(),
            format!("  404 Counter: {}", self.not_found),
            format!("  Copy failure: {}", self.copy_errors),
            format!("  Delete failure: {}", self.delete_errors),
            "  Time Stats:".to_string(),
            format!("    Total Sync: {total:?}"),
        ];
        for stage in Stage::ALL {
            let stat = self.stage(stage);
            lines.push(format!(
                "      {}: {:?} ({:.2}%) count: {} ({:.2}%)",
                stage,
                stat.total,
                pct_time(stat.total),
                stat.count,
                pct_count(stat.count)
            ));
        }
        let rest = self.rest();
        lines.push(format!("      Rest: {rest:?} ({:.2}%)", pct_time(rest)));
        lines
    }

    /// Log [`StatsSnapshot::summary_lines`].
    pub fn log_summary(&self) {
        for line in self.summary_lines() {
            info!("{line}");
        }
    }
}

fn percent(part: f64, whole: f64) -> f64 {
    if whole > 0.0 { 100.0 * part / whole } else { 0.0 }
}
