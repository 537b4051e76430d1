//! In-memory multi-archive series.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;
use crate::traits::{Point, Retention, TimeSeries, TimeSeriesStore};

/// A whisper-like series held in memory.
///
/// The clock is explicit: `now` is set at construction and moved with
/// [`MemorySeries::set_now`], so tests can reason about exact archive
/// boundaries. Samples are not aggregated into coarser archives.
pub struct MemorySeries {
    retentions: Vec<Retention>,
    archives: RwLock<Vec<BTreeMap<i64, f64>>>,
    now: AtomicI64,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    retentions: Vec<Retention>,
    archives: Vec<Vec<(i64, f64)>>,
}

impl MemorySeries {
    /// Create an empty series.
    ///
    /// Retentions must be ordered finest first with strictly increasing
    /// resolution and reach.
    pub fn new(retentions: Vec<Retention>, now: i64) -> Result<Self, StoreError> {
        validate(&retentions)?;
        let archives = vec![BTreeMap::new(); retentions.len()];
        Ok(Self {
            retentions,
            archives: RwLock::new(archives),
            now: AtomicI64::new(now),
        })
    }

    /// Move the clock.
    pub fn set_now(&self, now: i64) {
        self.now.store(now, Ordering::Relaxed);
    }

    /// Current clock value.
    pub fn now(&self) -> i64 {
        self.now.load(Ordering::Relaxed)
    }

    /// Serialize retentions and every stored sample.
    pub fn snapshot(&self) -> Result<Vec<u8>, StoreError> {
        let archives = self.archives.read().expect("lock poisoned");
        let snapshot = Snapshot {
            retentions: self.retentions.clone(),
            archives: archives
                .iter()
                .map(|a| a.iter().map(|(&t, &v)| (t, v)).collect())
                .collect(),
        };
        Ok(serde_json::to_vec(&snapshot)?)
    }

    /// Rebuild a series from [`MemorySeries::snapshot`] output.
    pub fn from_snapshot(bytes: &[u8], now: i64) -> Result<Self, StoreError> {
        let snapshot: Snapshot = serde_json::from_slice(bytes)?;
        validate(&snapshot.retentions)?;
        if snapshot.archives.len() != snapshot.retentions.len() {
            return Err(StoreError::InvalidRetentions(format!(
                "{} archives for {} retentions",
                snapshot.archives.len(),
                snapshot.retentions.len()
            )));
        }
        let archives = snapshot
            .archives
            .into_iter()
            .map(|points| points.into_iter().filter(|(_, v)| !v.is_nan()).collect())
            .collect();
        Ok(Self {
            retentions: snapshot.retentions,
            archives: RwLock::new(archives),
            now: AtomicI64::new(now),
        })
    }

    /// Number of stored samples across all archives.
    pub fn sample_count(&self) -> usize {
        let archives = self.archives.read().expect("lock poisoned");
        archives.iter().map(BTreeMap::len).sum()
    }

    fn max_retention(&self) -> i64 {
        self.retentions
            .iter()
            .map(Retention::max_retention)
            .max()
            .unwrap_or(0)
    }

    /// Index of the finest archive holding a sample `age` seconds old.
    fn archive_for_age(&self, age: i64) -> Option<usize> {
        if age < 0 {
            return None;
        }
        self.retentions.iter().position(|r| age < r.max_retention())
    }

    fn write(&self, archives: &mut [BTreeMap<i64, f64>], point: Point) -> Result<(), StoreError> {
        let now = self.now();
        let idx = self
            .archive_for_age(now - point.timestamp)
            .ok_or(StoreError::OutOfRetention(point.timestamp))?;
        let step = self.retentions[idx].seconds_per_point;
        let aligned = point.timestamp - point.timestamp.rem_euclid(step);
        if point.value.is_nan() {
            archives[idx].remove(&aligned);
        } else {
            archives[idx].insert(aligned, point.value);
        }
        Ok(())
    }
}

impl TimeSeriesStore for MemorySeries {
    fn retentions(&self) -> Vec<Retention> {
        self.retentions.clone()
    }

    fn start_time(&self) -> i64 {
        self.now() - self.max_retention()
    }

    fn fetch(&self, from: i64, until: i64) -> Result<Option<TimeSeries>, StoreError> {
        if from > until {
            return Err(StoreError::InvalidRange { from, until });
        }
        let now = self.now();
        if from > now {
            return Ok(None);
        }
        let until = until.min(now);
        let from = from.max(self.start_time());

        let Some(idx) = self
            .retentions
            .iter()
            .position(|r| r.max_retention() >= now - from)
        else {
            return Ok(None);
        };
        let retention = self.retentions[idx];
        let step = retention.seconds_per_point;

        let from_interval = from - from.rem_euclid(step) + step;
        let mut until_interval = until - until.rem_euclid(step) + step;
        if until_interval <= from_interval {
            until_interval = from_interval + step;
        }

        let archives = self.archives.read().expect("lock poisoned");
        let archive = &archives[idx];
        let values = (from_interval..until_interval)
            .step_by(step as usize)
            .map(|t| archive.get(&t).copied().unwrap_or(f64::NAN))
            .collect();

        Ok(Some(TimeSeries::new(from_interval, step, values)))
    }

    fn update(&self, point: Point) -> Result<(), StoreError> {
        let mut archives = self.archives.write().expect("lock poisoned");
        self.write(&mut archives, point)
    }

    fn update_many(&self, points: &[Point]) -> Result<(), StoreError> {
        let mut archives = self.archives.write().expect("lock poisoned");
        let mut skipped = 0usize;
        for point in points {
            if self.write(&mut archives, *point).is_err() {
                skipped += 1;
            }
        }
        if skipped > 0 {
            debug!(skipped, total = points.len(), "dropped points outside retention");
        }
        Ok(())
    }
}

fn validate(retentions: &[Retention]) -> Result<(), StoreError> {
    if retentions.is_empty() {
        return Err(StoreError::InvalidRetentions("no archives".into()));
    }
    for r in retentions {
        if r.seconds_per_point <= 0 || r.points <= 0 {
            return Err(StoreError::InvalidRetentions(format!(
                "archive {}:{} must be positive",
                r.seconds_per_point, r.points
            )));
        }
    }
    for pair in retentions.windows(2) {
        let (finer, coarser) = (pair[0], pair[1]);
        if coarser.seconds_per_point <= finer.seconds_per_point {
            return Err(StoreError::InvalidRetentions(
                "archives must be ordered finest first".into(),
            ));
        }
        if coarser.max_retention() <= finer.max_retention() {
            return Err(StoreError::InvalidRetentions(
                "coarser archives must reach further back".into(),
            ));
        }
    }
    Ok(())
}
