//! Core trait and types for time-series storage.

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// One archive of a series: its resolution and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retention {
    /// Seconds between two samples.
    pub seconds_per_point: i64,
    /// Number of samples kept.
    pub points: i64,
}

impl Retention {
    /// Create a retention of `points` samples every `seconds_per_point`.
    pub fn new(seconds_per_point: i64, points: i64) -> Self {
        Self {
            seconds_per_point,
            points,
        }
    }

    /// How far back this archive reaches, in seconds.
    pub fn max_retention(&self) -> i64 {
        self.seconds_per_point * self.points
    }
}

/// A single sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    /// Sample value.
    pub value: f64,
}

impl Point {
    /// Create a point.
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// A fetched range of evenly spaced samples. `NaN` means no sample.
///
/// Invariant: `values.len() == (until - from) / step`.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    from: i64,
    until: i64,
    step: i64,
    values: Vec<f64>,
}

impl TimeSeries {
    /// Build a series starting at `from` with one value per `step`.
    pub fn new(from: i64, step: i64, values: Vec<f64>) -> Self {
        let until = from + step * values.len() as i64;
        Self {
            from,
            until,
            step,
            values,
        }
    }

    /// Timestamp of the first value.
    pub fn from_time(&self) -> i64 {
        self.from
    }

    /// Timestamp one step past the last value.
    pub fn until_time(&self) -> i64 {
        self.until
    }

    /// Seconds between values.
    pub fn step(&self) -> i64 {
        self.step
    }

    /// Raw values.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Iterate `(timestamp, value)` pairs, including `NaN` values.
    pub fn iter(&self) -> impl Iterator<Item = (i64, f64)> + '_ {
        self.values
            .iter()
            .enumerate()
            .map(move |(i, &v)| (self.from + i as i64 * self.step, v))
    }

    /// The non-`NaN` samples as points.
    pub fn points(&self) -> Vec<Point> {
        self.iter()
            .filter(|(_, v)| !v.is_nan())
            .map(|(t, v)| Point::new(t, v))
            .collect()
    }
}

/// A metric's multi-archive time series.
///
/// Fetches return aligned samples in the half-open window `(from, until]`
/// from the finest archive whose retention still reaches `from`. Updates land
/// in the finest archive covering the point's age; the last write to a
/// timestamp wins.
pub trait TimeSeriesStore: Send + Sync {
    /// Archives ordered finest first.
    fn retentions(&self) -> Vec<Retention>;

    /// Oldest timestamp any archive can hold.
    fn start_time(&self) -> i64;

    /// Fetch a range. Returns `None` when the range lies in the future.
    fn fetch(&self, from: i64, until: i64) -> Result<Option<TimeSeries>, StoreError>;

    /// Write a single point.
    fn update(&self, point: Point) -> Result<(), StoreError>;

    /// Write many points. Points outside every archive are skipped.
    fn update_many(&self, points: &[Point]) -> Result<(), StoreError>;
}
