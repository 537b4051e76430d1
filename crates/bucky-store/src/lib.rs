//! Time-series storage interface, in-memory series and write cache.
//!
//! This crate defines the [`TimeSeriesStore`] trait through which the gap
//! filler reads and writes a metric's multi-archive series, along with:
//!
//! - [`MemorySeries`]: an in-memory multi-archive series with an explicit
//!   clock, used by tests and by the local cluster harness.
//! - [`WriteCache`]: a bounded priority queue of buffered points that
//!   flushes the series with the most pending samples first.

mod cache;
mod error;
mod memory_series;
mod traits;

pub use cache::{CacheEntry, WriteCache};
pub use error::StoreError;
pub use memory_series::MemorySeries;
pub use traits::{Point, Retention, TimeSeries, TimeSeriesStore};
