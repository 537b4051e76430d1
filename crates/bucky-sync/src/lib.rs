//! Concurrent metric relocation.
//!
//! [`SyncEngine`] executes a [`JobSet`] of relocations with one bounded
//! queue and worker pool per destination and a read throttle per source.
//! A source copy is only deleted after its copy succeeded. Individual job
//! failures are counted, never propagated; the run's [`SyncReport`] says
//! whether any failure that is not ignored occurred. Runs can also be paced
//! per node by go-carbon cache health and report their counters to
//! Graphite.
//!
//! The [`workflow`] module builds job sets for rebalancing a cluster,
//! backfilling renamed metrics and copying between daemons.

mod engine;
mod error;
mod graphite;
mod pacer;
mod progress;
mod stats;
mod throttle;
pub mod workflow;

pub use engine::{JobSet, SyncConfig, SyncEngine, SyncReport, count_jobs};
pub use error::SyncError;
pub use graphite::{GraphiteConfig, GraphiteReporter, render_lines};
pub use pacer::{NodeHealth, PacingConfig, Pacer, next_rate};
pub use progress::{ProgressReporter, ReporterExit, progress_line};
pub use stats::{Stage, StatsSnapshot, SyncStats, TimeStat};
pub use throttle::SourceThrottle;
