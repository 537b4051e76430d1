//! Metric transport between the orchestrator and bucky daemons.
//!
//! - [`MetricTransport`] is the seam the sync engine and workflows talk to.
//! - [`HttpTransport`] implements it against the daemon's HTTP API with
//!   [reqwest].
//! - [`CarbonAdminClient`] reads go-carbon cache health for sync pacing.

mod carbon;
mod error;
mod http;

pub use carbon::{CacheInfo, CacheSource, CarbonAdminClient};
pub use error::NetError;
pub use http::{HttpTransport, METRIC_STAT_HEADER};

use bucky_types::{HealStats, MetricData, MetricStat};

/// Outcome of a delete request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStatus {
    /// The metric was removed.
    Deleted,
    /// The metric was already absent.
    NotFound,
}

/// Operations on metrics held by remote daemons.
///
/// Servers are `host` or `host:port` strings; implementations fill in a
/// default port when none is given. Substituting an in-memory implementation
/// lets tests run whole relocation workflows without a network.
#[async_trait::async_trait]
pub trait MetricTransport: Send + Sync {
    /// Download a metric's contents and metadata.
    async fn get_metric(&self, server: &str, name: &str) -> Result<MetricData, NetError>;

    /// Upload a metric. A daemon that already holds the metric merges the
    /// upload into it instead of replacing it.
    async fn post_metric(&self, server: &str, metric: &MetricData) -> Result<HealStats, NetError>;

    /// Ask `dst` to pull `old` from `src` and store it as `new`.
    async fn copy_metric(
        &self,
        src: &str,
        dst: &str,
        old: &str,
        new: &str,
    ) -> Result<HealStats, NetError>;

    /// Remove a metric.
    async fn delete_metric(&self, server: &str, name: &str) -> Result<DeleteStatus, NetError>;

    /// Fetch a metric's metadata without its contents.
    async fn stat_metric(&self, server: &str, name: &str) -> Result<MetricStat, NetError>;

    /// Names of every metric a daemon holds.
    async fn list_metrics(&self, server: &str) -> Result<Vec<String>, NetError>;
}
