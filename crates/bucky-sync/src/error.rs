//! Error types for sync runs and workflows.

use bucky_cluster::ClusterError;
use bucky_net::NetError;

/// Errors that end a sync run or keep it from starting.
///
/// Failures of individual jobs are never returned here; they are counted in
/// the run's stats and decide its success.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Cluster discovery failed or the cluster is unhealthy.
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// A daemon's metric list could not be retrieved.
    #[error("listing metrics on {server} failed: {source}")]
    Listing {
        /// Daemon that was asked.
        server: String,
        /// Underlying transport failure.
        #[source]
        source: NetError,
    },

    /// A job names a source no throttle was set up for.
    #[error("no read throttle for source {0}")]
    UnknownSource(String),

    /// A source's throttle was shut down.
    #[error("read throttle for source {0} is closed")]
    ThrottleClosed(String),

    /// A background task panicked or was cancelled.
    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// The operator asked the run to stop immediately.
    #[error("forced exit requested")]
    ForceQuit,
}
