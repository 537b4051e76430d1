//! Error types for time-series storage operations.

/// Errors that can occur while reading or writing a series.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested range is inverted.
    #[error("invalid time range: from {from} is after until {until}")]
    InvalidRange {
        /// Requested start.
        from: i64,
        /// Requested end.
        until: i64,
    },

    /// The point is in the future or older than every archive.
    #[error("timestamp {0} is not covered by any archive")]
    OutOfRetention(i64),

    /// The retention schema is unusable.
    #[error("invalid retentions: {0}")]
    InvalidRetentions(String),

    /// A snapshot could not be encoded or decoded.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
}
