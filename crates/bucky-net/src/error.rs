//! Error types for daemon requests.

/// Errors that can occur while talking to a bucky daemon.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The daemon does not hold the requested metric.
    #[error("metric {metric} not found on {server}")]
    NotFound {
        /// Daemon that was asked.
        server: String,
        /// Metric that was asked for.
        metric: String,
    },

    /// The daemon answered with a non-success status.
    #[error("unexpected status {code}: {body}")]
    Status {
        /// HTTP status code.
        code: u16,
        /// Response body, if any.
        body: String,
    },

    /// The request could not be sent or the response not read.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// A JSON payload could not be encoded or decoded.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// A required response header was missing or malformed.
    #[error("invalid header {name}: {reason}")]
    InvalidHeader {
        /// Header name.
        name: &'static str,
        /// What was wrong with it.
        reason: String,
    },
}

impl NetError {
    /// Whether the remote side reported the metric as absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
