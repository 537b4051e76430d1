//! Error types for cluster discovery.

use bucky_net::NetError;

/// Errors that can occur while resolving a cluster.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The seed address is not `host[:port]`.
    #[error("invalid seed address: {0}")]
    InvalidSeed(String),

    /// The seed daemon could not be queried.
    #[error("cannot reach {server}: {source}")]
    Unreachable {
        /// Address that was queried.
        server: String,
        /// Underlying transport failure.
        #[source]
        source: NetError,
    },

    /// The ring uses an algorithm we cannot reproduce.
    #[error("unknown consistent hash algorithm: {0}")]
    UnknownAlgorithm(String),

    /// The ring has no members.
    #[error("hash ring reported by {0} has no nodes")]
    EmptyRing(String),

    /// Members disagree about the ring or did not answer.
    #[error("cluster is unhealthy")]
    Unhealthy,
}
