//! Cluster discovery for Graphite clusters fronted by bucky daemons.
//!
//! A cluster is resolved from one seed daemon: its `/hashring` descriptor
//! names every member, each member is asked for its own descriptor, and the
//! cluster is healthy only when all of them agree. The result is an explicit
//! [`ClusterConfig`] value that callers pass wherever ownership lookups are
//! needed.

mod config;
mod directory;
mod error;

pub use config::{ClusterConfig, is_healthy, parse_seed, resolve, resolve_single};
pub use directory::ClusterDirectory;
pub use error::ClusterError;
