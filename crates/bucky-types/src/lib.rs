//! Shared types for the bucky Graphite cluster tools.
//!
//! This crate defines the values passed between the workspace crates:
//! cluster members ([`Node`]), ring metadata ([`HashAlgorithm`],
//! [`RingDescriptor`]), metric payloads ([`MetricStat`], [`MetricData`]),
//! daemon heal timings ([`HealStats`]) and relocation units ([`SyncJob`]).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Default TCP port of the bucky daemon.
pub const DEFAULT_DAEMON_PORT: u16 = 4242;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced when parsing shared types from strings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The port part of a `HOST[:PORT][=INSTANCE]` string is malformed.
    #[error("error parsing port in {0}")]
    Port(String),

    /// The instance part of a `HOST[:PORT][=INSTANCE]` string is malformed.
    #[error("error parsing instance in {0}")]
    Instance(String),

    /// The hash algorithm name is not one we know about.
    #[error("unknown hash algorithm: {0}")]
    UnknownAlgorithm(String),
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A member of the hash ring.
///
/// `instance` disambiguates several ring participants living on the same
/// host. A port of `0` means the port was not specified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Node {
    /// Hostname or address of the member.
    #[serde(rename = "Server")]
    pub server: String,
    /// Carbon port of the member.
    #[serde(rename = "Port", default)]
    pub port: u16,
    /// Optional instance name.
    #[serde(rename = "Instance", default, with = "empty_as_none")]
    pub instance: Option<String>,
}

impl Node {
    /// Create a node. An empty instance string is treated as no instance.
    pub fn new(server: impl Into<String>, port: u16, instance: Option<&str>) -> Self {
        Self {
            server: server.into(),
            port,
            instance: instance.filter(|i| !i.is_empty()).map(str::to_string),
        }
    }

    /// The Python tuple representation used by carbon's consistent hash.
    pub fn carbon_key(&self) -> String {
        match &self.instance {
            Some(instance) => format!("('{}', '{}')", self.server, instance),
            None => format!("('{}', None)", self.server),
        }
    }

    /// The key used by carbon-c-relay's FNV1a ring.
    pub fn fnv1a_key(&self) -> String {
        match &self.instance {
            Some(instance) => instance.clone(),
            None => format!("{}:{}", self.server, self.port),
        }
    }

    /// The instance name, or `""` when absent.
    pub fn instance_str(&self) -> &str {
        self.instance.as_deref().unwrap_or("")
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.instance {
            Some(instance) => write!(f, "{}:{}={}", self.server, self.port, instance),
            None => write!(f, "{}:{}=None", self.server, self.port),
        }
    }
}

impl FromStr for Node {
    type Err = ParseError;

    /// Parse a `HOST[:PORT][=INSTANCE]` string.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rest, instance) = match s.split_once('=') {
            Some((rest, instance)) => {
                if instance.contains([':', '=']) {
                    return Err(ParseError::Instance(s.to_string()));
                }
                (rest, Some(instance))
            }
            None => (s, None),
        };

        let (server, port) = match rest.split_once(':') {
            Some((server, port)) => {
                if port.contains(':') {
                    return Err(ParseError::Port(s.to_string()));
                }
                let port = if port.is_empty() {
                    0
                } else {
                    port.parse::<u16>()
                        .map_err(|_| ParseError::Port(s.to_string()))?
                };
                (server, port)
            }
            None => (rest, 0),
        };

        Ok(Node::new(server, port, instance))
    }
}

/// Serde helper mapping the empty string to `None`.
mod empty_as_none {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(value.as_deref().unwrap_or(""))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let value: Option<String> = Option::deserialize(d)?;
        Ok(value.filter(|v| !v.is_empty()))
    }
}

// ---------------------------------------------------------------------------
// Ring metadata
// ---------------------------------------------------------------------------

/// Consistent hashing algorithm used by a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    /// carbon-cache.py's MD5 ring.
    #[serde(rename = "carbon")]
    Carbon,
    /// carbon-c-relay's FNV1a ring.
    #[serde(rename = "fnv1a")]
    Fnv1a,
    /// Jump consistent hash over 64-bit FNV1a.
    #[serde(rename = "jump_fnv1a")]
    JumpFnv1a,
}

impl HashAlgorithm {
    /// Wire name of the algorithm.
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Carbon => "carbon",
            HashAlgorithm::Fnv1a => "fnv1a",
            HashAlgorithm::JumpFnv1a => "jump_fnv1a",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "carbon" => Ok(HashAlgorithm::Carbon),
            "fnv1a" => Ok(HashAlgorithm::Fnv1a),
            "jump_fnv1a" => Ok(HashAlgorithm::JumpFnv1a),
            other => Err(ParseError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// The ring configuration a daemon reports at `/hashring`.
///
/// `algo` is kept as a string so that descriptors from daemons running an
/// algorithm we do not know still deserialize and can be reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RingDescriptor {
    /// Hostname of the daemon that produced the descriptor.
    pub name: String,
    /// Ring members in insertion order.
    pub nodes: Vec<Node>,
    /// Hash algorithm name.
    pub algo: String,
    /// Replication factor.
    pub replicas: usize,
}

impl RingDescriptor {
    /// Parse the algorithm name.
    pub fn algorithm(&self) -> Result<HashAlgorithm, ParseError> {
        self.algo.parse()
    }
}

// ---------------------------------------------------------------------------
// Metric payloads
// ---------------------------------------------------------------------------

/// Metadata describing a metric file on a daemon.
///
/// Travels as JSON in the `X-Metric-Stat` header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricStat {
    /// Dotted metric name.
    pub name: String,
    /// Size of the raw file in bytes.
    pub size: i64,
    /// Unix file mode.
    pub mode: i64,
    /// Modification time in Unix seconds.
    pub mod_time: i64,
    /// Payload encoding (0 = identity, 1 = snappy).
    #[serde(default)]
    pub encoding: i32,
}

/// A metric's raw contents plus its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricData {
    /// Metadata of the metric.
    pub stat: MetricStat,
    /// Raw file contents.
    pub data: Bytes,
}

impl MetricData {
    /// Return the same payload under a different metric name.
    pub fn renamed(mut self, name: impl Into<String>) -> Self {
        self.stat.name = name.into();
        self
    }
}

/// Stage timings reported by a daemon after it stored or healed a metric.
///
/// Durations are encoded as integer nanoseconds on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealStats {
    /// Time spent fetching the source metric (offload only).
    #[serde(with = "nanos", default)]
    pub download: Duration,
    /// Time spent writing the incoming payload to a scratch file.
    #[serde(with = "nanos", default)]
    pub dump: Duration,
    /// Time spent merging into the existing series.
    #[serde(with = "nanos", default)]
    pub fill: Duration,
    /// Time spent decompressing the payload.
    #[serde(with = "nanos", default)]
    pub compress: Duration,
    /// Time spent copying a brand new file into place.
    #[serde(with = "nanos", default)]
    pub copy: Duration,
}

mod nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_nanos().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        // Negative values never appear in practice; clamp them to zero.
        let n = i64::deserialize(d)?;
        Ok(Duration::from_nanos(n.max(0) as u64))
    }
}

// ---------------------------------------------------------------------------
// Sync jobs
// ---------------------------------------------------------------------------

/// A single metric relocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncJob {
    /// Name of the metric on the source.
    pub old_name: String,
    /// Name the metric should have on the destination.
    pub new_name: String,
    /// Source daemon address (`host:port`).
    pub src: String,
    /// Destination daemon address (`host:port`).
    pub dst: String,
}

impl SyncJob {
    /// Create a job that keeps the metric name.
    pub fn relocate(name: impl Into<String>, src: impl Into<String>, dst: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            old_name: name.clone(),
            new_name: name,
            src: src.into(),
            dst: dst.into(),
        }
    }
}

impl fmt::Display for SyncJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} => [{}] {}",
            self.src, self.old_name, self.dst, self.new_name
        )
    }
}

// ---------------------------------------------------------------------------
// Metric names
// ---------------------------------------------------------------------------

/// Normalize a metric name: path separators become dots, runs of dots
/// collapse and a leading dot is stripped.
pub fn clean_metric(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let c = if c == '/' { '.' } else { c };
        if c == '.' && (out.is_empty() || out.ends_with('.')) {
            continue;
        }
        out.push(c);
    }
    out
}

/// Strip the port from a `host:port` address.
pub fn host_of(addr: &str) -> &str {
    addr.split_once(':').map_or(addr, |(host, _)| host)
}
