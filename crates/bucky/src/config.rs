//! TOML configuration for the bucky CLI.
//!
//! Without `--config`, `bucky.toml` in the user's config directory is read
//! when present; otherwise every value takes its default. Command line
//! flags override file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bucky_types::DEFAULT_DAEMON_PORT;
use serde::Deserialize;

/// Seed used when neither `--host`, `BUCKYHOST` nor the file name one.
pub const DEFAULT_SEED: &str = "localhost:4242";

/// Settings read from `bucky.toml`. Every section may be left out.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Cluster discovery.
    pub cluster: ClusterSection,
    /// Relocation tuning.
    pub sync: SyncSection,
    /// Where sync counters are reported.
    pub graphite: GraphiteSection,
    /// Log filter.
    pub log: LogSection,
}

/// `[cluster]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// `host[:port]` of any daemon of the cluster.
    pub seed: Option<String>,
    /// Port daemons listen on when an address has none.
    pub port: Option<u16>,
}

/// `[sync]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    /// Workers per destination.
    pub workers: Option<usize>,
    /// Delete sources after a successful copy.
    pub delete: bool,
    /// Let destination daemons fetch from sources themselves.
    pub offload: bool,
    /// Do not fail a run over missing source metrics.
    pub ignore_not_found: bool,
    /// Seconds between progress lines.
    pub progress_interval_secs: Option<u64>,
    /// Seconds before a daemon request is abandoned.
    pub timeout_secs: Option<u64>,
}

/// `[graphite]` section. Reporting is off without an endpoint.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GraphiteSection {
    /// Carbon plaintext `host:port`.
    pub endpoint: Option<String>,
    /// Prefix of the reported metrics.
    pub prefix: Option<String>,
    /// Seconds between reports.
    pub interval_secs: Option<u64>,
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// `tracing` filter directive, `info` unless set.
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Read `path`, or `bucky.toml` in the user's config directory when no
    /// path is given. A missing default file means all defaults; a missing
    /// `path` is an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                let config: CliConfig = toml::from_str(&content)?;
                Ok(config)
            }
            None => match default_path().filter(|p| p.is_file()) {
                Some(p) => Self::load(Some(&p)),
                None => Ok(Self::default()),
            },
        }
    }

    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Effective seed: `flag` (which includes `BUCKYHOST`), then the file,
    /// then [`DEFAULT_SEED`].
    pub fn seed(&self, flag: Option<&str>) -> String {
        flag.map(str::to_string)
            .or_else(|| self.cluster.seed.clone())
            .unwrap_or_else(|| DEFAULT_SEED.to_string())
    }

    /// Effective daemon port.
    pub fn daemon_port(&self) -> u16 {
        self.cluster.port.unwrap_or(DEFAULT_DAEMON_PORT)
    }

    /// Effective workers per destination. Defaults to 5.
    pub fn workers(&self) -> usize {
        self.sync.workers.unwrap_or(5)
    }

    /// Effective progress interval. Defaults to 10 seconds.
    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.sync.progress_interval_secs.unwrap_or(10))
    }

    /// Effective request timeout. Defaults to 10 minutes; healing a large
    /// metric on the destination happens inside the request.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.sync.timeout_secs.unwrap_or(600))
    }
}

/// `bucky/bucky.toml` under the user's config directory.
fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("bucky").join("bucky.toml"))
}
