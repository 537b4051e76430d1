//! go-carbon cache health, read from its `/admin/info` endpoint.

use std::time::Duration;

use bucky_types::host_of;
use serde::Deserialize;

use crate::error::NetError;

/// Write cache state reported by a go-carbon instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct CacheInfo {
    /// Points currently buffered.
    pub size: i64,
    /// Points the cache may hold.
    pub limit: i64,
}

#[derive(Deserialize)]
struct AdminInfo {
    cache: CacheInfo,
}

/// Source of cache health for the go-carbon instance next to a daemon.
#[async_trait::async_trait]
pub trait CacheSource: Send + Sync {
    /// Cache state of the go-carbon instance on `server`'s host.
    ///
    /// `server` is a daemon's `host:port`; only its host is used.
    async fn cache_info(&self, server: &str) -> Result<CacheInfo, NetError>;
}

/// [`CacheSource`] over go-carbon's HTTP admin API.
#[derive(Debug, Clone)]
pub struct CarbonAdminClient {
    client: reqwest::Client,
    scheme: String,
    port: u16,
}

impl CarbonAdminClient {
    /// Query `scheme://host:port/admin/info`, giving up after `timeout`.
    pub fn new(scheme: impl Into<String>, port: u16, timeout: Duration) -> Result<Self, NetError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            scheme: scheme.into(),
            port,
        })
    }

    /// Admin info URL for the go-carbon instance beside `server`.
    pub fn url(&self, server: &str) -> String {
        format!("{}://{}:{}/admin/info", self.scheme, host_of(server), self.port)
    }
}

#[async_trait::async_trait]
impl CacheSource for CarbonAdminClient {
    async fn cache_info(&self, server: &str) -> Result<CacheInfo, NetError> {
        let response = self.client.get(self.url(server)).send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(NetError::Status {
                code: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        let info: AdminInfo = serde_json::from_slice(&body)?;
        Ok(info.cache)
    }
}
