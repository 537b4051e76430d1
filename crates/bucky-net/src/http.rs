//! [`MetricTransport`] over the daemon's HTTP API.

use std::time::Duration;

use bucky_types::{HealStats, MetricData, MetricStat, RingDescriptor};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use tracing::{debug, warn};

use crate::error::NetError;
use crate::{DeleteStatus, MetricTransport};

/// Header carrying a metric's JSON-encoded [`MetricStat`].
pub const METRIC_STAT_HEADER: &str = "X-Metric-Stat";

/// HTTP client for bucky daemons.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    default_port: u16,
}

impl HttpTransport {
    /// Create a transport whose requests give up after `timeout`.
    ///
    /// `default_port` is used for servers given without one.
    pub fn new(default_port: u16, timeout: Duration) -> Result<Self, NetError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            default_port,
        })
    }

    /// Port applied to servers given without one.
    pub fn default_port(&self) -> u16 {
        self.default_port
    }

    /// `host:port` for `server`.
    pub fn host_port(&self, server: &str) -> String {
        if server.contains(':') {
            server.to_string()
        } else {
            format!("{server}:{}", self.default_port)
        }
    }

    /// Full URL of `path` on `server`.
    pub fn url(&self, server: &str, path: &str) -> String {
        format!("http://{}{path}", self.host_port(server))
    }

    fn metric_url(&self, server: &str, name: &str) -> String {
        self.url(server, &format!("/metrics/{name}"))
    }

    /// Ring descriptor a daemon is configured with.
    pub async fn hashring(&self, server: &str) -> Result<RingDescriptor, NetError> {
        let response = self.client.get(self.url(server, "/hashring")).send().await?;
        let response = check(response, server, "/hashring").await?;
        Ok(response.json().await?)
    }
}

/// Map 404 and other non-success statuses to errors.
async fn check(
    response: reqwest::Response,
    server: &str,
    metric: &str,
) -> Result<reqwest::Response, NetError> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(NetError::NotFound {
            server: server.to_string(),
            metric: metric.to_string(),
        });
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        warn!(%server, %metric, code = status.as_u16(), %body, "daemon returned error");
        return Err(NetError::Status {
            code: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

/// Decode the stat header of a response.
pub(crate) fn decode_stat(headers: &HeaderMap) -> Result<MetricStat, NetError> {
    let value = headers
        .get(METRIC_STAT_HEADER)
        .ok_or(NetError::InvalidHeader {
            name: METRIC_STAT_HEADER,
            reason: "missing".into(),
        })?;
    let value = value.to_str().map_err(|e| NetError::InvalidHeader {
        name: METRIC_STAT_HEADER,
        reason: e.to_string(),
    })?;
    Ok(serde_json::from_str(value)?)
}

/// Heal stats from a POST response body. Older daemons answer with an
/// empty body.
pub(crate) fn decode_heal_stats(body: &[u8]) -> Result<HealStats, NetError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(HealStats::default());
    }
    Ok(serde_json::from_slice(body)?)
}

#[async_trait::async_trait]
impl MetricTransport for HttpTransport {
    async fn get_metric(&self, server: &str, name: &str) -> Result<MetricData, NetError> {
        let response = self.client.get(self.metric_url(server, name)).send().await?;
        let response = check(response, server, name).await?;
        let stat = decode_stat(response.headers())?;
        let data = response.bytes().await?;
        debug!(%server, %name, bytes = data.len(), "downloaded metric");
        Ok(MetricData { stat, data })
    }

    async fn post_metric(&self, server: &str, metric: &MetricData) -> Result<HealStats, NetError> {
        let stat = serde_json::to_string(&metric.stat)?;
        let response = self
            .client
            .post(self.metric_url(server, &metric.stat.name))
            .header(METRIC_STAT_HEADER, stat)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(metric.data.clone())
            .send()
            .await?;
        let response = check(response, server, &metric.stat.name).await?;
        let body = response.bytes().await?;
        decode_heal_stats(&body)
    }

    async fn copy_metric(
        &self,
        src: &str,
        dst: &str,
        old: &str,
        new: &str,
    ) -> Result<HealStats, NetError> {
        let src = self.host_port(src);
        let response = self
            .client
            .post(self.metric_url(dst, new))
            .query(&[
                ("fetch_offload", "true"),
                ("server", src.as_str()),
                ("metric", old),
            ])
            .send()
            .await?;
        let response = check(response, dst, new).await?;
        let body = response.bytes().await?;
        decode_heal_stats(&body)
    }

    async fn delete_metric(&self, server: &str, name: &str) -> Result<DeleteStatus, NetError> {
        let response = self
            .client
            .delete(self.metric_url(server, name))
            .send()
            .await?;
        match check(response, server, name).await {
            Ok(_) => Ok(DeleteStatus::Deleted),
            Err(NetError::NotFound { .. }) => Ok(DeleteStatus::NotFound),
            Err(e) => Err(e),
        }
    }

    async fn stat_metric(&self, server: &str, name: &str) -> Result<MetricStat, NetError> {
        let response = self
            .client
            .head(self.metric_url(server, name))
            .send()
            .await?;
        let response = check(response, server, name).await?;
        decode_stat(response.headers())
    }

    async fn list_metrics(&self, server: &str) -> Result<Vec<String>, NetError> {
        let response = self.client.get(self.url(server, "/metrics")).send().await?;
        let response = check(response, server, "/metrics").await?;
        let metrics: Vec<String> = response.json().await?;
        debug!(%server, count = metrics.len(), "listed metrics");
        Ok(metrics)
    }
}
