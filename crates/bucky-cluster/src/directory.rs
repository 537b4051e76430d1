use bucky_net::{HttpTransport, NetError};
use bucky_types::RingDescriptor;

/// Source of ring descriptors for cluster members.
#[async_trait::async_trait]
pub trait ClusterDirectory: Send + Sync {
    /// Ring descriptor reported by the daemon at `server` (`host:port`).
    async fn ring_descriptor(&self, server: &str) -> Result<RingDescriptor, NetError>;
}

#[async_trait::async_trait]
impl ClusterDirectory for HttpTransport {
    async fn ring_descriptor(&self, server: &str) -> Result<RingDescriptor, NetError> {
        self.hashring(server).await
    }
}
