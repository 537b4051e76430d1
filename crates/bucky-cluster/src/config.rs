//! Resolved cluster membership and ownership lookups.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bucky_hashring::{HashRing, build_ring};
use bucky_types::{DEFAULT_DAEMON_PORT, RingDescriptor};
use tracing::{debug, info, warn};

use crate::directory::ClusterDirectory;
use crate::error::ClusterError;

/// A cluster's daemons and the ring that places metrics on them.
#[derive(Clone)]
pub struct ClusterConfig {
    port: u16,
    servers: Vec<String>,
    ring: Arc<dyn HashRing>,
    healthy: bool,
}

impl ClusterConfig {
    /// Build a cluster from a ring descriptor without querying anyone.
    ///
    /// `port` is the port every daemon of the cluster listens on. The result
    /// is marked healthy.
    pub fn from_descriptor(descriptor: &RingDescriptor, port: u16) -> Result<Self, ClusterError> {
        let algorithm = descriptor
            .algorithm()
            .map_err(|_| ClusterError::UnknownAlgorithm(descriptor.algo.clone()))?;
        if descriptor.nodes.is_empty() {
            return Err(ClusterError::EmptyRing(descriptor.name.clone()));
        }
        let ring = build_ring(algorithm, descriptor.replicas, descriptor.nodes.iter().cloned());

        let mut servers: Vec<String> = Vec::new();
        for node in &descriptor.nodes {
            if !servers.contains(&node.server) {
                servers.push(node.server.clone());
            }
        }

        Ok(Self {
            port,
            servers,
            ring: Arc::from(ring),
            healthy: true,
        })
    }

    /// Port the daemons listen on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Distinct daemon hostnames in ring order.
    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// The ring placing metrics on this cluster.
    pub fn ring(&self) -> &dyn HashRing {
        self.ring.as_ref()
    }

    /// Whether every member agreed on the ring when the cluster was resolved.
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Fail with [`ClusterError::Unhealthy`] unless the cluster is healthy.
    pub fn require_healthy(&self) -> Result<(), ClusterError> {
        if self.healthy {
            Ok(())
        } else {
            Err(ClusterError::Unhealthy)
        }
    }

    /// `host:port` of `server`'s daemon.
    pub fn host_port(&self, server: &str) -> String {
        format!("{server}:{}", self.port)
    }

    /// `host:port` of every daemon.
    pub fn host_ports(&self) -> Vec<String> {
        self.servers.iter().map(|s| self.host_port(s)).collect()
    }

    /// Hostname owning `metric`.
    ///
    /// # Panics
    ///
    /// Panics if the ring is empty, which [`ClusterConfig::from_descriptor`]
    /// rules out.
    pub fn owner_host(&self, metric: &str) -> &str {
        &self.ring.get_node(metric).server
    }

    /// `host:port` of the daemon owning `metric`.
    pub fn owner(&self, metric: &str) -> String {
        self.host_port(self.owner_host(metric))
    }

    /// Map each metric to the hostname owning it.
    pub fn locate<'a>(&self, metrics: impl IntoIterator<Item = &'a str>) -> BTreeMap<String, String> {
        let mut spread: BTreeMap<&str, usize> = BTreeMap::new();
        let located: BTreeMap<String, String> = metrics
            .into_iter()
            .map(|m| {
                let host = self.owner_host(m);
                *spread.entry(host).or_default() += 1;
                (m.to_string(), host.to_string())
            })
            .collect();
        for (host, count) in spread {
            debug!(%host, count, "metrics assigned");
        }
        located
    }
}

impl fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("port", &self.port)
            .field("servers", &self.servers)
            .field("ring", &self.ring.to_string())
            .field("healthy", &self.healthy)
            .finish()
    }
}

/// Split a seed address into host and port.
///
/// A seed without a port gets [`DEFAULT_DAEMON_PORT`].
pub fn parse_seed(seed: &str) -> Result<(String, u16), ClusterError> {
    let (host, port) = match seed.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| ClusterError::InvalidSeed(seed.to_string()))?;
            (host, port)
        }
        None => (seed, DEFAULT_DAEMON_PORT),
    };
    if host.is_empty() {
        return Err(ClusterError::InvalidSeed(seed.to_string()));
    }
    Ok((host.to_string(), port))
}

/// Build the cluster from the seed's descriptor alone.
///
/// No other member is asked, so the result is trusted as healthy.
pub async fn resolve_single(
    seed: &str,
    directory: &dyn ClusterDirectory,
) -> Result<ClusterConfig, ClusterError> {
    let (host, port) = parse_seed(seed)?;
    let seed_addr = format!("{host}:{port}");
    let descriptor = directory
        .ring_descriptor(&seed_addr)
        .await
        .map_err(|source| ClusterError::Unreachable {
            server: seed_addr.clone(),
            source,
        })?;
    let cluster = ClusterConfig::from_descriptor(&descriptor, port)?;
    debug!(seed = %seed_addr, servers = cluster.servers.len(), "using seed ring only");
    Ok(cluster)
}

/// Resolve the cluster `seed` belongs to.
///
/// The seed's descriptor defines the ring. Every other member named by it
/// is queried as well; an unreachable member or one reporting a different
/// ring leaves the cluster marked unhealthy rather than failing.
pub async fn resolve(
    seed: &str,
    directory: &dyn ClusterDirectory,
) -> Result<ClusterConfig, ClusterError> {
    let (host, port) = parse_seed(seed)?;
    let seed_addr = format!("{host}:{port}");
    let master = directory
        .ring_descriptor(&seed_addr)
        .await
        .map_err(|source| ClusterError::Unreachable {
            server: seed_addr.clone(),
            source,
        })?;

    let mut cluster = ClusterConfig::from_descriptor(&master, port)?;

    let mut members = Vec::with_capacity(master.nodes.len());
    let mut reachable = true;
    for node in &master.nodes {
        if node.server == master.name {
            continue;
        }
        let addr = cluster.host_port(&node.server);
        match directory.ring_descriptor(&addr).await {
            Ok(descriptor) => members.push(descriptor),
            Err(e) => {
                warn!(server = %addr, error = %e, "cluster unhealthy: member unreachable");
                reachable = false;
            }
        }
    }

    cluster.healthy = reachable && is_healthy(&master, &members);
    info!(
        seed = %seed_addr,
        servers = cluster.servers.len(),
        algorithm = %cluster.ring.algorithm(),
        healthy = cluster.healthy,
        "resolved cluster"
    );
    Ok(cluster)
}

/// Whether `members` agree with `master` about the ring.
///
/// `members` are the descriptors of every ring member other than `master`
/// itself, unless `master` is also listed under its own name.
pub fn is_healthy(master: &RingDescriptor, members: &[RingDescriptor]) -> bool {
    let master_in_ring = members.iter().any(|m| m.name == master.name);
    let expected = if master_in_ring {
        members.len()
    } else {
        members.len() + 1
    };
    if master.nodes.len() != expected {
        warn!(
            nodes = master.nodes.len(),
            members = expected,
            "wrong number of members; cluster is inconsistent"
        );
        return false;
    }

    for member in members {
        if member.algo != master.algo {
            warn!(
                member = %member.name,
                algo = %member.algo,
                expected = %master.algo,
                "member hash algorithm differs"
            );
            return false;
        }
        if member.nodes.len() != master.nodes.len() {
            warn!(
                member = %member.name,
                nodes = member.nodes.len(),
                expected = master.nodes.len(),
                "member node count differs"
            );
            return false;
        }
        if let Some((i, (ours, theirs))) = master
            .nodes
            .iter()
            .zip(&member.nodes)
            .enumerate()
            .find(|(_, (a, b))| a != b)
        {
            warn!(member = %member.name, index = i, %ours, %theirs, "member node differs");
            return false;
        }
    }
    true
}
