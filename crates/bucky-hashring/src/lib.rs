//! Consistent hash rings for sharded Graphite clusters.
//!
//! Three interoperable ring variants map a metric key to the node that owns
//! it:
//!
//! - [`CarbonRing`]: the carbon-cache.py ring, with 16-bit MD5 positions of
//!   Python tuple keys, 100 points per node.
//! - [`Fnv1aRing`]: the carbon-c-relay ring, with 16-bit folded FNV1a positions.
//! - [`JumpRing`]: Google's jump consistent hash over a 64-bit FNV1a key.
//!   Only the tail node can be removed.
//!
//! All variants implement [`HashRing`]. Querying an empty ring panics.

pub mod error;
pub mod hash;
mod jump;
mod ring;

use std::collections::BTreeMap;
use std::fmt;

use bucky_types::{HashAlgorithm, Node};

pub use error::RingError;
pub use jump::JumpRing;
pub use ring::{Carbon, CarbonRing, ConsistentRing, Fnv1a, Fnv1aRing, PositionScheme, RingEntry};

/// Number of ring points each node gets on the carbon and FNV1a rings.
pub const DEFAULT_RING_REPLICAS: usize = 100;

/// Maps metric keys to the nodes that own them.
pub trait HashRing: fmt::Display + Send + Sync {
    /// The hashing algorithm implemented by this ring.
    fn algorithm(&self) -> HashAlgorithm;

    /// Add a node. Must not be used once lookups have begun on a live cluster.
    fn add_node(&mut self, node: Node);

    /// Remove a node.
    fn remove_node(&mut self, node: &Node) -> Result<(), RingError>;

    /// Return the node owning `key`.
    ///
    /// # Panics
    ///
    /// Panics if the ring is empty.
    fn get_node(&self, key: &str) -> &Node;

    /// Return the distinct nodes for `key` in replica order, primary first.
    ///
    /// # Panics
    ///
    /// Panics if the ring is empty.
    fn get_nodes(&self, key: &str) -> Vec<Node>;

    /// Number of hash buckets each node owns.
    ///
    /// # Panics
    ///
    /// Panics if the ring is empty.
    fn buckets_per_node(&self) -> BTreeMap<Node, u32>;

    /// Configured replica count.
    fn replicas(&self) -> usize;

    /// Nodes in insertion order (instance order for the jump ring).
    fn nodes(&self) -> &[Node];

    /// Number of nodes in the ring.
    fn len(&self) -> usize {
        self.nodes().len()
    }

    /// Whether the ring holds no nodes.
    fn is_empty(&self) -> bool {
        self.nodes().is_empty()
    }
}

/// Build a ring of the given algorithm holding `nodes`.
///
/// `replicas` is the replication factor for the jump ring. The carbon and
/// FNV1a rings always use [`DEFAULT_RING_REPLICAS`] points per node, which is
/// what carbon-cache.py and carbon-c-relay do.
pub fn build_ring(
    algorithm: HashAlgorithm,
    replicas: usize,
    nodes: impl IntoIterator<Item = Node>,
) -> Box<dyn HashRing> {
    let mut ring: Box<dyn HashRing> = match algorithm {
        HashAlgorithm::Carbon => Box::new(CarbonRing::new()),
        HashAlgorithm::Fnv1a => Box::new(Fnv1aRing::new()),
        HashAlgorithm::JumpFnv1a => Box::new(JumpRing::new(replicas)),
    };
    for node in nodes {
        ring.add_node(node);
    }
    ring
}
