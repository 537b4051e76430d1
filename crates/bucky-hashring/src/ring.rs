//! Sorted 16-bit rings shared by the carbon and FNV1a variants.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::marker::PhantomData;

use bucky_types::{HashAlgorithm, Node};
use tracing::debug;

use crate::error::RingError;
use crate::hash::{carbon_position, fnv1a_position};
use crate::{DEFAULT_RING_REPLICAS, HashRing};

/// How a ring variant places nodes and keys on the 16-bit ring.
pub trait PositionScheme: Send + Sync + 'static {
    /// Algorithm reported by rings using this scheme.
    const ALGORITHM: HashAlgorithm;

    /// Ring position of a string.
    fn position(key: &str) -> u16;

    /// The string hashed for the `index`-th point of `node`.
    fn replica_key(node: &Node, index: usize) -> String;
}

/// carbon-cache.py placement.
#[derive(Debug, Clone, Copy, Default)]
pub struct Carbon;

impl PositionScheme for Carbon {
    const ALGORITHM: HashAlgorithm = HashAlgorithm::Carbon;

    fn position(key: &str) -> u16 {
        carbon_position(key)
    }

    fn replica_key(node: &Node, index: usize) -> String {
        format!("{}:{}", node.carbon_key(), index)
    }
}

/// carbon-c-relay FNV1a placement.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fnv1a;

impl PositionScheme for Fnv1a {
    const ALGORITHM: HashAlgorithm = HashAlgorithm::Fnv1a;

    fn position(key: &str) -> u16 {
        fnv1a_position(key)
    }

    fn replica_key(node: &Node, index: usize) -> String {
        format!("{}-{}", index, node.fnv1a_key())
    }
}

/// A point on the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingEntry {
    /// 16-bit ring position.
    pub position: u16,
    /// Node owning this point.
    pub node: Node,
}

impl RingEntry {
    /// Tuple ordering used by carbon for insertion: position, then server,
    /// then instance (a missing instance sorts first).
    fn insertion_cmp(&self, other: &RingEntry) -> Ordering {
        self.position
            .cmp(&other.position)
            .then_with(|| self.node.server.cmp(&other.node.server))
            .then_with(|| self.node.instance_str().cmp(other.node.instance_str()))
    }
}

/// A ring with `replicas` points per node, kept sorted by position.
pub struct ConsistentRing<S: PositionScheme> {
    ring: Vec<RingEntry>,
    nodes: Vec<Node>,
    replicas: usize,
    _scheme: PhantomData<S>,
}

/// carbon-cache.py compatible ring.
pub type CarbonRing = ConsistentRing<Carbon>;

/// carbon-c-relay FNV1a compatible ring.
pub type Fnv1aRing = ConsistentRing<Fnv1a>;

impl<S: PositionScheme> ConsistentRing<S> {
    /// Create an empty ring with the default 100 points per node.
    pub fn new() -> Self {
        Self::with_replicas(DEFAULT_RING_REPLICAS)
    }

    /// Create an empty ring with `replicas` points per node.
    pub fn with_replicas(replicas: usize) -> Self {
        Self {
            ring: Vec::new(),
            nodes: Vec::new(),
            replicas,
            _scheme: PhantomData,
        }
    }

    /// Ring points in position order.
    pub fn entries(&self) -> &[RingEntry] {
        &self.ring
    }

    /// Index of the first point at or after the key's position, wrapping.
    fn index_of(&self, key: &str) -> usize {
        assert!(!self.ring.is_empty(), "hash ring is empty");
        let pos = S::position(key);
        self.ring.partition_point(|e| e.position < pos) % self.ring.len()
    }
}

impl<S: PositionScheme> Default for ConsistentRing<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: PositionScheme> Clone for ConsistentRing<S> {
    fn clone(&self) -> Self {
        Self {
            ring: self.ring.clone(),
            nodes: self.nodes.clone(),
            replicas: self.replicas,
            _scheme: PhantomData,
        }
    }
}

impl<S: PositionScheme> HashRing for ConsistentRing<S> {
    fn algorithm(&self) -> HashAlgorithm {
        S::ALGORITHM
    }

    fn add_node(&mut self, node: Node) {
        for i in 0..self.replicas {
            let entry = RingEntry {
                position: S::position(&S::replica_key(&node, i)),
                node: node.clone(),
            };
            // bisect right: after every entry that compares <= the new one
            let idx = self
                .ring
                .partition_point(|e| e.insertion_cmp(&entry) != Ordering::Greater);
            self.ring.insert(idx, entry);
        }
        debug!(%node, algo = %S::ALGORITHM, points = self.replicas, "added node to ring");
        self.nodes.push(node);
    }

    fn remove_node(&mut self, node: &Node) -> Result<(), RingError> {
        self.nodes.retain(|n| n != node);
        self.ring.retain(|e| &e.node != node);
        debug!(%node, algo = %S::ALGORITHM, "removed node from ring");
        Ok(())
    }

    fn get_node(&self, key: &str) -> &Node {
        &self.ring[self.index_of(key)].node
    }

    fn get_nodes(&self, key: &str) -> Vec<Node> {
        let start = self.index_of(key);
        let want = self.replicas.min(self.nodes.len());
        let mut seen = HashSet::with_capacity(want);
        let mut result = Vec::with_capacity(want);

        let walk = self.ring[start..].iter().chain(self.ring[..start].iter());
        for entry in walk {
            if seen.insert(&entry.node) {
                result.push(entry.node.clone());
                if result.len() == want {
                    break;
                }
            }
        }
        result
    }

    fn buckets_per_node(&self) -> BTreeMap<Node, u32> {
        assert!(!self.ring.is_empty(), "hash ring is empty");

        let mut buckets = BTreeMap::new();
        let mut last = &self.ring[self.ring.len() - 1];
        for (i, entry) in self.ring.iter().enumerate() {
            let owned = if i == 0 {
                (0xFFFF - last.position as u32) + entry.position as u32
            } else {
                (entry.position - last.position) as u32
            };
            *buckets.entry(entry.node.clone()).or_insert(0) += owned;
            last = entry;
        }
        buckets
    }

    fn replicas(&self) -> usize {
        self.replicas
    }

    fn nodes(&self) -> &[Node] {
        &self.nodes
    }
}

impl<S: PositionScheme> fmt::Display for ConsistentRing<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let servers: Vec<String> = self.nodes.iter().map(Node::to_string).collect();
        write!(
            f,
            "[{}: {} nodes, {} replicas, {} ring members {}]",
            S::ALGORITHM,
            self.nodes.len(),
            self.replicas,
            self.ring.len(),
            servers.join(" ")
        )
    }
}

impl<S: PositionScheme> fmt::Debug for ConsistentRing<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
