//! Jump consistent hash ring.

use std::collections::BTreeMap;
use std::fmt;

use bucky_types::{HashAlgorithm, Node};
use tracing::debug;

use crate::HashRing;
use crate::error::RingError;
use crate::hash::{fnv1a64, jump, xorshift64};

/// Jump consistent hash over a flat node list.
///
/// Nodes with an instance are kept in instance order so that every bucky
/// daemon builds the same list regardless of configuration order. Because
/// jump hashing identifies nodes by bucket index, only the last node can be
/// removed.
#[derive(Debug, Clone, Default)]
pub struct JumpRing {
    ring: Vec<Node>,
    replicas: usize,
}

impl JumpRing {
    /// Create an empty ring with the given replication factor.
    pub fn new(replicas: usize) -> Self {
        Self {
            ring: Vec::new(),
            replicas,
        }
    }

    fn bucket(&self, hash: u64, buckets: usize) -> usize {
        assert!(!self.ring.is_empty(), "hash ring is empty");
        jump(hash, buckets) as usize
    }
}

impl HashRing for JumpRing {
    fn algorithm(&self) -> HashAlgorithm {
        HashAlgorithm::JumpFnv1a
    }

    fn add_node(&mut self, node: Node) {
        match node.instance.as_deref() {
            None => self.ring.push(node),
            Some(instance) => {
                let idx = self
                    .ring
                    .iter()
                    .position(|n| instance < n.instance_str())
                    .unwrap_or(self.ring.len());
                self.ring.insert(idx, node);
            }
        }
        debug!(nodes = self.ring.len(), "added node to jump ring");
    }

    fn remove_node(&mut self, node: &Node) -> Result<(), RingError> {
        match self.ring.last() {
            Some(last) if last == node => {
                self.ring.pop();
                debug!(%node, "removed tail node from jump ring");
                Ok(())
            }
            Some(_) if self.ring.contains(node) => Err(RingError::NotTail { node: node.clone() }),
            _ => Err(RingError::UnknownNode(node.clone())),
        }
    }

    fn get_node(&self, key: &str) -> &Node {
        let idx = self.bucket(fnv1a64(key.as_bytes()), self.ring.len());
        &self.ring[idx]
    }

    fn get_nodes(&self, key: &str) -> Vec<Node> {
        let mut ring = self.ring.clone();
        let mut hash = fnv1a64(key.as_bytes());
        let mut remaining = ring.len();
        let want = self.replicas.min(remaining).max(1);
        let mut result = Vec::with_capacity(want);

        while remaining > 0 {
            let j = self.bucket(hash, remaining);
            result.push(ring[j].clone());
            if result.len() >= want {
                break;
            }
            hash = xorshift64(hash);
            remaining -= 1;
            // Retire the chosen bucket by moving it past the live range.
            ring.swap(j, remaining);
        }
        result
    }

    fn buckets_per_node(&self) -> BTreeMap<Node, u32> {
        assert!(!self.ring.is_empty(), "hash ring is empty");
        let mut buckets = BTreeMap::new();
        for node in &self.ring {
            *buckets.entry(node.clone()).or_insert(0) += 1;
        }
        buckets
    }

    fn replicas(&self) -> usize {
        self.replicas
    }

    fn nodes(&self) -> &[Node] {
        &self.ring
    }
}

impl fmt::Display for JumpRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("jump_fnv1a:")?;
        for (i, node) in self.ring.iter().enumerate() {
            write!(f, "\t{i:3}:{}", node.server)?;
        }
        Ok(())
    }
}
