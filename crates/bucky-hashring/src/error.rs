//! Error types for ring mutations.

use bucky_types::Node;

/// Errors that can occur when changing ring membership.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    /// The jump ring can only shrink from the tail.
    #[error("jump hash ring can only remove the tail node, {node} is not the tail")]
    NotTail {
        /// The node that was asked to be removed.
        node: Node,
    },

    /// The node is not a member of the ring.
    #[error("node {0} is not in the ring")]
    UnknownNode(Node),
}
