//! Stable integer identifiers for neurons and connections
//!
//! Ids are assigned monotonically by the owning [`Graph`](super::Graph) arena
//! and double as arena indices. They are never reused within a network
//! lifetime, so every map in the graph layer can key by id instead of by
//! reference.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a neuron within one network's arena
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NeuronId(pub u64);

impl NeuronId {
    /// Arena slot this id refers to
    pub const fn index(&self) -> usize {
        self.0 as usize
    }

    /// Raw id value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NeuronId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Identifier of a connection within one network's arena
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Arena slot this id refers to
    pub const fn index(&self) -> usize {
        self.0 as usize
    }

    /// Raw id value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}
