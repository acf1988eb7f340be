//! # Tracenet - Recurrent Networks as Register-Machine Bytecode
//!
//! Builds, trains and evaluates recurrent neural networks (including LSTM)
//! by unrolling a symbolic neuron graph into a compact bytecode program,
//! then executing that program on a flat register file for both forward
//! ("feed") and learning ("train") passes.
//!
//! ## Core Components
//!
//! - **Graph model** ([`graph`]): neuron/connection topology with
//!   self-connections, gated connections, and the eligibility/influence
//!   bookkeeping of the derivative-of-eligibility-trace learning rule
//! - **Unroller** ([`unrolled::UnrolledNeuron`]): per-neuron code generator
//!   emitting straight-line feed/trace/train chunks over register indices
//! - **Register VM** ([`unrolled::vm_process`]): stack-free interpreter over
//!   a single `Value` array; the hot path of every step
//!
//! ## Pipeline
//!
//! ```text
//! Network ──unroll──► UnrolledNetwork ──feed/train──► register file
//! ```
//!
//! ## Example
//!
//! ```
//! use tracenet::graph::Network;
//!
//! let mut network = Network::lstm("xor", 2, &[3, 3], 1);
//! let mut unrolled = network.to_unrolled();
//!
//! for _ in 0..100 {
//!     unrolled.feed(&[0.0, 1.0]).unwrap();
//!     unrolled.train(0.05, &[1.0]).unwrap();
//! }
//! let out = unrolled.feed(&[0.0, 1.0]).unwrap();
//! assert_eq!(out.len(), 1);
//! ```
//!
//! ## Design Principles
//!
//! - **One owner per register file**: the unrolled network exclusively owns
//!   its memory; the graph may be dropped after unrolling
//! - **Ids, not pointers**: all graph references are arena ids, so the
//!   cyclic gating topology never entangles ownership
//! - **Single-threaded hot path**: the VM never allocates, never locks

/// Numeric type of the register file. Single-precision is a legal
/// compile-time alternative; the serialized snapshot records the width.
pub type Value = f64;

/// Index into the register file, as stored in the bytecode operand stream
pub type RegisterIndex = u32;

/// The activation function shared by the reference interpreter and the VM
#[inline]
pub fn activation(x: Value) -> Value {
    1.0 / (1.0 + (-x).exp())
}

/// Slope of the activation, expressed in terms of the activation itself
#[inline]
pub fn derivative(fx: Value) -> Value {
    fx * (1.0 - fx)
}

// Graph model - topology, prefabs, reference interpreter
pub mod graph;
pub use graph::{Graph, Layer, Network, TrainingContext};

// Unrolled execution - allocator, emitter, kernels, VM
pub mod unrolled;
pub use unrolled::{vm_process, Opcode, UnrolledNetwork, UnrolledTrainingContext};

// Error types
mod error;
pub use error::{Result, TracenetError};

// Serialization surface - abstract tree context + JSON binding
pub mod serialization;
pub use serialization::{TreeNode, TreeSerializable};
