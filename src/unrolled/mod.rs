//! Unrolled execution - register allocation, bytecode emission, and the VM
//!
//! Unrolling converts the dynamic neuron/connection graph into a static
//! straight-line bytecode program over a flat register file:
//!
//! ```text
//! Graph ──► UnrolledNeuron (per-neuron chunks, registers via
//!           UnrolledTrainingContext) ──► UnrolledNetwork (feed/train
//!           kernels) ──► vm_process
//! ```
//!
//! The register file is the only state the compiled network needs; the graph
//! may be dropped once unrolling is done.

mod context;
mod emitter;
mod network;
mod opcode;
mod program;
mod vm;

pub use context::{Tag, UnrolledTrainingContext, VariableKey};
pub use emitter::UnrolledNeuron;
pub use network::{Kernel, UnrolledNetwork};
pub use opcode::Opcode;
pub use program::VmProgram;
pub use vm::vm_process;
