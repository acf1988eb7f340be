//! Graph model - neurons, connections, layers, networks
//!
//! The dynamic side of the crate: an arena-backed topology with the
//! eligibility/influence bookkeeping the learning rule needs, batch layer
//! operators, the network prefabs, and the immediate-mode reference
//! interpreter the unrolled VM is validated against.

mod context;
mod ids;
mod layer;
mod network;
mod neuron;

pub use context::{ConnectionData, InitConfig, NeuronData, TrainingContext};
pub use ids::{ConnectionId, NeuronId};
pub use layer::{ConnectionSet, Layer};
pub use network::Network;
pub use neuron::{Connection, Graph, Neuron, GRADIENT_CLIP};
