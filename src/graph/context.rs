//! TrainingContext - mutable parameters for the graph model
//!
//! Per-neuron and per-connection parameter blocks (bias, weight, gain,
//! state, traces of the current error attribution), keyed by stable ids and
//! created lazily on first query. The graph topology itself never stores a
//! parameter; everything the reference interpreter mutates lives here.

use super::ids::{ConnectionId, NeuronId};
use crate::Value;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Initialization ranges for fresh parameters
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct InitConfig {
    /// Half-width of the uniform range for fresh weights
    pub weight_span: Value,
    /// Half-width of the uniform range for fresh biases
    pub bias_span: Value,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            weight_span: 0.1,
            bias_span: 0.1,
        }
    }
}

/// Mutable state of a single neuron
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NeuronData {
    pub bias: Value,
    pub activation: Value,
    pub derivative: Value,
    pub state: Value,
    pub old_state: Value,
    pub error_responsibility: Value,
    pub projected_activity: Value,
    pub gating_activity: Value,
}

/// Mutable state of a single connection
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConnectionData {
    pub weight: Value,
    pub gain: Value,
}

/// Parameter store shared by every layer of one network
#[derive(Debug, Default)]
pub struct TrainingContext {
    name: String,
    config: InitConfig,
    neuron_data: BTreeMap<NeuronId, NeuronData>,
    connection_data: BTreeMap<ConnectionId, ConnectionData>,
}

impl TrainingContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_config(name: impl Into<String>, config: InitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameter block of a neuron, created with a random bias on first query
    pub fn neuron_data(&mut self, id: NeuronId) -> &mut NeuronData {
        let span = self.config.bias_span;
        self.neuron_data.entry(id).or_insert_with(|| NeuronData {
            bias: rand::thread_rng().gen_range(-span..span),
            ..Default::default()
        })
    }

    /// Parameter block of a connection, created with a random weight on first query
    pub fn connection_data(&mut self, id: ConnectionId) -> &mut ConnectionData {
        let span = self.config.weight_span;
        self.connection_data
            .entry(id)
            .or_insert_with(|| ConnectionData {
                weight: rand::thread_rng().gen_range(-span..span),
                gain: 1.0,
            })
    }

    /// All neuron blocks created so far, in id order
    pub fn neuron_entries(&self) -> impl Iterator<Item = (NeuronId, &NeuronData)> {
        self.neuron_data.iter().map(|(id, data)| (*id, data))
    }

    /// All connection blocks created so far, in id order
    pub fn connection_entries(&self) -> impl Iterator<Item = (ConnectionId, &ConnectionData)> {
        self.connection_data.iter().map(|(id, data)| (*id, data))
    }

    pub fn insert_neuron_data(&mut self, id: NeuronId, data: NeuronData) {
        self.neuron_data.insert(id, data);
    }

    pub fn insert_connection_data(&mut self, id: ConnectionId, data: ConnectionData) {
        self.connection_data.insert(id, data);
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Drop every parameter block; fresh queries re-randomize
    pub fn clear(&mut self) {
        self.neuron_data.clear();
        self.connection_data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_creation_is_stable() {
        let mut ctx = TrainingContext::new("test");
        let bias = ctx.neuron_data(NeuronId(0)).bias;
        assert!(bias.abs() <= 0.1);
        // Second query returns the same block, not a re-randomized one
        assert_eq!(ctx.neuron_data(NeuronId(0)).bias, bias);
    }

    #[test]
    fn test_connection_defaults() {
        let mut ctx = TrainingContext::new("test");
        let data = *ctx.connection_data(ConnectionId(3));
        assert_eq!(data.gain, 1.0);
        assert!(data.weight.abs() <= 0.1);
    }

    #[test]
    fn test_clear_rerandomizes() {
        let mut ctx = TrainingContext::new("test");
        ctx.neuron_data(NeuronId(0)).bias = 5.0;
        ctx.clear();
        assert!(ctx.neuron_data(NeuronId(0)).bias.abs() <= 0.1);
    }

    #[test]
    fn test_custom_init_span() {
        let config = InitConfig {
            weight_span: 0.5,
            bias_span: 0.5,
        };
        let mut ctx = TrainingContext::with_config("test", config);
        for i in 0..32 {
            assert!(ctx.connection_data(ConnectionId(i)).weight.abs() <= 0.5);
        }
    }
}
