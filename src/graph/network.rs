//! Network - layered composition over one graph arena
//!
//! A network owns its [`Graph`], its [`TrainingContext`] and the layer
//! handles. `feed`/`train` drive the immediate-mode reference interpreter;
//! `to_unrolled` compiles the whole graph into straight-line bytecode, after
//! which the graph side may be dropped entirely.
//!
//! The prefabs reproduce the classic wirings: a plain feed-forward stack and
//! the gated LSTM block (input/forget/output gates with +1 bias, memory cell
//! self-loop gated by the forget gate, peepholes, input→output shortcut).

use super::context::TrainingContext;
use super::ids::NeuronId;
use super::layer::Layer;
use super::neuron::Graph;
use crate::error::Result;
use crate::unrolled::{
    Tag, UnrolledNetwork, UnrolledNeuron, UnrolledTrainingContext, VariableKey,
};
use crate::Value;
use log::debug;

/// A layered recurrent network with an immediate-mode interpreter
#[derive(Debug)]
pub struct Network {
    name: String,
    graph: Graph,
    context: TrainingContext,
    input_layer: Layer,
    hidden_layers: Vec<Layer>,
    output_layer: Layer,
}

impl Network {
    /// Assemble a network from prebuilt layers sharing one arena/context
    pub fn from_layers(
        name: impl Into<String>,
        graph: Graph,
        context: TrainingContext,
        input_layer: Layer,
        hidden_layers: Vec<Layer>,
        output_layer: Layer,
    ) -> Self {
        Self {
            name: name.into(),
            graph,
            context,
            input_layer,
            hidden_layers,
            output_layer,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn context(&self) -> &TrainingContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut TrainingContext {
        &mut self.context
    }

    pub fn input_layer(&self) -> &Layer {
        &self.input_layer
    }

    pub fn hidden_layers(&self) -> &[Layer] {
        &self.hidden_layers
    }

    pub fn output_layer(&self) -> &Layer {
        &self.output_layer
    }

    /// Split borrow for callers that drive the arena and the parameter
    /// store together (the emitter does)
    pub fn graph_and_context_mut(&mut self) -> (&Graph, &mut TrainingContext) {
        (&self.graph, &mut self.context)
    }

    // =========================================================================
    // Prefabs
    // =========================================================================

    /// Sequential all-to-all stack: input → hidden... → output
    pub fn feed_forward(
        name: impl Into<String>,
        input_size: usize,
        hidden_sizes: &[usize],
        output_size: usize,
    ) -> Self {
        let mut graph = Graph::new();
        let context = TrainingContext::new("");

        let input_layer = Layer::new(&mut graph, input_size);
        let mut hidden_layers = Vec::with_capacity(hidden_sizes.len());
        let mut previous = input_layer.clone();

        for &size in hidden_sizes {
            let hidden = Layer::new(&mut graph, size);
            previous.connect_all_to_all(&mut graph, &hidden);
            previous = hidden.clone();
            hidden_layers.push(hidden);
        }

        let output_layer = Layer::new(&mut graph, output_size);
        previous.connect_all_to_all(&mut graph, &output_layer);

        let name = name.into();
        let mut network = Self::from_layers(
            name.clone(),
            graph,
            context,
            input_layer,
            hidden_layers,
            output_layer,
        );
        network.context.set_name(name);
        network
    }

    /// LSTM: one block of four equal layers per hidden size
    pub fn lstm(
        name: impl Into<String>,
        input_size: usize,
        hidden_sizes: &[usize],
        output_size: usize,
    ) -> Self {
        let mut graph = Graph::new();
        let mut context = TrainingContext::new("");

        let input_layer = Layer::new(&mut graph, input_size);
        let output_layer = Layer::new(&mut graph, output_size);

        let mut hidden_layers = Vec::with_capacity(hidden_sizes.len() * 4);
        let mut previous: Option<Layer> = None;

        for &size in hidden_sizes {
            let input_gate = Layer::with_bias(&mut graph, &mut context, size, 1.0);
            let forget_gate = Layer::with_bias(&mut graph, &mut context, size, 1.0);
            let memory_cell = Layer::new(&mut graph, size);
            let output_gate = Layer::with_bias(&mut graph, &mut context, size, 1.0);

            let input_connections = input_layer.connect_all_to_all(&mut graph, &memory_cell);
            input_layer.connect_all_to_all(&mut graph, &input_gate);
            input_layer.connect_all_to_all(&mut graph, &forget_gate);
            input_layer.connect_all_to_all(&mut graph, &output_gate);

            let cell_connections = previous.as_ref().map(|prev| {
                let connections = prev.connect_all_to_all(&mut graph, &memory_cell);
                prev.connect_all_to_all(&mut graph, &input_gate);
                prev.connect_all_to_all(&mut graph, &forget_gate);
                prev.connect_all_to_all(&mut graph, &output_gate);
                connections
            });

            let output_connections = memory_cell.connect_all_to_all(&mut graph, &output_layer);
            let self_connections = memory_cell.connect_one_to_one(&mut graph, &memory_cell);

            // peepholes
            memory_cell.connect_all_to_all(&mut graph, &input_gate);
            memory_cell.connect_all_to_all(&mut graph, &forget_gate);
            memory_cell.connect_all_to_all(&mut graph, &output_gate);

            input_gate.gate_all_incoming_connections(&mut graph, &memory_cell, &input_connections);
            forget_gate.gate_one_to_one(&mut graph, &memory_cell, &memory_cell, &self_connections);
            output_gate.gate_all_outgoing_connections(&mut graph, &memory_cell, &output_connections);

            if let Some(cell_connections) = cell_connections {
                input_gate.gate_all_incoming_connections(
                    &mut graph,
                    &memory_cell,
                    &cell_connections,
                );
            }

            previous = Some(memory_cell.clone());

            hidden_layers.push(input_gate);
            hidden_layers.push(forget_gate);
            hidden_layers.push(memory_cell);
            hidden_layers.push(output_gate);
        }

        // shortcut
        input_layer.connect_all_to_all(&mut graph, &output_layer);

        let name = name.into();
        let mut network = Self::from_layers(
            name.clone(),
            graph,
            context,
            input_layer,
            hidden_layers,
            output_layer,
        );
        network.context.set_name(name);
        network
    }

    // =========================================================================
    // Reference interpreter
    // =========================================================================

    /// Feed the input layer, process the rest, return the output activations
    pub fn feed(&mut self, input: &[Value]) -> Result<Vec<Value>> {
        self.input_layer.feed(&self.graph, &mut self.context, input)?;
        for layer in &self.hidden_layers {
            layer.process(&mut self.graph, &mut self.context);
        }
        Ok(self.output_layer.process(&mut self.graph, &mut self.context))
    }

    /// Inject targets at the output, then backpropagate through the hidden
    /// layers in reverse order
    pub fn train(&mut self, rate: Value, target: &[Value]) -> Result<()> {
        self.output_layer
            .train(&mut self.graph, &mut self.context, rate, target)?;
        for layer in self.hidden_layers.iter().rev() {
            layer.back_propagate(&mut self.graph, &mut self.context, rate);
        }
        Ok(())
    }

    // =========================================================================
    // Unrolling
    // =========================================================================

    /// Compile the graph into a register-machine bytecode network. The graph
    /// parameters seed the register file, so the unrolled network starts
    /// exactly where this one stands.
    pub fn to_unrolled(&mut self) -> UnrolledNetwork {
        let mut unrolled_context = UnrolledTrainingContext::new();
        let mut layers: Vec<Vec<UnrolledNeuron>> = Vec::new();

        let input_layer = self.input_layer.clone();
        let hidden_layers = self.hidden_layers.clone();
        let output_layer = self.output_layer.clone();

        layers.push(self.unroll_layer(&mut unrolled_context, &input_layer, true, false));
        for layer in &hidden_layers {
            layers.push(self.unroll_layer(&mut unrolled_context, layer, false, false));
        }
        layers.push(self.unroll_layer(&mut unrolled_context, &output_layer, false, true));

        debug!(
            "unrolled '{}': {} neurons into {} registers",
            self.name,
            self.graph.neuron_count(),
            unrolled_context.memory().len()
        );

        UnrolledNetwork::with_layers(unrolled_context, layers)
    }

    fn unroll_layer(
        &mut self,
        unrolled_context: &mut UnrolledTrainingContext,
        layer: &Layer,
        as_input: bool,
        as_output: bool,
    ) -> Vec<UnrolledNeuron> {
        layer
            .neurons()
            .iter()
            .map(|&id| {
                let as_const = self.graph.neuron(id).is_const();
                UnrolledNeuron::build(
                    unrolled_context,
                    &self.graph,
                    &mut self.context,
                    id,
                    as_input,
                    as_output,
                    as_const,
                )
            })
            .collect()
    }

    /// Copy every parameter back out of a register file, so the reference
    /// interpreter continues from where the unrolled network was trained.
    pub fn restore(&mut self, unrolled_context: &UnrolledTrainingContext) {
        let neuron_ids: Vec<NeuronId> = (0..self.graph.neuron_count() as u64).map(NeuronId).collect();

        for &id in &neuron_ids {
            {
                let data = self.context.neuron_data(id);
                data.bias =
                    unrolled_context.evaluate(&VariableKey::neuron(id, Tag::Bias), data.bias);
                data.state =
                    unrolled_context.evaluate(&VariableKey::neuron(id, Tag::State), data.state);
                data.old_state = unrolled_context
                    .evaluate(&VariableKey::neuron(id, Tag::OldState), data.old_state);
                data.activation = unrolled_context
                    .evaluate(&VariableKey::neuron(id, Tag::Activation), data.activation);
            }

            let incoming: Vec<_> = self
                .graph
                .neuron(id)
                .incoming_connections()
                .iter()
                .copied()
                .collect();
            let trace_neighbours: Vec<_> = self.graph.neuron(id).extended_neighbours().collect();

            for &c in &incoming {
                let current = self.graph.neuron(id).eligibility(c);
                let restored = unrolled_context
                    .evaluate(&VariableKey::eligibility(id, c), current);
                self.graph.set_eligibility(id, c, restored);

                for &k in &trace_neighbours {
                    let current = self.graph.neuron(id).extended_trace(k, c);
                    let restored = unrolled_context
                        .evaluate(&VariableKey::extended_trace(id, k, c), current);
                    self.graph.set_extended_trace(id, k, c, restored);
                }
            }

            let outgoing: Vec<_> = self
                .graph
                .neuron(id)
                .outgoing_connections()
                .iter()
                .copied()
                .chain(self.graph.neuron(id).self_connection())
                .collect();
            for c in outgoing {
                let data = self.context.connection_data(c);
                data.weight =
                    unrolled_context.evaluate(&VariableKey::connection(c, Tag::Weight), data.weight);
                data.gain =
                    unrolled_context.evaluate(&VariableKey::connection(c, Tag::Gain), data.gain);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn train_xor(network: &mut UnrolledNetwork, iterations: usize, rate: Value) {
        for _ in 0..iterations {
            network.feed(&[0.0, 1.0]).unwrap();
            network.train(rate, &[1.0]).unwrap();
            network.feed(&[1.0, 0.0]).unwrap();
            network.train(rate, &[1.0]).unwrap();
            network.feed(&[0.0, 0.0]).unwrap();
            network.train(rate, &[0.0]).unwrap();
            network.feed(&[1.0, 1.0]).unwrap();
            network.train(rate, &[0.0]).unwrap();
        }
    }

    #[test]
    fn test_feed_forward_prefab_wiring() {
        let network = Network::feed_forward("ff", 2, &[3, 4], 1);
        assert_eq!(network.input_layer().size(), 2);
        assert_eq!(network.hidden_layers().len(), 2);
        assert_eq!(network.output_layer().size(), 1);
        // 2*3 + 3*4 + 4*1
        assert_eq!(network.graph().connection_count(), 22);
    }

    #[test]
    fn test_lstm_prefab_structure() {
        let network = Network::lstm("lstm", 2, &[3], 1);
        // four blocks per hidden size
        assert_eq!(network.hidden_layers().len(), 4);

        let memory_cell = &network.hidden_layers()[2];
        assert!(memory_cell.is_self_connected(network.graph()));

        // forget gate gates each memory cell self-loop
        let forget_gate = &network.hidden_layers()[1];
        for (&cell, &gater) in memory_cell.neurons().iter().zip(forget_gate.neurons()) {
            let sc = network.graph().neuron(cell).self_connection().unwrap();
            assert_eq!(network.graph().connection(sc).gate_neuron(), Some(gater));
        }
    }

    #[test]
    fn test_lstm_gate_biases() {
        let mut network = Network::lstm("lstm", 2, &[3], 1);
        let input_gate = network.hidden_layers()[0].clone();
        for &id in input_gate.neurons() {
            assert_eq!(network.context_mut().neuron_data(id).bias, 1.0);
        }
    }

    #[test]
    fn test_reference_feed_shape() {
        let mut network = Network::lstm("lstm", 2, &[3], 1);
        let out = network.feed(&[0.3, 0.7]).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0] > 0.0 && out[0] < 1.0);
        assert!(network.feed(&[0.3]).is_err());
    }

    #[test]
    fn test_unrolled_matches_reference_on_feed() {
        let mut network = Network::lstm("lstm", 2, &[3, 3], 1);
        let mut unrolled = network.to_unrolled();

        for sample in [[0.0, 1.0], [1.0, 0.0], [0.0, 0.0], [1.0, 1.0]] {
            let reference = network.feed(&sample).unwrap();
            let compiled = unrolled.feed(&sample).unwrap();
            assert_eq!(reference.len(), compiled.len());
            for (r, c) in reference.iter().zip(&compiled) {
                assert!(
                    (r - c).abs() < 1e-2,
                    "reference {} vs unrolled {}",
                    r,
                    c
                );
            }
        }
    }

    #[test]
    fn test_unrolled_matches_reference_through_training() {
        let mut network = Network::lstm("lstm", 2, &[2], 1);
        let mut unrolled = network.to_unrolled();

        for i in 0..32 {
            let sample = [(i % 2) as Value, ((i / 2) % 2) as Value];
            let target = [if i % 3 == 0 { 1.0 } else { 0.0 }];

            let reference = network.feed(&sample).unwrap();
            let compiled = unrolled.feed(&sample).unwrap();
            for (r, c) in reference.iter().zip(&compiled) {
                assert!((r - c).abs() < 1e-2, "step {}: {} vs {}", i, r, c);
            }

            network.train(0.1, &target).unwrap();
            unrolled.train(0.1, &target).unwrap();
        }
    }

    // Scenario: LSTM learns xor on the unrolled bytecode path
    #[test]
    fn test_unrolled_lstm_learns_xor() {
        let mut network = Network::lstm("xor", 2, &[3, 3], 1);
        let mut unrolled = network.to_unrolled();

        train_xor(&mut unrolled, 2000, 0.5);

        assert!(unrolled.feed(&[0.0, 1.0]).unwrap()[0] > 0.9);
        assert!(unrolled.feed(&[1.0, 0.0]).unwrap()[0] > 0.9);
        assert!(unrolled.feed(&[0.0, 0.0]).unwrap()[0] < 0.1);
        assert!(unrolled.feed(&[1.0, 1.0]).unwrap()[0] < 0.1);
    }

    // Scenario: trained weights survive the trip back into the graph model
    #[test]
    fn test_restore_round_trips_trained_weights() {
        let mut network = Network::lstm("xor", 2, &[3, 3], 1);
        let mut unrolled = network.to_unrolled();

        train_xor(&mut unrolled, 2000, 0.5);
        network.restore(unrolled.context());

        assert!(network.feed(&[0.0, 1.0]).unwrap()[0] > 0.9);
        assert!(network.feed(&[1.0, 0.0]).unwrap()[0] > 0.9);
        assert!(network.feed(&[0.0, 0.0]).unwrap()[0] < 0.1);
        assert!(network.feed(&[1.0, 1.0]).unwrap()[0] < 0.1);
    }
}
