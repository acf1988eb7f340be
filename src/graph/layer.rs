//! Layer - an ordered group of neurons with batch operators
//!
//! A `Layer` is a cheap handle (a vec of neuron ids) over the arena; wiring,
//! gating and processing all delegate into [`Graph`]. Size-parity failures
//! report through an empty connection set or `false`, never a panic.

use super::context::TrainingContext;
use super::ids::{ConnectionId, NeuronId};
use super::neuron::Graph;
use crate::error::{Result, TracenetError};
use crate::Value;
use std::collections::BTreeSet;

/// Connections produced by a batch wiring operation, in id order
pub type ConnectionSet = BTreeSet<ConnectionId>;

/// Handle over an ordered group of neurons in one arena
#[derive(Debug, Clone)]
pub struct Layer {
    neurons: Vec<NeuronId>,
}

impl Layer {
    /// Create a layer of fresh neurons
    pub fn new(graph: &mut Graph, size: usize) -> Self {
        let neurons = (0..size).map(|_| graph.add_neuron()).collect();
        Self { neurons }
    }

    /// Create a layer whose neurons start from a fixed bias (LSTM gates use +1)
    pub fn with_bias(graph: &mut Graph, ctx: &mut TrainingContext, size: usize, bias: Value) -> Self {
        let layer = Self::new(graph, size);
        for &id in &layer.neurons {
            ctx.neuron_data(id).bias = bias;
        }
        layer
    }

    /// Rebuild a handle over existing neurons (deserialization path)
    pub fn from_neuron_ids(neurons: Vec<NeuronId>) -> Self {
        Self { neurons }
    }

    pub fn size(&self) -> usize {
        self.neurons.len()
    }

    pub fn neurons(&self) -> &[NeuronId] {
        &self.neurons
    }

    // =========================================================================
    // Batch wiring
    // =========================================================================

    /// Connect every neuron of this layer to every neuron of `other`.
    /// Same-neuron pairs are skipped; use [`connect_one_to_one`] for
    /// self-loops.
    ///
    /// [`connect_one_to_one`]: Layer::connect_one_to_one
    pub fn connect_all_to_all(&self, graph: &mut Graph, other: &Layer) -> ConnectionSet {
        let mut connections = ConnectionSet::new();
        for &from in &self.neurons {
            for &to in &other.neurons {
                if from == to {
                    continue;
                }
                connections.insert(graph.connect(from, to));
            }
        }
        connections
    }

    /// Connect neuron i to neuron i. Layers of different sizes make no
    /// connections at all.
    pub fn connect_one_to_one(&self, graph: &mut Graph, other: &Layer) -> ConnectionSet {
        let mut connections = ConnectionSet::new();
        if self.size() != other.size() {
            return connections;
        }
        for (&from, &to) in self.neurons.iter().zip(&other.neurons) {
            connections.insert(graph.connect(from, to));
        }
        connections
    }

    // =========================================================================
    // Batch gating
    // =========================================================================

    /// Gater i takes over the incoming connections of `to_layer`'s neuron i
    /// that appear in `connections`. Fails on size disagreement.
    pub fn gate_all_incoming_connections(
        &self,
        graph: &mut Graph,
        to_layer: &Layer,
        connections: &ConnectionSet,
    ) -> bool {
        if to_layer.size() != self.size() {
            return false;
        }
        for (&target, &gater) in to_layer.neurons.iter().zip(&self.neurons) {
            let incoming: Vec<ConnectionId> = graph
                .neuron(target)
                .incoming_connections()
                .iter()
                .copied()
                .filter(|c| connections.contains(c))
                .collect();
            for c in incoming {
                graph.gate(gater, c);
            }
        }
        true
    }

    /// Gater i takes over the outgoing connections of `from_layer`'s neuron i
    /// that appear in `connections`. Fails on size disagreement.
    pub fn gate_all_outgoing_connections(
        &self,
        graph: &mut Graph,
        from_layer: &Layer,
        connections: &ConnectionSet,
    ) -> bool {
        if from_layer.size() != self.size() {
            return false;
        }
        for (&source, &gater) in from_layer.neurons.iter().zip(&self.neurons) {
            let outgoing: Vec<ConnectionId> = graph
                .neuron(source)
                .outgoing_connections()
                .iter()
                .copied()
                .filter(|c| connections.contains(c))
                .collect();
            for c in outgoing {
                graph.gate(gater, c);
            }
        }
        true
    }

    /// Gater i takes over the single connection from `from_layer`'s neuron i
    /// listed in `connections`; the self-connection slot is scanned too, so
    /// a one-to-one self loop (the LSTM memory cell) can be gated.
    pub fn gate_one_to_one(
        &self,
        graph: &mut Graph,
        from_layer: &Layer,
        to_layer: &Layer,
        connections: &ConnectionSet,
    ) -> bool {
        if connections.len() != self.size()
            || from_layer.size() != self.size()
            || to_layer.size() != self.size()
        {
            return false;
        }
        for (&source, &gater) in from_layer.neurons.iter().zip(&self.neurons) {
            let neuron = graph.neuron(source);
            let candidate = neuron
                .self_connection()
                .into_iter()
                .chain(neuron.outgoing_connections().iter().copied())
                .find(|c| connections.contains(c));
            if let Some(c) = candidate {
                graph.gate(gater, c);
            }
        }
        true
    }

    // =========================================================================
    // Batch processing (reference interpreter)
    // =========================================================================

    /// Present one input sample to an input layer.
    pub fn feed(&self, graph: &Graph, ctx: &mut TrainingContext, values: &[Value]) -> Result<()> {
        if values.len() != self.size() {
            return Err(TracenetError::ShapeMismatch {
                expected: self.size(),
                actual: values.len(),
            });
        }
        for (&id, &value) in self.neurons.iter().zip(values) {
            graph.feed_neuron(ctx, id, value);
        }
        Ok(())
    }

    /// Forward-process every neuron, returning the activations in order.
    pub fn process(&self, graph: &mut Graph, ctx: &mut TrainingContext) -> Vec<Value> {
        self.neurons
            .iter()
            .map(|&id| graph.process_neuron(ctx, id))
            .collect()
    }

    /// Inject targets into an output layer, last neuron first.
    pub fn train(
        &self,
        graph: &mut Graph,
        ctx: &mut TrainingContext,
        rate: Value,
        target: &[Value],
    ) -> Result<()> {
        if target.len() != self.size() {
            return Err(TracenetError::ShapeMismatch {
                expected: self.size(),
                actual: target.len(),
            });
        }
        for (&id, &value) in self.neurons.iter().zip(target).rev() {
            graph.train_neuron(ctx, rate, id, value);
        }
        Ok(())
    }

    /// Backpropagate through a hidden layer, last neuron first.
    pub fn back_propagate(&self, graph: &mut Graph, ctx: &mut TrainingContext, rate: Value) {
        for &id in self.neurons.iter().rev() {
            graph.back_propagate_neuron(ctx, rate, id);
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn is_self_connected(&self, graph: &Graph) -> bool {
        self.neurons.iter().all(|&id| graph.neuron(id).is_self_connected())
    }

    pub fn self_connections(&self, graph: &Graph) -> ConnectionSet {
        self.neurons
            .iter()
            .filter_map(|&id| graph.neuron(id).self_connection())
            .collect()
    }

    /// Every connection leaving this layer, self-connections included
    pub fn find_all_outgoing_connections(&self, graph: &Graph) -> ConnectionSet {
        let mut connections = ConnectionSet::new();
        for &id in &self.neurons {
            let neuron = graph.neuron(id);
            connections.extend(neuron.outgoing_connections().iter().copied());
            connections.extend(neuron.self_connection());
        }
        connections
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_to_one_requires_equal_sizes() {
        let mut graph = Graph::new();
        let a = Layer::new(&mut graph, 4);
        let b = Layer::new(&mut graph, 4);
        let c = Layer::new(&mut graph, 3);

        assert_eq!(a.connect_one_to_one(&mut graph, &b).len(), 4);
        assert_eq!(a.connect_one_to_one(&mut graph, &c).len(), 0);
    }

    #[test]
    fn test_all_to_all_counts() {
        let mut graph = Graph::new();
        let a = Layer::new(&mut graph, 3);
        let b = Layer::new(&mut graph, 5);

        let connections = a.connect_all_to_all(&mut graph, &b);
        assert_eq!(connections.len(), 15);

        // wiring twice reuses every connection
        let again = a.connect_all_to_all(&mut graph, &b);
        assert_eq!(again, connections);
        assert_eq!(graph.connection_count(), 15);
    }

    #[test]
    fn test_self_one_to_one_uses_self_slots() {
        let mut graph = Graph::new();
        let a = Layer::new(&mut graph, 3);

        let self_connections = a.connect_one_to_one(&mut graph, &a);
        assert_eq!(self_connections.len(), 3);
        assert!(a.is_self_connected(&graph));
        assert_eq!(a.self_connections(&graph), self_connections);
    }

    #[test]
    fn test_gating_requires_parity() {
        let mut graph = Graph::new();
        let from = Layer::new(&mut graph, 3);
        let to = Layer::new(&mut graph, 3);
        let gater = Layer::new(&mut graph, 3);
        let short_gater = Layer::new(&mut graph, 2);

        let connections = from.connect_all_to_all(&mut graph, &to);
        assert!(gater.gate_all_incoming_connections(&mut graph, &to, &connections));
        assert!(!short_gater.gate_all_incoming_connections(&mut graph, &to, &connections));
        assert!(gater.gate_all_outgoing_connections(&mut graph, &from, &connections));
        assert!(!short_gater.gate_all_outgoing_connections(&mut graph, &from, &connections));
    }

    #[test]
    fn test_gate_one_to_one_self_loop() {
        let mut graph = Graph::new();
        let cell = Layer::new(&mut graph, 3);
        let forget = Layer::new(&mut graph, 3);

        let self_connections = cell.connect_one_to_one(&mut graph, &cell);
        assert!(forget.gate_one_to_one(&mut graph, &cell, &cell, &self_connections));

        for (&cell_id, &gater_id) in cell.neurons().iter().zip(forget.neurons()) {
            let sc = graph.neuron(cell_id).self_connection().unwrap();
            assert_eq!(graph.connection(sc).gate_neuron(), Some(gater_id));
        }
    }

    #[test]
    fn test_feed_shape_mismatch() {
        let mut graph = Graph::new();
        let mut ctx = TrainingContext::new("test");
        let a = Layer::new(&mut graph, 2);
        let b = Layer::new(&mut graph, 1);
        a.connect_all_to_all(&mut graph, &b);

        assert!(a.feed(&graph, &mut ctx, &[1.0, 0.0]).is_ok());
        assert!(a.feed(&graph, &mut ctx, &[1.0]).is_err());
    }
}
