//! Neuron/Connection graph arena and the reference interpreter
//!
//! The topology is a pair of arenas (`Vec<Neuron>`, `Vec<Connection>`) owned
//! by [`Graph`]; every cross-reference is an id lookup, so cycles through
//! self-connections and gating paths never entangle ownership.
//!
//! Alongside the topology each neuron carries the trace bookkeeping the
//! learning rule needs:
//!
//! - `eligibility[c]` per incoming connection (Eq. 17)
//! - `extended[k][c]` per gated neighbour and incoming connection (Eq. 18)
//! - `influences[k]` the connections gated by this neuron into neighbour `k`
//!
//! The methods at the bottom are the immediate-mode reference interpreter
//! (Eq. 15-24). The unrolled VM must agree with them; they are the oracle
//! the bytecode path is tested against.

use super::context::TrainingContext;
use super::ids::{ConnectionId, NeuronId};
use crate::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Gradient magnitude bound applied before every weight update
pub const GRADIENT_CLIP: Value = 1.0;

/// A weighted, optionally gated edge between two neurons
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    input: NeuronId,
    output: NeuronId,
    gate: Option<NeuronId>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn input_neuron(&self) -> NeuronId {
        self.input
    }

    pub fn output_neuron(&self) -> NeuronId {
        self.output
    }

    pub fn gate_neuron(&self) -> Option<NeuronId> {
        self.gate
    }

    pub fn has_gate(&self) -> bool {
        self.gate.is_some()
    }
}

/// A unit in the graph: connection sets plus trace bookkeeping
#[derive(Debug, Clone, Default)]
pub struct Neuron {
    incoming: BTreeSet<ConnectionId>,
    outgoing: BTreeSet<ConnectionId>,
    gated: BTreeSet<ConnectionId>,
    self_connection: Option<ConnectionId>,
    neighbours: BTreeSet<NeuronId>,
    influences: BTreeMap<NeuronId, BTreeSet<ConnectionId>>,
    eligibility: BTreeMap<ConnectionId, Value>,
    extended: BTreeMap<NeuronId, BTreeMap<ConnectionId, Value>>,
    is_const: bool,
}

impl Neuron {
    pub fn incoming_connections(&self) -> &BTreeSet<ConnectionId> {
        &self.incoming
    }

    pub fn outgoing_connections(&self) -> &BTreeSet<ConnectionId> {
        &self.outgoing
    }

    pub fn gated_connections(&self) -> &BTreeSet<ConnectionId> {
        &self.gated
    }

    pub fn self_connection(&self) -> Option<ConnectionId> {
        self.self_connection
    }

    pub fn is_self_connected(&self) -> bool {
        self.self_connection.is_some()
    }

    /// Neighbours this neuron extends traces through
    pub fn neighbours(&self) -> &BTreeSet<NeuronId> {
        &self.neighbours
    }

    /// Connections gated by this neuron into the given neighbour
    pub fn influences(&self, neighbour: NeuronId) -> Option<&BTreeSet<ConnectionId>> {
        self.influences.get(&neighbour)
    }

    pub fn eligibility(&self, connection: ConnectionId) -> Value {
        self.eligibility.get(&connection).copied().unwrap_or(0.0)
    }

    /// Neighbours with an extended trace row, in id order
    pub fn extended_neighbours(&self) -> impl Iterator<Item = NeuronId> + '_ {
        self.extended.keys().copied()
    }

    pub fn extended_trace(&self, neighbour: NeuronId, connection: ConnectionId) -> Value {
        self.extended
            .get(&neighbour)
            .and_then(|row| row.get(&connection))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn is_const(&self) -> bool {
        self.is_const
    }

    /// Output neurons project nothing and gate nothing; they take their
    /// error straight from the environment.
    pub fn is_output(&self) -> bool {
        self.outgoing.is_empty() && self.gated.is_empty()
    }
}

/// Arena owning every neuron and connection of one network
#[derive(Debug, Default)]
pub struct Graph {
    neurons: Vec<Neuron>,
    connections: Vec<Connection>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_neuron(&mut self) -> NeuronId {
        let id = NeuronId(self.neurons.len() as u64);
        self.neurons.push(Neuron::default());
        id
    }

    pub fn neuron(&self, id: NeuronId) -> &Neuron {
        &self.neurons[id.index()]
    }

    pub fn connection(&self, id: ConnectionId) -> &Connection {
        &self.connections[id.index()]
    }

    pub fn neuron_count(&self) -> usize {
        self.neurons.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Every connection in the arena, in id order
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter()
    }

    /// Mark a neuron as constant: it still feeds forward, but the emitter
    /// gives it no trace or train section.
    pub fn set_const(&mut self, id: NeuronId, is_const: bool) {
        self.neurons[id.index()].is_const = is_const;
    }

    pub fn find_outgoing_connection(&self, from: NeuronId, to: NeuronId) -> Option<ConnectionId> {
        self.neurons[from.index()]
            .outgoing
            .iter()
            .copied()
            .find(|c| self.connections[c.index()].output == to)
    }

    /// Connect `from` to `to`, reusing an existing connection if one is
    /// already in place. `from == to` uses the self-connection slot.
    pub fn connect(&mut self, from: NeuronId, to: NeuronId) -> ConnectionId {
        if from == to {
            if let Some(existing) = self.neurons[from.index()].self_connection {
                return existing;
            }
            let id = self.push_connection(from, to);
            self.neurons[from.index()].self_connection = Some(id);
            return id;
        }

        if let Some(existing) = self.find_outgoing_connection(from, to) {
            return existing;
        }

        let id = self.push_connection(from, to);
        {
            let source = &mut self.neurons[from.index()];
            source.outgoing.insert(id);
            source.neighbours.insert(to);
        }
        {
            let target = &mut self.neurons[to.index()];
            target.incoming.insert(id);
            target.eligibility.insert(id, 0.0);
            // trace keys stay closed under graph edits
            for row in target.extended.values_mut() {
                row.insert(id, 0.0);
            }
        }
        id
    }

    fn push_connection(&mut self, input: NeuronId, output: NeuronId) -> ConnectionId {
        let id = ConnectionId(self.connections.len() as u64);
        self.connections.push(Connection {
            id,
            input,
            output,
            gate: None,
        });
        id
    }

    /// Let `gater` multiplicatively scale `connection`. Re-gating detaches
    /// the previous gater first, so the containment invariant stays
    /// single-valued.
    pub fn gate(&mut self, gater: NeuronId, connection: ConnectionId) {
        let target = self.connections[connection.index()].output;

        if let Some(previous) = self.connections[connection.index()].gate {
            if previous == gater {
                return;
            }
            let old = &mut self.neurons[previous.index()];
            old.gated.remove(&connection);
            if let Some(influenced) = old.influences.get_mut(&target) {
                influenced.remove(&connection);
            }
        }

        let incoming: Vec<ConnectionId> = self.neurons[gater.index()]
            .incoming
            .iter()
            .copied()
            .collect();

        {
            let g = &mut self.neurons[gater.index()];
            g.gated.insert(connection);

            if !g.extended.contains_key(&target) {
                g.neighbours.insert(target);
                let row: BTreeMap<ConnectionId, Value> =
                    incoming.iter().map(|c| (*c, 0.0)).collect();
                g.extended.insert(target, row);
            }

            g.influences.entry(target).or_default().insert(connection);
        }

        self.connections[connection.index()].gate = Some(gater);
    }

    /// Overwrite an eligibility trace (used when restoring from a register file)
    pub fn set_eligibility(&mut self, id: NeuronId, connection: ConnectionId, value: Value) {
        self.neurons[id.index()].eligibility.insert(connection, value);
    }

    /// Overwrite an extended trace (used when restoring from a register file)
    pub fn set_extended_trace(
        &mut self,
        id: NeuronId,
        neighbour: NeuronId,
        connection: ConnectionId,
        value: Value,
    ) {
        self.neurons[id.index()]
            .extended
            .entry(neighbour)
            .or_default()
            .insert(connection, value);
    }

    // =========================================================================
    // Reference interpreter
    // =========================================================================

    /// Present an input sample to an input-layer neuron.
    pub fn feed_neuron(&self, ctx: &mut TrainingContext, id: NeuronId, value: Value) {
        let neuron = &self.neurons[id.index()];
        let is_input = neuron.incoming.is_empty() && !neuron.outgoing.is_empty();
        if is_input {
            let data = ctx.neuron_data(id);
            data.activation = value;
            data.derivative = 0.0;
        }
    }

    /// One forward step for a non-input neuron: state, activation,
    /// derivative, then the eligibility and extended traces, then the gains
    /// of every connection this neuron gates. Returns the activation.
    pub fn process_neuron(&mut self, ctx: &mut TrainingContext, id: NeuronId) -> Value {
        let neuron = &self.neurons[id.index()];
        let incoming: Vec<ConnectionId> = neuron.incoming.iter().copied().collect();
        let trace_neighbours: Vec<NeuronId> = neuron.extended.keys().copied().collect();
        let gated: Vec<ConnectionId> = neuron.gated.iter().copied().collect();
        let self_connection = neuron.self_connection;

        // eq. 15
        let bias;
        {
            let data = ctx.neuron_data(id);
            data.old_state = data.state;
            bias = data.bias;
        }
        let mut state = match self_connection {
            Some(sc) => {
                let (weight, gain) = {
                    let data = ctx.connection_data(sc);
                    (data.weight, data.gain)
                };
                gain * weight * ctx.neuron_data(id).old_state + bias
            }
            None => bias,
        };

        for &c in &incoming {
            let input = self.connections[c.index()].input;
            let (weight, gain) = {
                let data = ctx.connection_data(c);
                (data.weight, data.gain)
            };
            state += ctx.neuron_data(input).activation * weight * gain;
        }

        // eq. 16
        let activation = crate::activation(state);
        let derivative = crate::derivative(activation);
        {
            let data = ctx.neuron_data(id);
            data.state = state;
            data.activation = activation;
            data.derivative = derivative;
        }

        // influence of this unit on each gated neighbour, computed up front
        let mut influences: BTreeMap<NeuronId, Value> = BTreeMap::new();
        for &k in &trace_neighbours {
            let mut influence = 0.0;
            if let Some(ksc) = self.neurons[k.index()].self_connection {
                if self.connections[ksc.index()].gate == Some(id) {
                    influence = ctx.neuron_data(k).old_state;
                }
            }
            let gated_into_k: Vec<ConnectionId> = self.neurons[id.index()]
                .influences
                .get(&k)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();
            for c in gated_into_k {
                let input = self.connections[c.index()].input;
                let weight = ctx.connection_data(c).weight;
                influence += weight * ctx.neuron_data(input).activation;
            }
            influences.insert(k, influence);
        }

        let self_decay = self_connection.map(|sc| {
            let data = ctx.connection_data(sc);
            (data.weight, data.gain)
        });

        for &c in &incoming {
            let input = self.connections[c.index()].input;
            let gain = ctx.connection_data(c).gain;
            let input_activation = ctx.neuron_data(input).activation;

            // eq. 17
            let old_eligibility = self.neurons[id.index()].eligibility(c);
            let mut eligibility = gain * input_activation;
            if let Some((sw, sg)) = self_decay {
                eligibility += sg * sw * old_eligibility;
            }
            self.neurons[id.index()].eligibility.insert(c, eligibility);

            // eq. 18
            for &k in &trace_neighbours {
                let influence = influences[&k];
                let neighbour_decay = self.neurons[k.index()].self_connection.map(|ksc| {
                    let data = ctx.connection_data(ksc);
                    (data.weight, data.gain)
                });
                let slot = self.neurons[id.index()]
                    .extended
                    .entry(k)
                    .or_default()
                    .entry(c)
                    .or_insert(0.0);
                let old_trace = *slot;
                let mut trace = derivative * eligibility * influence;
                if let Some((kw, kg)) = neighbour_decay {
                    trace += kg * kw * old_trace;
                }
                *slot = trace;
            }
        }

        // gated connections pick up this unit's fresh activation as gain
        for c in gated {
            ctx.connection_data(c).gain = activation;
        }

        activation
    }

    /// Error injection for an output neuron, followed by a weight update.
    pub fn train_neuron(&mut self, ctx: &mut TrainingContext, rate: Value, id: NeuronId, target: Value) {
        if !self.neurons[id.index()].is_output() {
            return;
        }
        {
            let data = ctx.neuron_data(id);
            let responsibility = target - data.activation;
            data.error_responsibility = responsibility;
            data.projected_activity = responsibility;
        }
        self.learn(ctx, rate, id);
    }

    /// Backpropagated error responsibility for a hidden neuron (Eq. 21-23),
    /// followed by a weight update.
    pub fn back_propagate_neuron(&mut self, ctx: &mut TrainingContext, rate: Value, id: NeuronId) {
        if self.neurons[id.index()].is_output() {
            return;
        }

        let outgoing: Vec<ConnectionId> = self.neurons[id.index()].outgoing.iter().copied().collect();
        let trace_neighbours: Vec<NeuronId> =
            self.neurons[id.index()].extended.keys().copied().collect();

        // eq. 21: error arriving through projected connections
        let mut accumulator = 0.0;
        for c in &outgoing {
            let output = self.connections[c.index()].output;
            let (weight, gain) = {
                let data = ctx.connection_data(*c);
                (data.weight, data.gain)
            };
            accumulator += ctx.neuron_data(output).error_responsibility * gain * weight;
        }
        let derivative = ctx.neuron_data(id).derivative;
        let projected = derivative * accumulator;

        // eq. 22: error arriving through gated neighbours
        accumulator = 0.0;
        for &k in &trace_neighbours {
            let mut influence = 0.0;
            if let Some(ksc) = self.neurons[k.index()].self_connection {
                if self.connections[ksc.index()].gate == Some(id) {
                    influence = ctx.neuron_data(k).old_state;
                }
            }
            let gated_into_k: Vec<ConnectionId> = self.neurons[id.index()]
                .influences
                .get(&k)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();
            for c in gated_into_k {
                let input = self.connections[c.index()].input;
                let weight = ctx.connection_data(c).weight;
                influence += weight * ctx.neuron_data(input).activation;
            }
            accumulator += ctx.neuron_data(k).error_responsibility * influence;
        }
        let gating = derivative * accumulator;

        // eq. 23
        {
            let data = ctx.neuron_data(id);
            data.projected_activity = projected;
            data.gating_activity = gating;
            data.error_responsibility = projected + gating;
        }

        self.learn(ctx, rate, id);
    }

    /// Eq. 24: per-connection gradient from the eligibility and extended
    /// traces, clipped, then applied. Bias follows the raw responsibility.
    fn learn(&mut self, ctx: &mut TrainingContext, rate: Value, id: NeuronId) {
        let incoming: Vec<ConnectionId> = self.neurons[id.index()].incoming.iter().copied().collect();
        let trace_neighbours: Vec<NeuronId> =
            self.neurons[id.index()].extended.keys().copied().collect();
        let projected = ctx.neuron_data(id).projected_activity;

        for c in incoming {
            let mut gradient = projected * self.neurons[id.index()].eligibility(c);
            for &k in &trace_neighbours {
                let responsibility = ctx.neuron_data(k).error_responsibility;
                gradient += responsibility * self.neurons[id.index()].extended_trace(k, c);
            }
            let gradient = gradient.clamp(-GRADIENT_CLIP, GRADIENT_CLIP);
            ctx.connection_data(c).weight += rate * gradient;
        }

        let responsibility = ctx.neuron_data(id).error_responsibility;
        ctx.neuron_data(id).bias += rate * responsibility;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_is_idempotent() {
        let mut graph = Graph::new();
        let a = graph.add_neuron();
        let b = graph.add_neuron();

        let first = graph.connect(a, b);
        let second = graph.connect(a, b);
        assert_eq!(first, second);
        assert_eq!(graph.connection_count(), 1);
    }

    #[test]
    fn test_self_connection_slot() {
        let mut graph = Graph::new();
        let a = graph.add_neuron();

        let first = graph.connect(a, a);
        let second = graph.connect(a, a);
        assert_eq!(first, second);
        assert_eq!(graph.neuron(a).self_connection(), Some(first));
        assert!(graph.neuron(a).outgoing_connections().is_empty());
        assert!(graph.neuron(a).incoming_connections().is_empty());
    }

    #[test]
    fn test_connect_containment() {
        let mut graph = Graph::new();
        let a = graph.add_neuron();
        let b = graph.add_neuron();

        let c = graph.connect(a, b);
        assert!(graph.neuron(a).outgoing_connections().contains(&c));
        assert!(graph.neuron(b).incoming_connections().contains(&c));
        assert!(graph.neuron(a).neighbours().contains(&b));
        assert_eq!(graph.neuron(b).eligibility(c), 0.0);
    }

    #[test]
    fn test_gate_populates_traces() {
        let mut graph = Graph::new();
        let x = graph.add_neuron();
        let y = graph.add_neuron();
        let g = graph.add_neuron();
        let feeder = graph.add_neuron();

        let into_gater = graph.connect(feeder, g);
        let gated = graph.connect(x, y);
        graph.gate(g, gated);

        assert!(graph.neuron(g).gated_connections().contains(&gated));
        assert_eq!(graph.connection(gated).gate_neuron(), Some(g));
        assert!(graph.neuron(g).neighbours().contains(&y));
        assert_eq!(graph.neuron(g).extended_trace(y, into_gater), 0.0);
        assert!(graph.neuron(g).influences(y).unwrap().contains(&gated));
    }

    #[test]
    fn test_regate_replaces_gater() {
        let mut graph = Graph::new();
        let x = graph.add_neuron();
        let y = graph.add_neuron();
        let g1 = graph.add_neuron();
        let g2 = graph.add_neuron();

        let conn = graph.connect(x, y);
        graph.gate(g1, conn);
        graph.gate(g2, conn);

        assert_eq!(graph.connection(conn).gate_neuron(), Some(g2));
        assert!(!graph.neuron(g1).gated_connections().contains(&conn));
        assert!(graph.neuron(g2).gated_connections().contains(&conn));
    }

    #[test]
    fn test_late_connection_extends_trace_rows() {
        let mut graph = Graph::new();
        let x = graph.add_neuron();
        let y = graph.add_neuron();
        let g = graph.add_neuron();
        let late = graph.add_neuron();

        let gated = graph.connect(x, y);
        graph.gate(g, gated);
        // a connection added after gating must appear in the gater's rows
        let new_conn = graph.connect(late, g);
        assert_eq!(graph.neuron(g).extended_trace(y, new_conn), 0.0);
        assert_eq!(graph.neuron(g).eligibility(new_conn), 0.0);
    }

    #[test]
    fn test_process_plain_neuron_is_sigmoid_of_weighted_sum() {
        let mut graph = Graph::new();
        let mut ctx = TrainingContext::new("test");
        let a = graph.add_neuron();
        let b = graph.add_neuron();
        let c = graph.connect(a, b);

        ctx.neuron_data(a).activation = 0.5;
        ctx.connection_data(c).weight = 2.0;
        ctx.neuron_data(b).bias = 0.25;

        let activation = graph.process_neuron(&mut ctx, b);
        let expected = crate::activation(0.25 + 0.5 * 2.0);
        assert!((activation - expected).abs() < 1e-12);
        assert_eq!(ctx.neuron_data(b).activation, activation);
        // eligibility of the incoming connection is the input activation
        assert!((graph.neuron(b).eligibility(c) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_gated_gain_follows_gater_activation() {
        let mut graph = Graph::new();
        let mut ctx = TrainingContext::new("test");
        let x = graph.add_neuron();
        let y = graph.add_neuron();
        let g = graph.add_neuron();
        let feeder = graph.add_neuron();

        graph.connect(feeder, g);
        let gated = graph.connect(x, y);
        graph.gate(g, gated);

        ctx.neuron_data(feeder).activation = 1.0;
        let gater_activation = graph.process_neuron(&mut ctx, g);
        assert_eq!(ctx.connection_data(gated).gain, gater_activation);
    }

    #[test]
    fn test_output_neuron_trains_toward_target() {
        let mut graph = Graph::new();
        let mut ctx = TrainingContext::new("test");
        let a = graph.add_neuron();
        let b = graph.add_neuron();
        let c = graph.connect(a, b);

        ctx.neuron_data(a).activation = 1.0;
        graph.process_neuron(&mut ctx, b);

        let before = ctx.connection_data(c).weight;
        let activation = ctx.neuron_data(b).activation;
        graph.train_neuron(&mut ctx, 0.5, b, 1.0);

        let responsibility = 1.0 - activation;
        let expected = before + 0.5 * responsibility * 1.0; // elig == input activation
        assert!((ctx.connection_data(c).weight - expected).abs() < 1e-12);
    }
}
