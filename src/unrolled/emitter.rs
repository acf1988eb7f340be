//! UnrolledNeuron - per-neuron bytecode emission
//!
//! Walks one neuron's connections exactly the way the reference interpreter
//! does, but instead of computing anything it allocates registers through
//! the [`UnrolledTrainingContext`] and appends opcodes. Three chunks come
//! out:
//!
//! - `feed`: state update, activation, derivative, gated-gain refresh
//! - `trace`: influence, eligibility and extended-trace updates
//! - `train`: error responsibility and the SGD weight/bias updates
//!
//! Every register is seeded with the graph's current parameter value at
//! allocation time, so the compiled program picks up exactly where the graph
//! model stands. The emitter always selects the narrowest fused opcode that
//! covers an expression (APS over A+AAP, APPSPP over AP+AAP+AAP, and so on).

use super::context::{Tag, UnrolledTrainingContext, VariableKey};
use super::opcode::Opcode;
use super::program::VmProgram;
use crate::graph::{ConnectionId, Graph, NeuronId, TrainingContext};
use crate::RegisterIndex;

/// Compiled chunks for a single neuron
#[derive(Debug, Default)]
pub struct UnrolledNeuron {
    feed: VmProgram,
    trace: VmProgram,
    train: VmProgram,
}

impl UnrolledNeuron {
    pub fn feed_chunk(&self) -> &VmProgram {
        &self.feed
    }

    pub fn trace_chunk(&self) -> &VmProgram {
        &self.trace
    }

    pub fn train_chunk(&self) -> &VmProgram {
        &self.train
    }

    /// Emit the three chunks for `target`.
    ///
    /// `as_input` neurons only claim their activation register; `as_output`
    /// neurons additionally claim a target register and register themselves
    /// with the output mapping; `as_const` neurons feed forward but carry no
    /// trace or train section.
    pub fn build(
        uctx: &mut UnrolledTrainingContext,
        graph: &Graph,
        ctx: &mut TrainingContext,
        target: NeuronId,
        as_input: bool,
        as_output: bool,
        as_const: bool,
    ) -> Self {
        let mut unrolled = UnrolledNeuron::default();

        let rate_var = uctx.allocate_or_reuse(0.0, &VariableKey::rate());
        uctx.register_rate_variable(rate_var);

        let target_data = *ctx.neuron_data(target);
        let activation_var = uctx.allocate_or_reuse(
            target_data.activation,
            &VariableKey::neuron(target, Tag::Activation),
        );
        let derivative_var = uctx.allocate_or_reuse(
            target_data.derivative,
            &VariableKey::neuron(target, Tag::Derivative),
        );

        if as_input {
            uctx.register_input_variable(activation_var);
            return unrolled;
        }

        let bias_var =
            uctx.allocate_or_reuse(target_data.bias, &VariableKey::neuron(target, Tag::Bias));
        let state_var =
            uctx.allocate_or_reuse(target_data.state, &VariableKey::neuron(target, Tag::State));
        let old_state_var = uctx.allocate_or_reuse(
            target_data.old_state,
            &VariableKey::neuron(target, Tag::OldState),
        );

        let self_connection = graph.neuron(target).self_connection();
        let self_vars = self_connection.map(|sc| Self::connection_vars(uctx, graph, ctx, sc));

        unrolled.feed.op(Opcode::A).arg(old_state_var).arg(state_var);

        // eq. 15
        match self_vars {
            Some((self_weight_var, Some(self_gain_var))) => {
                unrolled
                    .feed
                    .op(Opcode::APPS)
                    .arg(state_var)
                    .arg(self_gain_var)
                    .arg(self_weight_var)
                    .arg(state_var)
                    .arg(bias_var);
            }
            Some((self_weight_var, None)) => {
                unrolled
                    .feed
                    .op(Opcode::APS)
                    .arg(state_var)
                    .arg(self_weight_var)
                    .arg(state_var)
                    .arg(bias_var);
            }
            None => {
                unrolled.feed.op(Opcode::A).arg(state_var).arg(bias_var);
            }
        }

        let incoming: Vec<ConnectionId> = graph
            .neuron(target)
            .incoming_connections()
            .iter()
            .copied()
            .collect();

        for &c in &incoming {
            let input_neuron = graph.connection(c).input_neuron();
            let input_activation_var = uctx.allocate_or_reuse(
                ctx.neuron_data(input_neuron).activation,
                &VariableKey::neuron(input_neuron, Tag::Activation),
            );
            let (input_weight_var, input_gain_var) = Self::connection_vars(uctx, graph, ctx, c);

            match input_gain_var {
                Some(gain_var) => {
                    unrolled
                        .feed
                        .op(Opcode::AAPP)
                        .arg(state_var)
                        .arg(input_activation_var)
                        .arg(input_weight_var)
                        .arg(gain_var);
                }
                None => {
                    unrolled
                        .feed
                        .op(Opcode::AAP)
                        .arg(state_var)
                        .arg(input_activation_var)
                        .arg(input_weight_var);
                }
            }
        }

        // eq. 16 and f'(s)
        unrolled
            .feed
            .op(Opcode::ACTIVATION)
            .arg(activation_var)
            .arg(state_var);
        unrolled
            .feed
            .op(Opcode::DERIVATIVE)
            .arg(derivative_var)
            .arg(activation_var);

        let trace_neighbours: Vec<NeuronId> = graph.neuron(target).extended_neighbours().collect();

        if !as_const {
            // influence of this unit on each gated neighbour, ahead of the traces
            for &k in &trace_neighbours {
                let influence_var =
                    uctx.allocate_or_reuse(0.0, &VariableKey::neuron(k, Tag::Influence));
                let neighbour_old_state_var = uctx.allocate_or_reuse(
                    ctx.neuron_data(k).old_state,
                    &VariableKey::neuron(k, Tag::OldState),
                );

                let self_gated_by_target = Self::self_gated_by(graph, k, target);
                let gated_into_k: Vec<ConnectionId> = graph
                    .neuron(target)
                    .influences(k)
                    .map(|set| set.iter().copied().collect())
                    .unwrap_or_default();

                let mut initialized = self_gated_by_target;
                if self_gated_by_target {
                    unrolled
                        .trace
                        .op(Opcode::A)
                        .arg(influence_var)
                        .arg(neighbour_old_state_var);
                } else if gated_into_k.is_empty() {
                    unrolled.trace.op(Opcode::ZERO).arg(influence_var);
                    initialized = true;
                }

                for c in gated_into_k {
                    let input_neuron = graph.connection(c).input_neuron();
                    let weight_var = uctx.allocate_or_reuse(
                        ctx.connection_data(c).weight,
                        &VariableKey::connection(c, Tag::Weight),
                    );
                    let activation_var = uctx.allocate_or_reuse(
                        ctx.neuron_data(input_neuron).activation,
                        &VariableKey::neuron(input_neuron, Tag::Activation),
                    );
                    let op = if initialized { Opcode::AAP } else { Opcode::AP };
                    unrolled
                        .trace
                        .op(op)
                        .arg(influence_var)
                        .arg(weight_var)
                        .arg(activation_var);
                    initialized = true;
                }
            }

            for &c in &incoming {
                let input_neuron = graph.connection(c).input_neuron();
                let (_, input_gain_var) = Self::connection_vars(uctx, graph, ctx, c);
                let input_activation_var = uctx.allocate_or_reuse(
                    ctx.neuron_data(input_neuron).activation,
                    &VariableKey::neuron(input_neuron, Tag::Activation),
                );
                let eligibility_var = uctx.allocate_or_reuse(
                    graph.neuron(target).eligibility(c),
                    &VariableKey::eligibility(target, c),
                );

                // eq. 17
                match (self_vars, input_gain_var) {
                    (Some((sw, Some(sg))), Some(ig)) => {
                        unrolled
                            .trace
                            .op(Opcode::APPSP)
                            .arg(eligibility_var)
                            .arg(sg)
                            .arg(sw)
                            .arg(eligibility_var)
                            .arg(ig)
                            .arg(input_activation_var);
                    }
                    (Some((sw, Some(sg))), None) => {
                        unrolled
                            .trace
                            .op(Opcode::APPS)
                            .arg(eligibility_var)
                            .arg(sg)
                            .arg(sw)
                            .arg(eligibility_var)
                            .arg(input_activation_var);
                    }
                    (Some((sw, None)), Some(ig)) => {
                        unrolled
                            .trace
                            .op(Opcode::APSP)
                            .arg(eligibility_var)
                            .arg(sw)
                            .arg(eligibility_var)
                            .arg(ig)
                            .arg(input_activation_var);
                    }
                    (Some((sw, None)), None) => {
                        unrolled
                            .trace
                            .op(Opcode::APS)
                            .arg(eligibility_var)
                            .arg(sw)
                            .arg(eligibility_var)
                            .arg(input_activation_var);
                    }
                    (None, Some(ig)) => {
                        unrolled
                            .trace
                            .op(Opcode::AP)
                            .arg(eligibility_var)
                            .arg(ig)
                            .arg(input_activation_var);
                    }
                    (None, None) => {
                        unrolled
                            .trace
                            .op(Opcode::A)
                            .arg(eligibility_var)
                            .arg(input_activation_var);
                    }
                }

                // eq. 18: the trace through neighbour k decays through k's
                // own self-connection
                for &k in &trace_neighbours {
                    let influence_var =
                        uctx.allocate_or_reuse(0.0, &VariableKey::neuron(k, Tag::Influence));
                    let extended_trace_var = uctx.allocate_or_reuse(
                        graph.neuron(target).extended_trace(k, c),
                        &VariableKey::extended_trace(target, k, c),
                    );

                    match graph.neuron(k).self_connection() {
                        Some(ksc) => {
                            let (k_weight_var, k_gain_var) =
                                Self::connection_vars(uctx, graph, ctx, ksc);
                            match k_gain_var {
                                Some(kg) => {
                                    unrolled
                                        .trace
                                        .op(Opcode::APPSPP)
                                        .arg(extended_trace_var)
                                        .arg(kg)
                                        .arg(k_weight_var)
                                        .arg(extended_trace_var)
                                        .arg(derivative_var)
                                        .arg(eligibility_var)
                                        .arg(influence_var);
                                }
                                None => {
                                    unrolled
                                        .trace
                                        .op(Opcode::APPSP)
                                        .arg(extended_trace_var)
                                        .arg(derivative_var)
                                        .arg(eligibility_var)
                                        .arg(influence_var)
                                        .arg(k_weight_var)
                                        .arg(extended_trace_var);
                                }
                            }
                        }
                        None => {
                            unrolled
                                .trace
                                .op(Opcode::APP)
                                .arg(extended_trace_var)
                                .arg(derivative_var)
                                .arg(eligibility_var)
                                .arg(influence_var);
                        }
                    }
                }
            }
        }

        // gated connections pick up this unit's fresh activation as gain
        let gated: Vec<ConnectionId> = graph
            .neuron(target)
            .gated_connections()
            .iter()
            .copied()
            .collect();
        for c in gated {
            let gain_var = uctx.allocate_or_reuse(
                ctx.connection_data(c).gain,
                &VariableKey::connection(c, Tag::Gain),
            );
            unrolled.feed.op(Opcode::A).arg(gain_var).arg(activation_var);
        }

        // The training program:

        if as_output && as_const {
            uctx.register_output_variable(activation_var);
        }

        if !as_const {
            Self::build_train(
                uctx,
                graph,
                ctx,
                target,
                as_output,
                rate_var,
                activation_var,
                derivative_var,
                bias_var,
                &incoming,
                &trace_neighbours,
                &mut unrolled.train,
            );
        }

        unrolled
    }

    #[allow(clippy::too_many_arguments)]
    fn build_train(
        uctx: &mut UnrolledTrainingContext,
        graph: &Graph,
        ctx: &mut TrainingContext,
        target: NeuronId,
        as_output: bool,
        rate_var: RegisterIndex,
        activation_var: RegisterIndex,
        derivative_var: RegisterIndex,
        bias_var: RegisterIndex,
        incoming: &[ConnectionId],
        trace_neighbours: &[NeuronId],
        train: &mut VmProgram,
    ) {
        let responsibility_var = uctx.allocate_or_reuse(
            ctx.neuron_data(target).error_responsibility,
            &VariableKey::neuron(target, Tag::ErrorResponsibility),
        );

        let no_outgoing = graph.neuron(target).outgoing_connections().is_empty();
        let no_gates = graph.neuron(target).gated_connections().is_empty();

        if as_output {
            let target_var =
                uctx.allocate_or_reuse(0.0, &VariableKey::neuron(target, Tag::Target));
            uctx.register_target_variable(target_var);
            uctx.register_output_variable(activation_var);

            train
                .op(Opcode::AD)
                .arg(responsibility_var)
                .arg(target_var)
                .arg(activation_var);

            for &c in incoming {
                let eligibility_var = uctx.allocate_or_reuse(
                    graph.neuron(target).eligibility(c),
                    &VariableKey::eligibility(target, c),
                );
                let weight_var = uctx.allocate_or_reuse(
                    ctx.connection_data(c).weight,
                    &VariableKey::connection(c, Tag::Weight),
                );
                let gradient_var =
                    uctx.allocate_or_reuse(0.0, &VariableKey::scratch(Tag::Gradient));

                train
                    .op(Opcode::AP)
                    .arg(gradient_var)
                    .arg(responsibility_var)
                    .arg(eligibility_var);
                train.op(Opcode::CLIP).arg(gradient_var);
                train
                    .op(Opcode::AAP)
                    .arg(weight_var)
                    .arg(rate_var)
                    .arg(gradient_var);
            }
        } else if !no_outgoing && !no_gates {
            let accumulator_var =
                uctx.allocate_or_reuse(0.0, &VariableKey::scratch(Tag::ErrorAccumulator));

            Self::emit_projected_error(uctx, graph, ctx, target, accumulator_var, train);

            let projected_var = uctx.allocate_or_reuse(
                ctx.neuron_data(target).projected_activity,
                &VariableKey::neuron(target, Tag::ProjectedActivity),
            );
            train
                .op(Opcode::AP)
                .arg(projected_var)
                .arg(derivative_var)
                .arg(accumulator_var);
            train.op(Opcode::ZERO).arg(accumulator_var);

            Self::emit_gated_error(uctx, graph, ctx, target, trace_neighbours, accumulator_var, train);

            let gated_error_var = uctx.allocate_or_reuse(
                ctx.neuron_data(target).gating_activity,
                &VariableKey::neuron(target, Tag::GatingActivity),
            );
            train
                .op(Opcode::AP)
                .arg(gated_error_var)
                .arg(derivative_var)
                .arg(accumulator_var);

            // eq. 23
            train
                .op(Opcode::AS)
                .arg(responsibility_var)
                .arg(projected_var)
                .arg(gated_error_var);

            for &c in incoming {
                let gradient_var =
                    uctx.allocate_or_reuse(0.0, &VariableKey::scratch(Tag::Gradient));
                let eligibility_var = uctx.allocate_or_reuse(
                    graph.neuron(target).eligibility(c),
                    &VariableKey::eligibility(target, c),
                );

                // eq. 24
                train
                    .op(Opcode::AP)
                    .arg(gradient_var)
                    .arg(projected_var)
                    .arg(eligibility_var);
                Self::emit_trace_gradient(uctx, graph, ctx, target, c, trace_neighbours, gradient_var, train);
                Self::emit_weight_update(uctx, ctx, c, rate_var, gradient_var, train);
            }
        } else if no_gates {
            train.op(Opcode::ZERO).arg(responsibility_var);

            Self::emit_projected_error(uctx, graph, ctx, target, responsibility_var, train);

            train
                .op(Opcode::AP)
                .arg(responsibility_var)
                .arg(responsibility_var)
                .arg(derivative_var);

            for &c in incoming {
                let eligibility_var = uctx.allocate_or_reuse(
                    graph.neuron(target).eligibility(c),
                    &VariableKey::eligibility(target, c),
                );
                let gradient_var =
                    uctx.allocate_or_reuse(0.0, &VariableKey::scratch(Tag::Gradient));
                train
                    .op(Opcode::AP)
                    .arg(gradient_var)
                    .arg(responsibility_var)
                    .arg(eligibility_var);
                Self::emit_weight_update(uctx, ctx, c, rate_var, gradient_var, train);
            }
        } else {
            train.op(Opcode::ZERO).arg(responsibility_var);

            Self::emit_gated_error(uctx, graph, ctx, target, trace_neighbours, responsibility_var, train);

            train
                .op(Opcode::AP)
                .arg(responsibility_var)
                .arg(responsibility_var)
                .arg(derivative_var);

            for &c in incoming {
                let gradient_var =
                    uctx.allocate_or_reuse(0.0, &VariableKey::scratch(Tag::Gradient));
                train.op(Opcode::ZERO).arg(gradient_var);
                Self::emit_trace_gradient(uctx, graph, ctx, target, c, trace_neighbours, gradient_var, train);
                Self::emit_weight_update(uctx, ctx, c, rate_var, gradient_var, train);
            }
        }

        // adjust bias
        train
            .op(Opcode::AAP)
            .arg(bias_var)
            .arg(rate_var)
            .arg(responsibility_var);
    }

    /// Eq. 21: accumulate responsibility arriving through projected connections
    fn emit_projected_error(
        uctx: &mut UnrolledTrainingContext,
        graph: &Graph,
        ctx: &mut TrainingContext,
        target: NeuronId,
        accumulator_var: RegisterIndex,
        train: &mut VmProgram,
    ) {
        let outgoing: Vec<ConnectionId> = graph
            .neuron(target)
            .outgoing_connections()
            .iter()
            .copied()
            .collect();
        for c in outgoing {
            let output_neuron = graph.connection(c).output_neuron();
            let (weight_var, gain_var) = Self::connection_vars(uctx, graph, ctx, c);
            let output_responsibility_var = uctx.allocate_or_reuse(
                ctx.neuron_data(output_neuron).error_responsibility,
                &VariableKey::neuron(output_neuron, Tag::ErrorResponsibility),
            );

            match gain_var {
                Some(gain_var) => {
                    train
                        .op(Opcode::AAPP)
                        .arg(accumulator_var)
                        .arg(output_responsibility_var)
                        .arg(gain_var)
                        .arg(weight_var);
                }
                None => {
                    train
                        .op(Opcode::AAP)
                        .arg(accumulator_var)
                        .arg(output_responsibility_var)
                        .arg(weight_var);
                }
            }
        }
    }

    /// Eq. 22: accumulate responsibility arriving through gated neighbours
    fn emit_gated_error(
        uctx: &mut UnrolledTrainingContext,
        graph: &Graph,
        ctx: &mut TrainingContext,
        target: NeuronId,
        trace_neighbours: &[NeuronId],
        accumulator_var: RegisterIndex,
        train: &mut VmProgram,
    ) {
        for &k in trace_neighbours {
            let influence_var =
                uctx.allocate_or_reuse(0.0, &VariableKey::scratch(Tag::Influence));
            let old_state_var = uctx.allocate_or_reuse(
                ctx.neuron_data(k).old_state,
                &VariableKey::neuron(k, Tag::OldState),
            );

            if Self::self_gated_by(graph, k, target) {
                train.op(Opcode::A).arg(influence_var).arg(old_state_var);
            } else {
                train.op(Opcode::ZERO).arg(influence_var);
            }

            let gated_into_k: Vec<ConnectionId> = graph
                .neuron(target)
                .influences(k)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();
            for c in gated_into_k {
                let input_neuron = graph.connection(c).input_neuron();
                let weight_var = uctx.allocate_or_reuse(
                    ctx.connection_data(c).weight,
                    &VariableKey::connection(c, Tag::Weight),
                );
                let activation_var = uctx.allocate_or_reuse(
                    ctx.neuron_data(input_neuron).activation,
                    &VariableKey::neuron(input_neuron, Tag::Activation),
                );
                train
                    .op(Opcode::AAP)
                    .arg(influence_var)
                    .arg(weight_var)
                    .arg(activation_var);
            }

            let gated_responsibility_var = uctx.allocate_or_reuse(
                ctx.neuron_data(k).error_responsibility,
                &VariableKey::neuron(k, Tag::ErrorResponsibility),
            );
            train
                .op(Opcode::AAP)
                .arg(accumulator_var)
                .arg(gated_responsibility_var)
                .arg(influence_var);
        }
    }

    /// Eq. 24, trace half: gradient += Σ_k responsibility(k) · xtrace[k][c]
    #[allow(clippy::too_many_arguments)]
    fn emit_trace_gradient(
        uctx: &mut UnrolledTrainingContext,
        graph: &Graph,
        ctx: &mut TrainingContext,
        target: NeuronId,
        connection: ConnectionId,
        trace_neighbours: &[NeuronId],
        gradient_var: RegisterIndex,
        train: &mut VmProgram,
    ) {
        for &k in trace_neighbours {
            let responsibility_var = uctx.allocate_or_reuse(
                ctx.neuron_data(k).error_responsibility,
                &VariableKey::neuron(k, Tag::ErrorResponsibility),
            );
            let extended_trace_var = uctx.allocate_or_reuse(
                graph.neuron(target).extended_trace(k, connection),
                &VariableKey::extended_trace(target, k, connection),
            );
            train
                .op(Opcode::AAP)
                .arg(gradient_var)
                .arg(responsibility_var)
                .arg(extended_trace_var);
        }
    }

    /// Clip the gradient, then apply it
    fn emit_weight_update(
        uctx: &mut UnrolledTrainingContext,
        ctx: &mut TrainingContext,
        connection: ConnectionId,
        rate_var: RegisterIndex,
        gradient_var: RegisterIndex,
        train: &mut VmProgram,
    ) {
        let weight_var = uctx.allocate_or_reuse(
            ctx.connection_data(connection).weight,
            &VariableKey::connection(connection, Tag::Weight),
        );
        train.op(Opcode::CLIP).arg(gradient_var);
        train
            .op(Opcode::AAP)
            .arg(weight_var)
            .arg(rate_var)
            .arg(gradient_var);
    }

    /// Weight register plus gain register (gated connections only)
    fn connection_vars(
        uctx: &mut UnrolledTrainingContext,
        graph: &Graph,
        ctx: &mut TrainingContext,
        connection: ConnectionId,
    ) -> (RegisterIndex, Option<RegisterIndex>) {
        let data = *ctx.connection_data(connection);
        let weight_var =
            uctx.allocate_or_reuse(data.weight, &VariableKey::connection(connection, Tag::Weight));
        let gain_var = graph.connection(connection).has_gate().then(|| {
            uctx.allocate_or_reuse(data.gain, &VariableKey::connection(connection, Tag::Gain))
        });
        (weight_var, gain_var)
    }

    fn self_gated_by(graph: &Graph, neuron: NeuronId, gater: NeuronId) -> bool {
        graph
            .neuron(neuron)
            .self_connection()
            .map(|sc| graph.connection(sc).gate_neuron() == Some(gater))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Layer;

    fn arity_sum(program: &VmProgram) -> usize {
        program.commands.iter().map(|&c| Opcode(c).arity()).sum()
    }

    #[test]
    fn test_input_neuron_emits_nothing() {
        let mut graph = Graph::new();
        let mut ctx = TrainingContext::new("test");
        let mut uctx = UnrolledTrainingContext::new();
        let input = Layer::new(&mut graph, 1);
        let output = Layer::new(&mut graph, 1);
        input.connect_all_to_all(&mut graph, &output);

        let unrolled = UnrolledNeuron::build(
            &mut uctx,
            &graph,
            &mut ctx,
            input.neurons()[0],
            true,
            false,
            false,
        );
        assert!(unrolled.feed_chunk().is_empty());
        assert!(unrolled.trace_chunk().is_empty());
        assert!(unrolled.train_chunk().is_empty());
        assert_eq!(uctx.input_variables().len(), 1);
    }

    #[test]
    fn test_const_neuron_has_no_train_section() {
        let mut graph = Graph::new();
        let mut ctx = TrainingContext::new("test");
        let mut uctx = UnrolledTrainingContext::new();
        let input = Layer::new(&mut graph, 1);
        let output = Layer::new(&mut graph, 1);
        input.connect_all_to_all(&mut graph, &output);

        let unrolled = UnrolledNeuron::build(
            &mut uctx,
            &graph,
            &mut ctx,
            output.neurons()[0],
            false,
            true,
            true,
        );
        assert!(!unrolled.feed_chunk().is_empty());
        assert!(unrolled.trace_chunk().is_empty());
        assert!(unrolled.train_chunk().is_empty());
        // still visible as an output
        assert_eq!(uctx.output_variables().len(), 1);
    }

    #[test]
    fn test_chunks_are_arity_consistent() {
        let mut network = crate::graph::Network::lstm("lstm", 2, &[3], 1);
        let unrolled = network.to_unrolled();
        let context = unrolled.context();

        for kernel in [unrolled.feed_kernel(), unrolled.train_kernel()] {
            let total: usize = kernel
                .commands
                .iter()
                .take_while(|&&c| Opcode(c) != Opcode::END)
                .map(|&c| Opcode(c).arity())
                .sum();
            assert_eq!(total, kernel.indices.len());
            for &index in &kernel.indices {
                assert!((index as usize) < context.memory().len());
            }
        }
    }

    #[test]
    fn test_register_file_seeded_from_graph() {
        let mut graph = Graph::new();
        let mut ctx = TrainingContext::new("test");
        let mut uctx = UnrolledTrainingContext::new();
        let input = Layer::new(&mut graph, 1);
        let output = Layer::new(&mut graph, 1);
        let connections = input.connect_all_to_all(&mut graph, &output);
        let c = *connections.iter().next().unwrap();

        ctx.connection_data(c).weight = 0.625;
        ctx.neuron_data(output.neurons()[0]).bias = -0.375;

        for (&id, as_input) in input
            .neurons()
            .iter()
            .chain(output.neurons())
            .zip([true, false])
        {
            UnrolledNeuron::build(&mut uctx, &graph, &mut ctx, id, as_input, !as_input, false);
        }

        assert_eq!(
            uctx.evaluate(&VariableKey::connection(c, Tag::Weight), 0.0),
            0.625
        );
        assert_eq!(
            uctx.evaluate(
                &VariableKey::neuron(output.neurons()[0], Tag::Bias),
                0.0
            ),
            -0.375
        );
    }

    #[test]
    fn test_trace_arity_matches_indices() {
        let mut network = crate::graph::Network::lstm("lstm", 2, &[2], 1);
        let mut uctx = UnrolledTrainingContext::new();
        let graph_neurons: Vec<NeuronId> = network.hidden_layers()[2].neurons().to_vec();

        // memory cells carry self-connections and gated incoming connections,
        // so their chunks exercise the widest fused opcodes
        for id in graph_neurons {
            let (graph, ctx) = network.graph_and_context_mut();
            let unrolled = UnrolledNeuron::build(&mut uctx, graph, ctx, id, false, false, false);
            for chunk in [unrolled.feed_chunk(), unrolled.trace_chunk(), unrolled.train_chunk()] {
                assert_eq!(arity_sum(chunk), chunk.indices.len());
            }
        }
    }
}
