//! UnrolledNetwork - bytecode container and run surface
//!
//! Holds the two kernels compiled out of per-neuron chunks:
//!
//! - feed kernel: feed+trace chunks, layers in forward order
//! - train kernel: train chunks, layers and neurons in reverse order
//!
//! Running is just copying values into the role registers and handing the
//! streams to [`vm_process`]. After unrolling, the graph model this network
//! came from may be dropped; the register file carries all state.

use super::context::UnrolledTrainingContext;
use super::emitter::UnrolledNeuron;
use super::opcode::Opcode;
use super::vm::vm_process;
use crate::error::{Result, TracenetError};
use crate::{RegisterIndex, Value};
use log::debug;

/// One executable (commands, indices) pair, END-terminated
#[derive(Debug, Clone, Default)]
pub struct Kernel {
    pub commands: Vec<u8>,
    pub indices: Vec<RegisterIndex>,
}

impl Kernel {
    /// Every operand must address the register file; deserialized kernels
    /// are checked with this before first use.
    pub fn check_bounds(&self, memory_size: usize) -> Result<()> {
        for &index in &self.indices {
            if index as usize >= memory_size {
                return Err(TracenetError::RegisterOutOfRange {
                    register: index,
                    memory_size,
                });
            }
        }
        Ok(())
    }
}

/// A compiled network: register file plus feed/train kernels
#[derive(Debug)]
pub struct UnrolledNetwork {
    context: UnrolledTrainingContext,
    feed_kernel: Kernel,
    train_kernel: Kernel,
}

impl UnrolledNetwork {
    /// An empty network over an existing context; the deserializer fills in
    /// the kernels.
    pub fn new(context: UnrolledTrainingContext) -> Self {
        Self {
            context,
            feed_kernel: Kernel::default(),
            train_kernel: Kernel::default(),
        }
    }

    /// Compile per-neuron chunks into the two kernels.
    pub fn with_layers(context: UnrolledTrainingContext, layers: Vec<Vec<UnrolledNeuron>>) -> Self {
        let mut feed_kernel = Kernel::default();
        for layer in &layers {
            for neuron in layer {
                let feed = neuron.feed_chunk();
                let trace = neuron.trace_chunk();
                feed_kernel.commands.extend_from_slice(&feed.commands);
                feed_kernel.commands.extend_from_slice(&trace.commands);
                feed_kernel.indices.extend_from_slice(&feed.indices);
                feed_kernel.indices.extend_from_slice(&trace.indices);
            }
        }
        feed_kernel.commands.push(Opcode::END.as_u8());

        let mut train_kernel = Kernel::default();
        for layer in layers.iter().rev() {
            for neuron in layer.iter().rev() {
                let train = neuron.train_chunk();
                train_kernel.commands.extend_from_slice(&train.commands);
                train_kernel.indices.extend_from_slice(&train.indices);
            }
        }
        train_kernel.commands.push(Opcode::END.as_u8());

        debug!(
            "compiled kernels: feed {} ops / {} operands, train {} ops / {} operands",
            feed_kernel.commands.len(),
            feed_kernel.indices.len(),
            train_kernel.commands.len(),
            train_kernel.indices.len()
        );

        Self {
            context,
            feed_kernel,
            train_kernel,
        }
    }

    pub(crate) fn from_parts(
        context: UnrolledTrainingContext,
        feed_kernel: Kernel,
        train_kernel: Kernel,
    ) -> Self {
        Self {
            context,
            feed_kernel,
            train_kernel,
        }
    }

    pub fn context(&self) -> &UnrolledTrainingContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut UnrolledTrainingContext {
        &mut self.context
    }

    pub fn feed_kernel(&self) -> &Kernel {
        &self.feed_kernel
    }

    pub fn train_kernel(&self) -> &Kernel {
        &self.train_kernel
    }

    /// Write the inputs, run the feed kernel, snapshot the outputs.
    pub fn feed(&mut self, values: &[Value]) -> Result<Vec<Value>> {
        let input_count = self.context.input_variables().len();
        if values.len() != input_count {
            return Err(TracenetError::ShapeMismatch {
                expected: input_count,
                actual: values.len(),
            });
        }

        self.context.outputs_mut().fill(0.0);

        let input_variables = self.context.input_variables().to_vec();
        for (&index, &value) in input_variables.iter().zip(values) {
            self.context.memory_mut()[index as usize] = value;
        }

        vm_process(
            &self.feed_kernel.commands,
            &self.feed_kernel.indices,
            self.context.memory_mut(),
        );

        let output_variables = self.context.output_variables().to_vec();
        for (slot, &index) in (0..output_variables.len()).zip(&output_variables) {
            self.context.outputs_mut()[slot] = self.context.memory()[index as usize];
        }

        Ok(self.context.outputs().to_vec())
    }

    /// Write targets and rate, then run the train kernel; parameters mutate
    /// in place in the register file. Must follow the matching `feed`.
    pub fn train(&mut self, rate: Value, target: &[Value]) -> Result<()> {
        let target_count = self.context.target_variables().len();
        if target.len() != target_count {
            return Err(TracenetError::ShapeMismatch {
                expected: target_count,
                actual: target.len(),
            });
        }

        let target_variables = self.context.target_variables().to_vec();
        for (&index, &value) in target_variables.iter().zip(target) {
            self.context.memory_mut()[index as usize] = value;
        }

        let rate_variable = self.context.rate_variable();
        self.context.memory_mut()[rate_variable as usize] = rate;

        vm_process(
            &self.train_kernel.commands,
            &self.train_kernel.indices,
            self.context.memory_mut(),
        );

        Ok(())
    }
}
