//! UnrolledTrainingContext - the symbolic register allocator
//!
//! Maps variable keys (id tuple + attribute tag) to dense indices in a flat
//! `Value` register file. Allocation is append-only while the emitter runs:
//! once a key has an index, every later request returns the same index (the
//! emitted bytecode would dangle otherwise), and the register is re-seeded
//! with the caller's current value so the file always starts from the
//! graph's parameters.

use crate::graph::{ConnectionId, NeuronId};
use crate::{RegisterIndex, Value};
use std::collections::BTreeMap;

/// Attribute tag - the last component of every variable key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tag {
    Rate,
    Activation,
    Derivative,
    Bias,
    State,
    OldState,
    Weight,
    Gain,
    Influence,
    Eligibility,
    ExtendedTrace,
    ErrorResponsibility,
    ProjectedActivity,
    GatingActivity,
    Target,
    ErrorAccumulator,
    Gradient,
}

impl Tag {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Rate => "rate",
            Self::Activation => "activation",
            Self::Derivative => "derivative",
            Self::Bias => "bias",
            Self::State => "state",
            Self::OldState => "oldstate",
            Self::Weight => "weight",
            Self::Gain => "gain",
            Self::Influence => "influence",
            Self::Eligibility => "eligibility",
            Self::ExtendedTrace => "extendedtrace",
            Self::ErrorResponsibility => "errorresponsibility",
            Self::ProjectedActivity => "projectedactivity",
            Self::GatingActivity => "gatingactivity",
            Self::Target => "target",
            Self::ErrorAccumulator => "erroraccumulator",
            Self::Gradient => "gradient",
        }
    }
}

/// A symbolic variable: an ordered id tuple plus an attribute tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableKey {
    ids: Vec<u64>,
    tag: Tag,
}

impl VariableKey {
    /// The network-global learning-rate variable
    pub fn rate() -> Self {
        Self::scratch(Tag::Rate)
    }

    /// A shared scratch variable (gradient, error accumulator, influence temp)
    pub fn scratch(tag: Tag) -> Self {
        Self { ids: Vec::new(), tag }
    }

    /// A per-neuron attribute
    pub fn neuron(id: NeuronId, tag: Tag) -> Self {
        Self {
            ids: vec![id.as_u64()],
            tag,
        }
    }

    /// A per-connection attribute
    pub fn connection(id: ConnectionId, tag: Tag) -> Self {
        Self {
            ids: vec![id.as_u64()],
            tag,
        }
    }

    /// The eligibility trace of `connection` at `neuron`
    pub fn eligibility(neuron: NeuronId, connection: ConnectionId) -> Self {
        Self {
            ids: vec![neuron.as_u64(), connection.as_u64()],
            tag: Tag::Eligibility,
        }
    }

    /// The extended trace of `connection` at `neuron` through `neighbour`
    pub fn extended_trace(neuron: NeuronId, neighbour: NeuronId, connection: ConnectionId) -> Self {
        Self {
            ids: vec![neuron.as_u64(), neighbour.as_u64(), connection.as_u64()],
            tag: Tag::ExtendedTrace,
        }
    }

    /// Canonical form: id components and tag joined with a fixed separator
    pub fn canonical(&self) -> String {
        let mut key = String::new();
        for id in &self.ids {
            key.push_str(&id.to_string());
            key.push('#');
        }
        key.push_str(self.tag.name());
        key
    }
}

/// Register file plus the key→index mapping built during unrolling
#[derive(Debug, Clone, Default)]
pub struct UnrolledTrainingContext {
    memory: Vec<Value>,
    outputs: Vec<Value>,
    mapping: BTreeMap<String, RegisterIndex>,
    input_variables: Vec<RegisterIndex>,
    output_variables: Vec<RegisterIndex>,
    target_variables: Vec<RegisterIndex>,
    rate_variable: RegisterIndex,
}

impl UnrolledTrainingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the register for `key`, appending a fresh one on first sight.
    /// The register is (re)seeded with `value` either way.
    pub fn allocate_or_reuse(&mut self, value: Value, key: &VariableKey) -> RegisterIndex {
        let canonical = key.canonical();
        if let Some(&index) = self.mapping.get(&canonical) {
            self.memory[index as usize] = value;
            return index;
        }
        let index = self.memory.len() as RegisterIndex;
        self.memory.push(value);
        self.mapping.insert(canonical, index);
        index
    }

    /// Read back the current value of `key`, or `default` if never allocated
    pub fn evaluate(&self, key: &VariableKey, default: Value) -> Value {
        match self.mapping.get(&key.canonical()) {
            Some(&index) => self.memory[index as usize],
            None => default,
        }
    }

    pub fn register_input_variable(&mut self, index: RegisterIndex) {
        self.input_variables.push(index);
    }

    pub fn register_output_variable(&mut self, index: RegisterIndex) {
        self.output_variables.push(index);
        self.outputs.resize(self.output_variables.len(), 0.0);
    }

    pub fn register_target_variable(&mut self, index: RegisterIndex) {
        self.target_variables.push(index);
    }

    pub fn register_rate_variable(&mut self, index: RegisterIndex) {
        self.rate_variable = index;
    }

    pub fn memory(&self) -> &[Value] {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut [Value] {
        &mut self.memory
    }

    pub fn outputs(&self) -> &[Value] {
        &self.outputs
    }

    pub fn outputs_mut(&mut self) -> &mut [Value] {
        &mut self.outputs
    }

    pub fn input_variables(&self) -> &[RegisterIndex] {
        &self.input_variables
    }

    pub fn output_variables(&self) -> &[RegisterIndex] {
        &self.output_variables
    }

    pub fn target_variables(&self) -> &[RegisterIndex] {
        &self.target_variables
    }

    pub fn rate_variable(&self) -> RegisterIndex {
        self.rate_variable
    }

    /// Key→index pairs in key order (for serialization)
    pub fn mapping_entries(&self) -> impl Iterator<Item = (&str, RegisterIndex)> {
        self.mapping.iter().map(|(k, &v)| (k.as_str(), v))
    }

    pub fn variable_count(&self) -> usize {
        self.mapping.len()
    }

    /// Rebuild the context from deserialized parts (crate-internal)
    pub(crate) fn from_parts(
        memory: Vec<Value>,
        mapping: BTreeMap<String, RegisterIndex>,
        input_variables: Vec<RegisterIndex>,
        output_variables: Vec<RegisterIndex>,
        target_variables: Vec<RegisterIndex>,
        rate_variable: RegisterIndex,
    ) -> Self {
        let outputs = vec![0.0; output_variables.len()];
        Self {
            memory,
            outputs,
            mapping,
            input_variables,
            output_variables,
            target_variables,
            rate_variable,
        }
    }

    /// Drop everything. Any previously emitted bytecode is invalid afterwards.
    pub fn clear(&mut self) {
        self.memory.clear();
        self.outputs.clear();
        self.mapping.clear();
        self.input_variables.clear();
        self.output_variables.clear();
        self.target_variables.clear();
        self.rate_variable = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_then_reuse() {
        let mut context = UnrolledTrainingContext::new();
        let key = VariableKey::neuron(NeuronId(3), Tag::Bias);

        let first = context.allocate_or_reuse(0.5, &key);
        let second = context.allocate_or_reuse(0.7, &key);
        assert_eq!(first, second);
        // reuse re-seeds the register
        assert_eq!(context.memory()[first as usize], 0.7);
        assert_eq!(context.memory().len(), 1);
    }

    #[test]
    fn test_mapping_is_a_bijection() {
        let mut context = UnrolledTrainingContext::new();
        for i in 0..16 {
            context.allocate_or_reuse(i as Value, &VariableKey::neuron(NeuronId(i), Tag::State));
            // repeat allocations must not grow the file
            context.allocate_or_reuse(i as Value, &VariableKey::neuron(NeuronId(i), Tag::State));
        }
        assert_eq!(context.memory().len(), context.variable_count());

        let mut seen = std::collections::BTreeSet::new();
        for (_, index) in context.mapping_entries() {
            assert!((index as usize) < context.memory().len());
            assert!(seen.insert(index));
        }
    }

    #[test]
    fn test_evaluate_reads_value() {
        let mut context = UnrolledTrainingContext::new();
        let key = VariableKey::connection(ConnectionId(9), Tag::Weight);
        context.allocate_or_reuse(0.25, &key);

        assert_eq!(context.evaluate(&key, -1.0), 0.25);
        let missing = VariableKey::connection(ConnectionId(10), Tag::Weight);
        assert_eq!(context.evaluate(&missing, -1.0), -1.0);
    }

    #[test]
    fn test_key_canonical_forms_are_distinct() {
        let a = VariableKey::eligibility(NeuronId(1), ConnectionId(2)).canonical();
        let b = VariableKey::extended_trace(NeuronId(1), NeuronId(2), ConnectionId(2)).canonical();
        let c = VariableKey::neuron(NeuronId(1), Tag::Influence).canonical();
        let d = VariableKey::scratch(Tag::Influence).canonical();
        assert_eq!(a, "1#2#eligibility");
        assert_eq!(b, "1#2#2#extendedtrace");
        assert_eq!(c, "1#influence");
        assert_eq!(d, "influence");
    }

    #[test]
    fn test_register_output_resizes_scratch() {
        let mut context = UnrolledTrainingContext::new();
        context.register_output_variable(4);
        context.register_output_variable(7);
        assert_eq!(context.outputs().len(), 2);
    }
}
