//! Serialization surface - the abstract tree context
//!
//! Topology, training parameters and compiled bytecode all round-trip
//! through [`TreeNode`], a hierarchical context with typed properties,
//! ordered children and base64 byte blobs. An object is serializable when it
//! implements the [`TreeSerializable`] capability pair; no inheritance
//! hierarchy is involved.
//!
//! The concrete wire format is a separate concern: `TreeNode` derives serde,
//! so any serde back-end binds it. A JSON binding ships here because the
//! round-trip tests need one.
//!
//! ## Blob layout
//!
//! - `RawMemory`: the register file as little-endian `Value`s; `ValueSize`
//!   records the compile-time width (4 or 8 bytes) and mismatches fail
//!   loudly on load
//! - `Commands`: the opcode stream, one byte per opcode
//! - `Indices`: the operand stream as little-endian 32-bit words
//!
//! The snapshot is a same-machine format; cross-endianness portability is
//! out of scope.

use crate::graph::{
    ConnectionData, ConnectionId, Graph, Layer, Network, NeuronData, NeuronId, TrainingContext,
};
use crate::unrolled::{Kernel, UnrolledNetwork, UnrolledTrainingContext};
use crate::{RegisterIndex, Value};
use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Key constants for every serialized tree
pub mod keys {
    /// Graph-side namespace
    pub mod core {
        pub const NETWORK: &str = "Network";
        pub const NAME: &str = "Name";
        pub const INPUT_LAYER: &str = "InputLayer";
        pub const HIDDEN_LAYERS: &str = "HiddenLayers";
        pub const OUTPUT_LAYER: &str = "OutputLayer";
        pub const LAYER: &str = "Layer";
        pub const NEURONS: &str = "Neurons";
        pub const NEURON: &str = "Neuron";
        pub const CONNECTIONS: &str = "Connections";
        pub const CONNECTION: &str = "Connection";
        pub const ID: &str = "Id";
        pub const IS_CONST: &str = "IsConst";
        pub const INPUT_NEURON_ID: &str = "InputNeuronId";
        pub const OUTPUT_NEURON_ID: &str = "OutputNeuronId";
        pub const GATE_NEURON_ID: &str = "GateNeuronId";

        pub const TRAINING_CONTEXT: &str = "TrainingContext";
        pub const NEURON_CONTEXTS: &str = "NeuronContexts";
        pub const NEURON_CONTEXT: &str = "NeuronContext";
        pub const CONNECTION_CONTEXTS: &str = "ConnectionContexts";
        pub const CONNECTION_CONTEXT: &str = "ConnectionContext";

        pub const BIAS: &str = "Bias";
        pub const ACTIVATION: &str = "Activation";
        pub const DERIVATIVE: &str = "Derivative";
        pub const STATE: &str = "State";
        pub const OLD_STATE: &str = "OldState";
        pub const ERROR_RESPONSIBILITY: &str = "ErrorResponsibility";
        pub const PROJECTED_ACTIVITY: &str = "ProjectedActivity";
        pub const GATING_ACTIVITY: &str = "GatingActivity";
        pub const WEIGHT: &str = "Weight";
        pub const GAIN: &str = "Gain";
    }

    /// Bytecode-side namespace
    pub mod unrolled {
        pub const NETWORK: &str = "UnrolledNetwork";
        pub const FEED_KERNEL: &str = "FeedKernel";
        pub const TRAIN_KERNEL: &str = "TrainKernel";
        pub const COMMANDS: &str = "Commands";
        pub const COMMANDS_SIZE: &str = "CommandsSize";
        pub const INDICES: &str = "Indices";
        pub const INDICES_SIZE: &str = "IndicesSize";
        pub const ENTRY_POINT: &str = "EntryPoint";

        pub const TRAINING_CONTEXT: &str = "UnrolledTrainingContext";
        pub const RAW_MEMORY: &str = "RawMemory";
        pub const MEMORY_SIZE: &str = "MemorySize";
        pub const VALUE_SIZE: &str = "ValueSize";
        pub const VARIABLES_MAPPING: &str = "VariablesMapping";
        pub const INPUTS_MAPPING: &str = "InputsMapping";
        pub const OUTPUTS_MAPPING: &str = "OutputsMapping";
        pub const TARGETS_MAPPING: &str = "TargetsMapping";
        pub const RATE_MAPPING: &str = "RateMapping";
        pub const VARIABLE: &str = "Variable";
        pub const KEY: &str = "Key";
        pub const INDEX: &str = "Index";
    }
}

// =============================================================================
// Tree context
// =============================================================================

/// One node of the abstract serialization tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    key: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    strings: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    numbers: BTreeMap<String, i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    reals: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            strings: BTreeMap::new(),
            numbers: BTreeMap::new(),
            reals: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Append a child node and hand it back for filling
    pub fn add_child(&mut self, key: impl Into<String>) -> &mut TreeNode {
        self.children.push(TreeNode::new(key));
        self.children.last_mut().expect("just pushed")
    }

    pub fn set_string_property(&mut self, value: impl Into<String>, key: impl Into<String>) {
        self.strings.insert(key.into(), value.into());
    }

    pub fn set_number_property(&mut self, value: i64, key: impl Into<String>) {
        self.numbers.insert(key.into(), value);
    }

    pub fn set_real_property(&mut self, value: Value, key: impl Into<String>) {
        self.reals.insert(key.into(), value);
    }

    pub fn string_property(&self, key: &str) -> Option<&str> {
        self.strings.get(key).map(|s| s.as_str())
    }

    pub fn number_property(&self, key: &str) -> Option<i64> {
        self.numbers.get(key).copied()
    }

    pub fn real_property(&self, key: &str) -> Option<Value> {
        self.reals.get(key).copied()
    }

    pub fn require_string(&self, key: &str) -> Result<&str> {
        self.string_property(key)
            .with_context(|| format!("Missing string property '{}' under '{}'", key, self.key))
    }

    pub fn require_number(&self, key: &str) -> Result<i64> {
        self.number_property(key)
            .with_context(|| format!("Missing number property '{}' under '{}'", key, self.key))
    }

    pub fn require_real(&self, key: &str) -> Result<Value> {
        self.real_property(key)
            .with_context(|| format!("Missing real property '{}' under '{}'", key, self.key))
    }

    pub fn children(&self) -> &[TreeNode] {
        &self.children
    }

    pub fn find_child(&self, key: &str) -> Option<&TreeNode> {
        self.children.iter().find(|c| c.key == key)
    }

    pub fn require_child(&self, key: &str) -> Result<&TreeNode> {
        self.find_child(key)
            .with_context(|| format!("Missing child '{}' under '{}'", key, self.key))
    }

    pub fn children_with_key<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a TreeNode> {
        self.children.iter().filter(move |c| c.key == key)
    }

    // =========================================================================
    // Concrete binding (JSON) and file helpers
    // =========================================================================

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to encode tree as JSON")
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse tree from JSON")
    }

    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        std::fs::write(path.as_ref(), self.to_json()?)
            .with_context(|| format!("Failed to write tree to {:?}", path.as_ref()))
    }

    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read tree from {:?}", path.as_ref()))?;
        Self::from_json(&json)
    }
}

/// The serializable capability: consume and produce a tree context
pub trait TreeSerializable: Sized {
    fn serialize(&self, node: &mut TreeNode);
    fn deserialize(node: &TreeNode) -> Result<Self>;
}

/// Children a reader does not understand are tolerated, not fatal: a newer
/// writer may have added sections. Log and move on.
fn warn_unknown_children(node: &TreeNode, known: &[&str]) {
    for child in node.children() {
        if !known.contains(&child.key()) {
            warn!(
                "Skipping unrecognized child '{}' under '{}'",
                child.key(),
                node.key()
            );
        }
    }
}

// =============================================================================
// Blob helpers
// =============================================================================

pub fn encode_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_base64(encoded: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(encoded)
        .context("Failed to decode base64 blob")
}

fn values_to_bytes(values: &[Value]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * std::mem::size_of::<Value>());
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn values_from_bytes(bytes: &[u8]) -> Result<Vec<Value>> {
    const WIDTH: usize = std::mem::size_of::<Value>();
    if bytes.len() % WIDTH != 0 {
        bail!("Raw memory length {} is not a multiple of {}", bytes.len(), WIDTH);
    }
    Ok(bytes
        .chunks_exact(WIDTH)
        .map(|chunk| Value::from_le_bytes(chunk.try_into().expect("chunk width")))
        .collect())
}

fn indices_to_bytes(indices: &[RegisterIndex]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(indices.len() * 4);
    for index in indices {
        bytes.extend_from_slice(&index.to_le_bytes());
    }
    bytes
}

fn indices_from_bytes(bytes: &[u8]) -> Result<Vec<RegisterIndex>> {
    if bytes.len() % 4 != 0 {
        bail!("Indices length {} is not a multiple of 4", bytes.len());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| RegisterIndex::from_le_bytes(chunk.try_into().expect("chunk width")))
        .collect())
}

// =============================================================================
// TrainingContext
// =============================================================================

impl TreeSerializable for TrainingContext {
    fn serialize(&self, node: &mut TreeNode) {
        node.set_string_property(self.name(), keys::core::NAME);

        let neurons = node.add_child(keys::core::NEURON_CONTEXTS);
        for (id, data) in self.neuron_entries() {
            let entry = neurons.add_child(keys::core::NEURON_CONTEXT);
            entry.set_number_property(id.as_u64() as i64, keys::core::ID);
            entry.set_real_property(data.bias, keys::core::BIAS);
            entry.set_real_property(data.activation, keys::core::ACTIVATION);
            entry.set_real_property(data.derivative, keys::core::DERIVATIVE);
            entry.set_real_property(data.state, keys::core::STATE);
            entry.set_real_property(data.old_state, keys::core::OLD_STATE);
            entry.set_real_property(data.error_responsibility, keys::core::ERROR_RESPONSIBILITY);
            entry.set_real_property(data.projected_activity, keys::core::PROJECTED_ACTIVITY);
            entry.set_real_property(data.gating_activity, keys::core::GATING_ACTIVITY);
        }

        let connections = node.add_child(keys::core::CONNECTION_CONTEXTS);
        for (id, data) in self.connection_entries() {
            let entry = connections.add_child(keys::core::CONNECTION_CONTEXT);
            entry.set_number_property(id.as_u64() as i64, keys::core::ID);
            entry.set_real_property(data.weight, keys::core::WEIGHT);
            entry.set_real_property(data.gain, keys::core::GAIN);
        }
    }

    fn deserialize(node: &TreeNode) -> Result<Self> {
        let mut context = TrainingContext::new(node.require_string(keys::core::NAME)?);
        warn_unknown_children(
            node,
            &[keys::core::NEURON_CONTEXTS, keys::core::CONNECTION_CONTEXTS],
        );

        let mut seen_neurons = BTreeSet::new();
        for entry in node
            .require_child(keys::core::NEURON_CONTEXTS)?
            .children_with_key(keys::core::NEURON_CONTEXT)
        {
            let id = NeuronId(entry.require_number(keys::core::ID)? as u64);
            if !seen_neurons.insert(id) {
                warn!("Duplicate context entry for {}, keeping the latest", id);
            }
            context.insert_neuron_data(
                id,
                NeuronData {
                    bias: entry.require_real(keys::core::BIAS)?,
                    activation: entry.require_real(keys::core::ACTIVATION)?,
                    derivative: entry.require_real(keys::core::DERIVATIVE)?,
                    state: entry.require_real(keys::core::STATE)?,
                    old_state: entry.require_real(keys::core::OLD_STATE)?,
                    error_responsibility: entry.require_real(keys::core::ERROR_RESPONSIBILITY)?,
                    projected_activity: entry.require_real(keys::core::PROJECTED_ACTIVITY)?,
                    gating_activity: entry.require_real(keys::core::GATING_ACTIVITY)?,
                },
            );
        }

        let mut seen_connections = BTreeSet::new();
        for entry in node
            .require_child(keys::core::CONNECTION_CONTEXTS)?
            .children_with_key(keys::core::CONNECTION_CONTEXT)
        {
            let id = ConnectionId(entry.require_number(keys::core::ID)? as u64);
            if !seen_connections.insert(id) {
                warn!("Duplicate context entry for {}, keeping the latest", id);
            }
            context.insert_connection_data(
                id,
                ConnectionData {
                    weight: entry.require_real(keys::core::WEIGHT)?,
                    gain: entry.require_real(keys::core::GAIN)?,
                },
            );
        }

        Ok(context)
    }
}

// =============================================================================
// Network topology
// =============================================================================

fn serialize_layer(graph: &Graph, layer: &Layer, node: &mut TreeNode) {
    let neurons = node.add_child(keys::core::NEURONS);
    for &id in layer.neurons() {
        let entry = neurons.add_child(keys::core::NEURON);
        entry.set_number_property(id.as_u64() as i64, keys::core::ID);
        if graph.neuron(id).is_const() {
            entry.set_number_property(1, keys::core::IS_CONST);
        }
    }
}

fn deserialize_layer_ids(node: &TreeNode) -> Result<Vec<(u64, bool)>> {
    let mut ids = Vec::new();
    for entry in node
        .require_child(keys::core::NEURONS)?
        .children_with_key(keys::core::NEURON)
    {
        let id = entry.require_number(keys::core::ID)? as u64;
        let is_const = entry.number_property(keys::core::IS_CONST).unwrap_or(0) != 0;
        ids.push((id, is_const));
    }
    Ok(ids)
}

impl TreeSerializable for Network {
    fn serialize(&self, node: &mut TreeNode) {
        node.set_string_property(self.name(), keys::core::NAME);

        let graph = self.graph();
        {
            let input = node.add_child(keys::core::INPUT_LAYER);
            serialize_layer(graph, self.input_layer(), input);
        }
        {
            let hidden = node.add_child(keys::core::HIDDEN_LAYERS);
            for layer in self.hidden_layers() {
                let entry = hidden.add_child(keys::core::LAYER);
                serialize_layer(graph, layer, entry);
            }
        }
        {
            let output = node.add_child(keys::core::OUTPUT_LAYER);
            serialize_layer(graph, self.output_layer(), output);
        }

        let connections = node.add_child(keys::core::CONNECTIONS);
        for connection in graph.connections() {
            let entry = connections.add_child(keys::core::CONNECTION);
            entry.set_number_property(connection.id().as_u64() as i64, keys::core::ID);
            entry.set_number_property(
                connection.input_neuron().as_u64() as i64,
                keys::core::INPUT_NEURON_ID,
            );
            entry.set_number_property(
                connection.output_neuron().as_u64() as i64,
                keys::core::OUTPUT_NEURON_ID,
            );
            if let Some(gate) = connection.gate_neuron() {
                entry.set_number_property(gate.as_u64() as i64, keys::core::GATE_NEURON_ID);
            }
        }

        let context = node.add_child(keys::core::TRAINING_CONTEXT);
        self.context().serialize(context);
    }

    fn deserialize(node: &TreeNode) -> Result<Self> {
        let name = node.require_string(keys::core::NAME)?.to_string();
        warn_unknown_children(
            node,
            &[
                keys::core::INPUT_LAYER,
                keys::core::HIDDEN_LAYERS,
                keys::core::OUTPUT_LAYER,
                keys::core::CONNECTIONS,
                keys::core::TRAINING_CONTEXT,
            ],
        );

        let input_ids = deserialize_layer_ids(node.require_child(keys::core::INPUT_LAYER)?)?;
        let hidden_ids: Vec<Vec<(u64, bool)>> = node
            .require_child(keys::core::HIDDEN_LAYERS)?
            .children_with_key(keys::core::LAYER)
            .map(deserialize_layer_ids)
            .collect::<Result<_>>()?;
        let output_ids = deserialize_layer_ids(node.require_child(keys::core::OUTPUT_LAYER)?)?;

        // neuron ids must densely cover the arena
        let mut all_ids: Vec<u64> = input_ids
            .iter()
            .chain(hidden_ids.iter().flatten())
            .chain(output_ids.iter())
            .map(|&(id, _)| id)
            .collect();
        all_ids.sort_unstable();
        for (expected, &id) in all_ids.iter().enumerate() {
            if id != expected as u64 {
                bail!("Neuron ids are not dense: expected {}, found {}", expected, id);
            }
        }

        let mut graph = Graph::new();
        for _ in 0..all_ids.len() {
            graph.add_neuron();
        }
        for &(id, is_const) in input_ids
            .iter()
            .chain(hidden_ids.iter().flatten())
            .chain(output_ids.iter())
        {
            if is_const {
                graph.set_const(NeuronId(id), true);
            }
        }

        // connections replay in id order through the same connect/gate paths
        // used when the network was built, so every trace map comes back
        let mut records: Vec<(u64, u64, u64, Option<u64>)> = Vec::new();
        for entry in node
            .require_child(keys::core::CONNECTIONS)?
            .children_with_key(keys::core::CONNECTION)
        {
            records.push((
                entry.require_number(keys::core::ID)? as u64,
                entry.require_number(keys::core::INPUT_NEURON_ID)? as u64,
                entry.require_number(keys::core::OUTPUT_NEURON_ID)? as u64,
                entry
                    .number_property(keys::core::GATE_NEURON_ID)
                    .map(|g| g as u64),
            ));
        }
        records.sort_unstable_by_key(|&(id, ..)| id);

        let neuron_count = all_ids.len() as u64;
        for &(id, input, output, _) in &records {
            if input >= neuron_count || output >= neuron_count {
                bail!("Connection {} refers to an unknown neuron", id);
            }
            let created = graph.connect(NeuronId(input), NeuronId(output));
            if created.as_u64() != id {
                bail!(
                    "Connection ids are not dense: expected {}, created {}",
                    id,
                    created.as_u64()
                );
            }
        }
        for &(id, _, _, gate) in &records {
            if let Some(gate) = gate {
                if gate >= neuron_count {
                    bail!("Connection {} gated by an unknown neuron", id);
                }
                graph.gate(NeuronId(gate), ConnectionId(id));
            }
        }

        let context =
            TrainingContext::deserialize(node.require_child(keys::core::TRAINING_CONTEXT)?)?;

        let layer_from = |ids: &[(u64, bool)]| {
            Layer::from_neuron_ids(ids.iter().map(|&(id, _)| NeuronId(id)).collect())
        };
        let input_layer = layer_from(&input_ids);
        let hidden_layers = hidden_ids.iter().map(|ids| layer_from(ids)).collect();
        let output_layer = layer_from(&output_ids);

        debug!(
            "deserialized network '{}': {} neurons, {} connections",
            name,
            graph.neuron_count(),
            graph.connection_count()
        );

        Ok(Network::from_layers(
            name,
            graph,
            context,
            input_layer,
            hidden_layers,
            output_layer,
        ))
    }
}

// =============================================================================
// Unrolled training context
// =============================================================================

fn serialize_index_list(node: &mut TreeNode, key: &str, indices: &[RegisterIndex]) {
    let list = node.add_child(key);
    for &index in indices {
        let entry = list.add_child(keys::unrolled::VARIABLE);
        entry.set_number_property(index as i64, keys::unrolled::INDEX);
    }
}

fn deserialize_index_list(node: &TreeNode, key: &str) -> Result<Vec<RegisterIndex>> {
    node.require_child(key)?
        .children_with_key(keys::unrolled::VARIABLE)
        .map(|entry| Ok(entry.require_number(keys::unrolled::INDEX)? as RegisterIndex))
        .collect()
}

impl TreeSerializable for UnrolledTrainingContext {
    fn serialize(&self, node: &mut TreeNode) {
        node.set_string_property(encode_base64(&values_to_bytes(self.memory())), keys::unrolled::RAW_MEMORY);
        node.set_number_property(self.memory().len() as i64, keys::unrolled::MEMORY_SIZE);
        node.set_number_property(
            std::mem::size_of::<Value>() as i64,
            keys::unrolled::VALUE_SIZE,
        );

        serialize_index_list(node, keys::unrolled::INPUTS_MAPPING, self.input_variables());
        serialize_index_list(node, keys::unrolled::OUTPUTS_MAPPING, self.output_variables());
        serialize_index_list(node, keys::unrolled::TARGETS_MAPPING, self.target_variables());

        let rate = node.add_child(keys::unrolled::RATE_MAPPING);
        rate.set_number_property(self.rate_variable() as i64, keys::unrolled::INDEX);

        let variables = node.add_child(keys::unrolled::VARIABLES_MAPPING);
        for (key, index) in self.mapping_entries() {
            let entry = variables.add_child(keys::unrolled::VARIABLE);
            entry.set_string_property(key, keys::unrolled::KEY);
            entry.set_number_property(index as i64, keys::unrolled::INDEX);
        }
    }

    fn deserialize(node: &TreeNode) -> Result<Self> {
        let value_size = node.require_number(keys::unrolled::VALUE_SIZE)?;
        if value_size != std::mem::size_of::<Value>() as i64 {
            bail!(
                "Register snapshot uses {}-byte values, this build uses {}",
                value_size,
                std::mem::size_of::<Value>()
            );
        }

        let memory = values_from_bytes(&decode_base64(
            node.require_string(keys::unrolled::RAW_MEMORY)?,
        )?)?;
        let memory_size = node.require_number(keys::unrolled::MEMORY_SIZE)? as usize;
        if memory.len() != memory_size {
            bail!(
                "Register file size mismatch: header says {}, blob holds {}",
                memory_size,
                memory.len()
            );
        }

        let input_variables = deserialize_index_list(node, keys::unrolled::INPUTS_MAPPING)?;
        let output_variables = deserialize_index_list(node, keys::unrolled::OUTPUTS_MAPPING)?;
        let target_variables = deserialize_index_list(node, keys::unrolled::TARGETS_MAPPING)?;
        let rate_variable = node
            .require_child(keys::unrolled::RATE_MAPPING)?
            .require_number(keys::unrolled::INDEX)? as RegisterIndex;

        let mut mapping = BTreeMap::new();
        for entry in node
            .require_child(keys::unrolled::VARIABLES_MAPPING)?
            .children_with_key(keys::unrolled::VARIABLE)
        {
            mapping.insert(
                entry.require_string(keys::unrolled::KEY)?.to_string(),
                entry.require_number(keys::unrolled::INDEX)? as RegisterIndex,
            );
        }

        for &index in input_variables
            .iter()
            .chain(&output_variables)
            .chain(&target_variables)
            .chain(std::iter::once(&rate_variable))
            .chain(mapping.values())
        {
            if index as usize >= memory.len() {
                bail!(
                    "Variable mapping refers to register {} beyond memory size {}",
                    index,
                    memory.len()
                );
            }
        }

        Ok(UnrolledTrainingContext::from_parts(
            memory,
            mapping,
            input_variables,
            output_variables,
            target_variables,
            rate_variable,
        ))
    }
}

// =============================================================================
// Kernels and the unrolled network
// =============================================================================

impl Kernel {
    pub fn serialize_into(&self, node: &mut TreeNode, entry_point: &str) {
        node.set_string_property(encode_base64(&self.commands), keys::unrolled::COMMANDS);
        node.set_number_property(self.commands.len() as i64, keys::unrolled::COMMANDS_SIZE);
        node.set_string_property(
            encode_base64(&indices_to_bytes(&self.indices)),
            keys::unrolled::INDICES,
        );
        node.set_number_property(self.indices.len() as i64, keys::unrolled::INDICES_SIZE);
        node.set_string_property(entry_point, keys::unrolled::ENTRY_POINT);
    }

    pub fn deserialize_from(node: &TreeNode) -> Result<Self> {
        let commands = decode_base64(node.require_string(keys::unrolled::COMMANDS)?)?;
        let commands_size = node.require_number(keys::unrolled::COMMANDS_SIZE)? as usize;
        if commands.len() != commands_size {
            bail!(
                "Command stream size mismatch: header says {}, blob holds {}",
                commands_size,
                commands.len()
            );
        }

        let indices =
            indices_from_bytes(&decode_base64(node.require_string(keys::unrolled::INDICES)?)?)?;
        let indices_size = node.require_number(keys::unrolled::INDICES_SIZE)? as usize;
        if indices.len() != indices_size {
            bail!(
                "Index stream size mismatch: header says {}, blob holds {}",
                indices_size,
                indices.len()
            );
        }

        Ok(Kernel { commands, indices })
    }
}

impl TreeSerializable for UnrolledNetwork {
    fn serialize(&self, node: &mut TreeNode) {
        let feed = node.add_child(keys::unrolled::FEED_KERNEL);
        self.feed_kernel().serialize_into(feed, "feed");

        let train = node.add_child(keys::unrolled::TRAIN_KERNEL);
        self.train_kernel().serialize_into(train, "train");

        let context = node.add_child(keys::unrolled::TRAINING_CONTEXT);
        self.context().serialize(context);
    }

    fn deserialize(node: &TreeNode) -> Result<Self> {
        warn_unknown_children(
            node,
            &[
                keys::unrolled::FEED_KERNEL,
                keys::unrolled::TRAIN_KERNEL,
                keys::unrolled::TRAINING_CONTEXT,
            ],
        );

        let context = UnrolledTrainingContext::deserialize(
            node.require_child(keys::unrolled::TRAINING_CONTEXT)?,
        )?;

        let feed_kernel =
            Kernel::deserialize_from(node.require_child(keys::unrolled::FEED_KERNEL)?)?;
        let train_kernel =
            Kernel::deserialize_from(node.require_child(keys::unrolled::TRAIN_KERNEL)?)?;

        // a kernel referring past the register file makes the network unusable
        feed_kernel.check_bounds(context.memory().len())?;
        train_kernel.check_bounds(context.memory().len())?;

        Ok(UnrolledNetwork::from_parts(context, feed_kernel, train_kernel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn serialize_to_root<T: TreeSerializable>(value: &T, key: &str) -> TreeNode {
        let mut root = TreeNode::new(key);
        value.serialize(&mut root);
        root
    }

    #[test]
    fn test_tree_json_round_trip() {
        let mut node = TreeNode::new("Root");
        node.set_string_property("hello", "Greeting");
        node.set_number_property(-5, "Count");
        node.set_real_property(0.125, "Scale");
        node.add_child("Child").set_number_property(7, "Index");

        let json = node.to_json().unwrap();
        let recovered = TreeNode::from_json(&json).unwrap();
        assert_eq!(node, recovered);
        assert_eq!(recovered.require_child("Child").unwrap().number_property("Index"), Some(7));
    }

    #[test]
    fn test_blob_helpers_round_trip() {
        let values = vec![0.5, -1.25, 3.0];
        let recovered = values_from_bytes(&decode_base64(&encode_base64(&values_to_bytes(&values))).unwrap()).unwrap();
        assert_eq!(values, recovered);

        let indices = vec![0u32, 7, 300, 65536];
        let recovered = indices_from_bytes(&indices_to_bytes(&indices)).unwrap();
        assert_eq!(indices, recovered);
    }

    #[test]
    fn test_training_context_round_trip_is_byte_identical() {
        let mut network = Network::lstm("ctx", 2, &[3], 1);
        network.feed(&[0.5, 0.25]).unwrap();
        network.train(0.1, &[1.0]).unwrap();

        let first = serialize_to_root(network.context(), keys::core::TRAINING_CONTEXT);
        let recovered = TrainingContext::deserialize(&first).unwrap();
        let second = serialize_to_root(&recovered, keys::core::TRAINING_CONTEXT);

        assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
    }

    #[test]
    fn test_network_topology_round_trip() {
        let mut network = Network::lstm("topo", 2, &[3], 1);
        network.feed(&[0.5, 0.25]).unwrap();
        network.train(0.1, &[1.0]).unwrap();

        let first = serialize_to_root(&network, keys::core::NETWORK);
        let mut recovered = Network::deserialize(&first).unwrap();
        let second = serialize_to_root(&recovered, keys::core::NETWORK);
        assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());

        // same parameters, same topology: the reference interpreters agree
        for sample in [[0.0, 1.0], [1.0, 0.0], [0.3, 0.8]] {
            let a = network.feed(&sample).unwrap();
            let b = recovered.feed(&sample).unwrap();
            for (x, y) in a.iter().zip(&b) {
                assert!((x - y).abs() < 1e-2, "{} vs {}", x, y);
            }
        }
    }

    // Scenario: trained unrolled LSTM round-trips through the tree
    #[test]
    fn test_unrolled_network_round_trip() {
        let mut network = Network::lstm("s5", 3, &[10], 3);
        let mut unrolled = network.to_unrolled();

        let mut rng = rand::thread_rng();
        let targets: [Value; 3] = [rng.gen(), rng.gen(), rng.gen()];
        for _ in 0..500 {
            let sample: [Value; 3] = [rng.gen(), rng.gen(), rng.gen()];
            unrolled.feed(&sample).unwrap();
            unrolled.train(0.1, &targets).unwrap();
        }

        let first = serialize_to_root(&unrolled, keys::unrolled::NETWORK);
        let mut recovered = UnrolledNetwork::deserialize(&first).unwrap();
        let second = serialize_to_root(&recovered, keys::unrolled::NETWORK);
        assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());

        for _ in 0..10 {
            let sample: [Value; 3] = [rng.gen(), rng.gen(), rng.gen()];
            let a = unrolled.feed(&sample).unwrap();
            let b = recovered.feed(&sample).unwrap();
            assert_eq!(a.len(), b.len());
            for (x, y) in a.iter().zip(&b) {
                assert!((x - y).abs() < 1e-2, "{} vs {}", x, y);
            }
        }
    }

    #[test]
    fn test_dangling_bytecode_fails_loudly() {
        let mut network = Network::feed_forward("bad", 1, &[2], 1);
        let unrolled = network.to_unrolled();

        let mut root = serialize_to_root(&unrolled, keys::unrolled::NETWORK);
        // corrupt the memory size so the kernels dangle
        let memory = vec![0.0; 2];
        let context_node = root
            .children
            .iter_mut()
            .find(|c| c.key() == keys::unrolled::TRAINING_CONTEXT)
            .unwrap();
        context_node.set_string_property(
            encode_base64(&values_to_bytes(&memory)),
            keys::unrolled::RAW_MEMORY,
        );
        context_node.set_number_property(memory.len() as i64, keys::unrolled::MEMORY_SIZE);

        assert!(UnrolledNetwork::deserialize(&root).is_err());
    }

    #[test]
    fn test_value_width_mismatch_fails() {
        let mut network = Network::feed_forward("w", 1, &[2], 1);
        let unrolled = network.to_unrolled();

        let mut root = serialize_to_root(unrolled.context(), keys::unrolled::TRAINING_CONTEXT);
        root.set_number_property(2, keys::unrolled::VALUE_SIZE);
        assert!(UnrolledTrainingContext::deserialize(&root).is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let mut network = Network::feed_forward("file", 2, &[3], 1);
        let unrolled = network.to_unrolled();

        let root = serialize_to_root(&unrolled, keys::unrolled::NETWORK);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network.json");

        root.save_to_file(&path).unwrap();
        let loaded = TreeNode::load_from_file(&path).unwrap();
        assert_eq!(root, loaded);
        assert!(UnrolledNetwork::deserialize(&loaded).is_ok());
    }

    #[test]
    fn test_unknown_children_are_tolerated() {
        let mut network = Network::lstm("extra", 2, &[2], 1);
        let mut unrolled = network.to_unrolled();

        // a newer writer appending sections must not break this reader
        let mut root = serialize_to_root(&unrolled, keys::unrolled::NETWORK);
        root.add_child("Extensions").set_number_property(1, "Version");
        let mut recovered = UnrolledNetwork::deserialize(&root).unwrap();

        let sample = [0.25, 0.75];
        let a = unrolled.feed(&sample).unwrap();
        let b = recovered.feed(&sample).unwrap();
        assert_eq!(a, b);

        let mut topology = serialize_to_root(&network, keys::core::NETWORK);
        topology.add_child("Annotations");
        assert!(Network::deserialize(&topology).is_ok());
    }

    #[test]
    fn test_duplicate_context_entries_keep_the_latest() {
        let mut network = Network::feed_forward("dup", 1, &[2], 1);
        network.feed(&[0.5]).unwrap();

        let mut root = serialize_to_root(network.context(), keys::core::TRAINING_CONTEXT);
        let neurons = root
            .children
            .iter_mut()
            .find(|c| c.key() == keys::core::NEURON_CONTEXTS)
            .unwrap();
        let mut shadow = neurons.children()[0].clone();
        shadow.set_real_property(0.625, keys::core::BIAS);
        neurons.children.push(shadow);

        let recovered = TrainingContext::deserialize(&root).unwrap();
        let (id, data) = recovered.neuron_entries().next().unwrap();
        assert_eq!(id, NeuronId(0));
        assert_eq!(data.bias, 0.625);
    }
}
