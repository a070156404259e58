//! Graph nodes and their connection slots.
//!
//! Slots never own each other: an `InputSlot` records the `OutputSlotRef` that
//! feeds it and an `OutputSlot` records the `InputSlotRef`s it feeds. Both are
//! plain indices into the owning [`Graph`](crate::Graph)'s layer table.

use smallvec::SmallVec;

use crate::layers::{LayerKind, LayerType};
use crate::types::TensorInfo;

/// Stable identity of a layer within one graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub(crate) u64);

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Address of an output slot: producing layer + slot index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OutputSlotRef {
    pub layer: LayerId,
    pub index: usize,
}

/// Address of an input slot: consuming layer + slot index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InputSlotRef {
    pub layer: LayerId,
    pub index: usize,
}

impl LayerId {
    pub fn output(self, index: usize) -> OutputSlotRef {
        OutputSlotRef { layer: self, index }
    }

    pub fn input(self, index: usize) -> InputSlotRef {
        InputSlotRef { layer: self, index }
    }
}

#[derive(Clone, Debug, Default)]
pub struct InputSlot {
    pub(crate) connection: Option<OutputSlotRef>,
}

impl InputSlot {
    /// The output slot feeding this input, if connected.
    pub fn connection(&self) -> Option<OutputSlotRef> {
        self.connection
    }
}

#[derive(Clone, Debug, Default)]
pub struct OutputSlot {
    pub(crate) tensor_info: Option<TensorInfo>,
    pub(crate) connections: SmallVec<[InputSlotRef; 2]>,
}

impl OutputSlot {
    pub fn tensor_info(&self) -> Option<&TensorInfo> {
        self.tensor_info.as_ref()
    }

    /// Consumers of this output, in connection order.
    pub fn connections(&self) -> &[InputSlotRef] {
        &self.connections
    }
}

/// Lifecycle of a layer. Never regresses on its own; edits reset it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LayerState {
    /// Slots allocated, parameters fixed, shapes unresolved.
    Constructed,
    /// Every output TensorInfo is set and agrees with inference.
    ShapeResolved,
    /// A backend produced an executable workload for this layer.
    WorkloadBound,
}

/// A node of the graph: one operation with its parameters and slots.
#[derive(Debug)]
pub struct Layer {
    pub(crate) id: LayerId,
    pub(crate) name: String,
    pub(crate) kind: LayerKind,
    pub(crate) inputs: SmallVec<[InputSlot; 3]>,
    pub(crate) outputs: SmallVec<[OutputSlot; 4]>,
    pub(crate) state: LayerState,
}

impl Layer {
    pub(crate) fn new(id: LayerId, kind: LayerKind, name: impl Into<String>) -> Self {
        let inputs = (0..kind.num_inputs()).map(|_| InputSlot::default()).collect();
        let outputs = (0..kind.num_outputs()).map(|_| OutputSlot::default()).collect();
        Self {
            id,
            name: name.into(),
            kind,
            inputs,
            outputs,
            state: LayerState::Constructed,
        }
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &LayerKind {
        &self.kind
    }

    /// Mutable parameters. Any edit sends the layer back to `Constructed`.
    pub fn kind_mut(&mut self) -> &mut LayerKind {
        self.state = LayerState::Constructed;
        &mut self.kind
    }

    pub fn layer_type(&self) -> LayerType {
        self.kind.layer_type()
    }

    pub fn state(&self) -> LayerState {
        self.state
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn input_slot(&self, index: usize) -> Option<&InputSlot> {
        self.inputs.get(index)
    }

    pub fn output_slot(&self, index: usize) -> Option<&OutputSlot> {
        self.outputs.get(index)
    }

    pub fn input_slots(&self) -> &[InputSlot] {
        &self.inputs
    }

    pub fn output_slots(&self) -> &[OutputSlot] {
        &self.outputs
    }

    /// Whether no slot of this layer participates in a connection.
    pub fn is_unconnected(&self) -> bool {
        self.inputs.iter().all(|s| s.connection.is_none())
            && self.outputs.iter().all(|s| s.connections.is_empty())
    }

    /// `Pooling2d:pool1` style label for diagnostics.
    pub fn label(&self) -> String {
        format!("{}:{}", self.layer_type(), self.name)
    }
}
