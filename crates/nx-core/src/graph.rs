//! Layer graph: exclusive owner of every layer and of the connections
//! between their slots.
//!
//! The graph does not run shape inference on its own. Callers interleave
//! structural edits with explicit `validate_tensor_shapes` passes.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::layer::{InputSlotRef, Layer, LayerId, LayerState, OutputSlotRef};
use crate::layers::LayerKind;
use crate::schedule;
use crate::types::{TensorInfo, TensorShape};
use crate::workload::WorkloadInfo;
use crate::{NxError, Result};

/// The layer arena.
#[derive(Debug, Default)]
pub struct Graph {
    layers: HashMap<LayerId, Layer>,
    /// Insertion order; not necessarily topological.
    order: Vec<LayerId>,
    next_id: u64,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Layers ──────────────────────────────────────────────────────────

    /// Add an unconnected layer and return its ID.
    pub fn add_layer(&mut self, kind: LayerKind, name: impl Into<String>) -> LayerId {
        let id = self.alloc_id();
        let layer = Layer::new(id, kind, name);
        trace!(layer = %layer.label(), id = %id, "add layer");
        self.layers.insert(id, layer);
        self.order.push(id);
        id
    }

    fn alloc_id(&mut self) -> LayerId {
        let id = LayerId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.get(&id)
    }

    pub fn layer_mut(&mut self, id: LayerId) -> Option<&mut Layer> {
        self.layers.get_mut(&id)
    }

    fn get(&self, id: LayerId) -> Result<&Layer> {
        self.layers.get(&id).ok_or(NxError::UnknownLayer(id))
    }

    fn get_mut(&mut self, id: LayerId) -> Result<&mut Layer> {
        self.layers.get_mut(&id).ok_or(NxError::UnknownLayer(id))
    }

    /// Layer IDs in insertion order.
    pub fn layer_ids(&self) -> impl Iterator<Item = LayerId> + '_ {
        self.order.iter().copied()
    }

    /// Layers in insertion order.
    pub fn layers(&self) -> impl Iterator<Item = &Layer> + '_ {
        self.order.iter().map(|id| &self.layers[id])
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Remove a layer. Fails while any consumer still reads one of its outputs.
    pub fn remove_layer(&mut self, id: LayerId) -> Result<Layer> {
        let layer = self.get(id)?;
        let consumers: Vec<InputSlotRef> = layer
            .output_slots()
            .iter()
            .flat_map(|s| s.connections().iter().copied())
            .collect();
        if !consumers.is_empty() {
            return Err(NxError::Structural(format!(
                "cannot remove {}: {} consumer(s) still connected to its outputs",
                layer.label(),
                consumers.len()
            )));
        }

        let feeds: Vec<(usize, OutputSlotRef)> = layer
            .input_slots()
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.connection().map(|c| (i, c)))
            .collect();
        for (index, src) in feeds {
            self.unlink(src, InputSlotRef { layer: id, index });
        }

        self.order.retain(|&other| other != id);
        let layer = self.layers.remove(&id).ok_or(NxError::UnknownLayer(id))?;
        debug!(layer = %layer.label(), "removed layer");
        Ok(layer)
    }

    /// Swap the operation of a layer, keeping its connections.
    ///
    /// The new kind must have the same slot counts. Returns the previous kind.
    pub fn replace_layer(&mut self, id: LayerId, kind: LayerKind) -> Result<LayerKind> {
        let layer = self.get_mut(id)?;
        if kind.num_inputs() != layer.num_inputs() || kind.num_outputs() != layer.num_outputs() {
            return Err(NxError::Structural(format!(
                "cannot replace {} ({} in / {} out) with {} ({} in / {} out)",
                layer.label(),
                layer.num_inputs(),
                layer.num_outputs(),
                kind.layer_type(),
                kind.num_inputs(),
                kind.num_outputs()
            )));
        }
        let previous = std::mem::replace(layer.kind_mut(), kind);
        debug!(layer = %layer.label(), "replaced layer operation");
        Ok(previous)
    }

    /// Copy a layer into `target`: same kind, a value copy of its parameters,
    /// same name, fresh unconnected slots.
    pub fn clone_layer_into(&self, id: LayerId, target: &mut Graph) -> Result<LayerId> {
        self.get(id).map(|layer| layer.clone_into(target))
    }

    /// Duplicate a layer inside this graph (unconnected).
    pub fn clone_layer(&mut self, id: LayerId) -> Result<LayerId> {
        let layer = self.get(id)?;
        let (kind, name) = (layer.kind().clone(), layer.name().to_owned());
        Ok(self.add_layer(kind, name))
    }

    // ── Connections ─────────────────────────────────────────────────────

    /// Connect an output slot to an input slot.
    ///
    /// Fails, leaving the graph unchanged, if either slot does not exist, the
    /// input is already connected, or the edge would close a cycle.
    pub fn connect(&mut self, from: OutputSlotRef, to: InputSlotRef) -> Result<()> {
        let producer = self.get(from.layer)?;
        if from.index >= producer.num_outputs() {
            return Err(NxError::Structural(format!(
                "{} has no output slot {}",
                producer.label(),
                from.index
            )));
        }
        let consumer = self.get(to.layer)?;
        let Some(slot) = consumer.input_slot(to.index) else {
            return Err(NxError::Structural(format!(
                "{} has no input slot {}",
                consumer.label(),
                to.index
            )));
        };
        if let Some(existing) = slot.connection() {
            return Err(NxError::Structural(format!(
                "input slot {} of {} is already connected to output {} of layer {}",
                to.index,
                consumer.label(),
                existing.index,
                existing.layer
            )));
        }
        if schedule::reaches(self, to.layer, from.layer) {
            return Err(NxError::Structural(format!(
                "connecting {} to {} would create a cycle",
                producer.label(),
                consumer.label()
            )));
        }

        self.link(from, to);
        trace!(from = %from.layer, to = %to.layer, "connected");
        Ok(())
    }

    /// Disconnect an input slot from its producer, returning the producer slot.
    pub fn disconnect(&mut self, to: InputSlotRef) -> Result<OutputSlotRef> {
        let consumer = self.get(to.layer)?;
        let src = consumer
            .input_slot(to.index)
            .and_then(|s| s.connection())
            .ok_or_else(|| {
                NxError::Structural(format!(
                    "input slot {} of {} is not connected",
                    to.index,
                    consumer.label()
                ))
            })?;
        self.unlink(src, to);
        Ok(src)
    }

    /// Splice a new one-in/one-out layer between `to` and its producer.
    pub fn insert_new_layer_before(
        &mut self,
        to: InputSlotRef,
        kind: LayerKind,
        name: impl Into<String>,
    ) -> Result<LayerId> {
        check_spliceable(&kind)?;
        let consumer = self.get(to.layer)?;
        let src = consumer
            .input_slot(to.index)
            .and_then(|s| s.connection())
            .ok_or_else(|| {
                NxError::Structural(format!(
                    "cannot insert before unconnected input slot {} of {}",
                    to.index,
                    consumer.label()
                ))
            })?;
        let info = self.tensor_info(src).cloned();

        let id = self.splice_layer(kind, name, to.layer)?;
        self.unlink(src, to);
        self.link(src, id.input(0));
        self.link(id.output(0), to);
        self.get_mut(id)?.outputs[0].tensor_info = info;
        Ok(id)
    }

    /// Splice a new one-in/one-out layer after `from`; it takes over every
    /// consumer of `from`.
    pub fn insert_new_layer_after(
        &mut self,
        from: OutputSlotRef,
        kind: LayerKind,
        name: impl Into<String>,
    ) -> Result<LayerId> {
        check_spliceable(&kind)?;
        let producer = self.get(from.layer)?;
        let slot = producer.output_slot(from.index).ok_or_else(|| {
            NxError::Structural(format!(
                "{} has no output slot {}",
                producer.label(),
                from.index
            ))
        })?;
        let consumers: Vec<InputSlotRef> = slot.connections().to_vec();
        let info = slot.tensor_info().cloned();

        let anchor = self.position_after(from.layer);
        let id = self.alloc_id();
        let layer = Layer::new(id, kind, name);
        debug!(layer = %layer.label(), after = %from.layer, "insert layer");
        self.layers.insert(id, layer);
        self.order.insert(anchor, id);

        for &consumer in &consumers {
            self.unlink(from, consumer);
            self.link(id.output(0), consumer);
        }
        self.link(from, id.input(0));
        self.get_mut(id)?.outputs[0].tensor_info = info;
        Ok(id)
    }

    fn splice_layer(
        &mut self,
        kind: LayerKind,
        name: impl Into<String>,
        before: LayerId,
    ) -> Result<LayerId> {
        let pos = self
            .order
            .iter()
            .position(|&id| id == before)
            .ok_or(NxError::UnknownLayer(before))?;
        let id = self.alloc_id();
        let layer = Layer::new(id, kind, name);
        debug!(layer = %layer.label(), before = %before, "insert layer");
        self.layers.insert(id, layer);
        self.order.insert(pos, id);
        Ok(id)
    }

    fn position_after(&self, id: LayerId) -> usize {
        self.order
            .iter()
            .position(|&other| other == id)
            .map_or(self.order.len(), |p| p + 1)
    }

    /// Record an edge on both endpoints. Callers have validated the slots.
    fn link(&mut self, from: OutputSlotRef, to: InputSlotRef) {
        if let Some(producer) = self.layers.get_mut(&from.layer) {
            producer.outputs[from.index].connections.push(to);
        }
        if let Some(consumer) = self.layers.get_mut(&to.layer) {
            consumer.inputs[to.index].connection = Some(from);
            consumer.state = LayerState::Constructed;
        }
    }

    fn unlink(&mut self, from: OutputSlotRef, to: InputSlotRef) {
        if let Some(producer) = self.layers.get_mut(&from.layer) {
            producer.outputs[from.index].connections.retain(|c| *c != to);
        }
        if let Some(consumer) = self.layers.get_mut(&to.layer) {
            consumer.inputs[to.index].connection = None;
            consumer.state = LayerState::Constructed;
        }
    }

    // ── Tensor infos ────────────────────────────────────────────────────

    /// Declare the TensorInfo carried by an output slot.
    ///
    /// The producer and its consumers must be validated again afterwards.
    pub fn set_tensor_info(&mut self, slot: OutputSlotRef, info: TensorInfo) -> Result<()> {
        let producer = self.get_mut(slot.layer)?;
        let label = producer.label();
        let out = producer.outputs.get_mut(slot.index).ok_or_else(|| {
            NxError::Structural(format!("{label} has no output slot {}", slot.index))
        })?;
        out.tensor_info = Some(info);
        let consumers = out.connections.clone();
        producer.state = LayerState::Constructed;
        for c in consumers {
            if let Some(layer) = self.layers.get_mut(&c.layer) {
                layer.state = LayerState::Constructed;
            }
        }
        Ok(())
    }

    pub fn tensor_info(&self, slot: OutputSlotRef) -> Option<&TensorInfo> {
        self.layers
            .get(&slot.layer)?
            .output_slot(slot.index)?
            .tensor_info()
    }

    /// TensorInfos currently flowing into a layer's inputs, in slot order.
    pub fn input_tensor_infos(&self, id: LayerId) -> Result<Vec<TensorInfo>> {
        let layer = self.get(id)?;
        layer
            .input_slots()
            .iter()
            .enumerate()
            .map(|(i, slot)| {
                let src = slot.connection().ok_or_else(|| NxError::LayerValidation {
                    layer: layer.label(),
                    reason: format!("input slot {i} is not connected"),
                })?;
                self.tensor_info(src)
                    .cloned()
                    .ok_or_else(|| NxError::LayerValidation {
                        layer: layer.label(),
                        reason: format!(
                            "input slot {i} is fed by output {} of layer {} which has no TensorInfo",
                            src.index, src.layer
                        ),
                    })
            })
            .collect()
    }

    // ── Validation ──────────────────────────────────────────────────────

    /// Topological order over all layers; stable w.r.t. insertion order.
    pub fn topological_order(&self) -> Result<Vec<LayerId>> {
        schedule::topological_order(self)
    }

    /// Re-derive a layer's output shapes from its current inputs and compare
    /// them with the TensorInfo declared on each output slot.
    ///
    /// Raises on the first disagreement and never repairs it.
    pub fn validate_layer(&self, id: LayerId) -> Result<()> {
        let layer = self.get(id)?;
        let inputs = self.input_tensor_infos(id)?;

        layer
            .kind()
            .check_parameters()
            .map_err(|reason| NxError::LayerValidation {
                layer: layer.label(),
                reason,
            })?;

        if matches!(layer.kind(), LayerKind::Input { .. }) {
            return self.declared_output_shapes(layer).map(|_| ());
        }

        let input_shapes: Vec<TensorShape> = inputs.into_iter().map(|i| i.shape).collect();
        let inferred = layer
            .kind()
            .infer_output_shapes(&input_shapes)
            .map_err(|source| NxError::Shape {
                layer: layer.label(),
                source,
            })?;

        let declared = self.declared_output_shapes(layer)?;
        for (slot, (expected, actual)) in inferred.into_iter().zip(declared).enumerate() {
            if expected != actual {
                return Err(NxError::ShapeMismatch {
                    layer: layer.label(),
                    slot,
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    fn declared_output_shapes(&self, layer: &Layer) -> Result<Vec<TensorShape>> {
        layer
            .output_slots()
            .iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.tensor_info()
                    .map(|info| info.shape.clone())
                    .ok_or_else(|| NxError::LayerValidation {
                        layer: layer.label(),
                        reason: format!("TensorInfo not set on OutputSlot[{i}]"),
                    })
            })
            .collect()
    }

    /// Validate every layer in topological order, marking each one
    /// shape-resolved as it passes.
    pub fn validate_tensor_shapes(&mut self) -> Result<()> {
        for id in self.topological_order()? {
            if let Err(err) = self.validate_layer(id) {
                debug!(layer = %id, error = %err, "shape validation failed");
                return Err(err);
            }
            let layer = self.get_mut(id)?;
            if layer.state == LayerState::Constructed {
                layer.state = LayerState::ShapeResolved;
            }
        }
        Ok(())
    }

    /// Fill every non-input output slot with the inferred TensorInfo.
    ///
    /// Element type and quantization follow the layer's first input. Input
    /// layers must already carry a caller-provided TensorInfo.
    pub fn infer_tensor_infos(&mut self) -> Result<()> {
        for id in self.topological_order()? {
            let layer = self.get(id)?;
            if matches!(layer.kind(), LayerKind::Input { .. }) {
                self.declared_output_shapes(layer)?;
                continue;
            }
            let inputs = self.input_tensor_infos(id)?;
            let shapes: Vec<TensorShape> = inputs.iter().map(|i| i.shape.clone()).collect();
            let inferred = layer
                .kind()
                .infer_output_shapes(&shapes)
                .map_err(|source| NxError::Shape {
                    layer: layer.label(),
                    source,
                })?;
            let template = &inputs[0];

            let layer = self.get_mut(id)?;
            for (slot, shape) in layer.outputs.iter_mut().zip(inferred) {
                slot.tensor_info = Some(TensorInfo {
                    shape,
                    ..template.clone()
                });
            }
            layer.state = LayerState::Constructed;
        }
        Ok(())
    }

    /// Resolved input/output TensorInfos of a shape-resolved layer.
    pub fn workload_info(&self, id: LayerId) -> Result<WorkloadInfo> {
        let layer = self.get(id)?;
        if layer.state() == LayerState::Constructed {
            return Err(NxError::LayerValidation {
                layer: layer.label(),
                reason: "layer has not been shape-resolved".into(),
            });
        }
        let input_infos = self.input_tensor_infos(id)?;
        let output_infos = layer
            .output_slots()
            .iter()
            .filter_map(|s| s.tensor_info().cloned())
            .collect();
        Ok(WorkloadInfo {
            input_infos,
            output_infos,
        })
    }

    pub(crate) fn mark_workload_bound(&mut self, id: LayerId) -> Result<()> {
        self.get_mut(id)?.state = LayerState::WorkloadBound;
        Ok(())
    }
}

impl Layer {
    /// Structurally identical copy of this layer in `graph`, with fresh,
    /// unconnected slots. Connections are not copied.
    pub fn clone_into(&self, graph: &mut Graph) -> LayerId {
        graph.add_layer(self.kind.clone(), self.name.clone())
    }
}

fn check_spliceable(kind: &LayerKind) -> Result<()> {
    if kind.num_inputs() != 1 || kind.num_outputs() != 1 {
        return Err(NxError::Structural(format!(
            "only single-input, single-output layers can be spliced into an edge, got {}",
            kind.layer_type()
        )));
    }
    Ok(())
}
