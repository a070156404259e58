//! Compile a validated graph into per-layer workloads and run them.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::backend::{BackendId, BackendRegistry, Support, WorkloadFactory};
use crate::graph::Graph;
use crate::layer::{LayerId, OutputSlotRef};
use crate::layers::LayerKind;
use crate::tensor::{CpuTensorHandle, TensorHandle};
use crate::workload::{QueueDescriptor, Workload};
use crate::{NxError, Result};

/// Tensor memory for every output slot of a graph, owned by the caller.
pub type TensorHandles = HashMap<OutputSlotRef, Arc<dyn TensorHandle>>;

/// Zeroed host-memory handles for every output slot of `graph`.
///
/// Every output slot must carry a TensorInfo.
pub fn allocate_cpu_tensor_handles(graph: &Graph) -> Result<TensorHandles> {
    let mut handles = TensorHandles::new();
    for layer in graph.layers() {
        for (index, slot) in layer.output_slots().iter().enumerate() {
            let info = slot.tensor_info().ok_or_else(|| NxError::LayerValidation {
                layer: layer.label(),
                reason: format!("TensorInfo not set on OutputSlot[{index}]"),
            })?;
            let handle: Arc<dyn TensorHandle> = Arc::new(CpuTensorHandle::zeroed(info.clone()));
            handles.insert(layer.id().output(index), handle);
        }
    }
    Ok(handles)
}

struct LoadedLayer {
    layer: LayerId,
    backend: BackendId,
    workload: Box<dyn Workload>,
}

/// A graph compiled into workloads, in execution order.
pub struct LoadedNetwork {
    layers: Vec<LoadedLayer>,
    inputs: HashMap<u32, Arc<dyn TensorHandle>>,
    outputs: HashMap<u32, Arc<dyn TensorHandle>>,
    /// Keeps every bound handle alive for as long as the workloads.
    handles: TensorHandles,
}

impl LoadedNetwork {
    /// Validate `graph`, pick a backend for every operation layer and build
    /// its workload.
    ///
    /// Backends are tried in registry preference order; the first one whose
    /// capability check passes builds the workload. A backend that rejects a
    /// layer is never asked to build it.
    pub fn load(graph: &mut Graph, registry: &BackendRegistry, handles: TensorHandles) -> Result<Self> {
        graph.validate_tensor_shapes()?;

        let mut layers = Vec::new();
        let mut inputs = HashMap::new();
        let mut outputs = HashMap::new();

        for id in graph.topological_order()? {
            let layer = graph.layer(id).ok_or(NxError::UnknownLayer(id))?;
            let label = layer.label();
            let kind = layer.kind().clone();

            let in_handles = layer
                .input_slots()
                .iter()
                .map(|slot| {
                    slot.connection()
                        .and_then(|src| handles.get(&src).cloned())
                        .ok_or_else(|| missing_handle(&label, "input"))
                })
                .collect::<Result<Vec<_>>>()?;
            let out_handles = (0..layer.num_outputs())
                .map(|i| {
                    handles
                        .get(&id.output(i))
                        .cloned()
                        .ok_or_else(|| missing_handle(&label, "output"))
                })
                .collect::<Result<Vec<_>>>()?;

            match kind {
                LayerKind::Input { binding_id } => {
                    inputs.insert(binding_id, out_handles[0].clone());
                    continue;
                }
                LayerKind::Output { binding_id } => {
                    outputs.insert(binding_id, in_handles[0].clone());
                    continue;
                }
                _ => {}
            }

            let info = graph.workload_info(id)?;
            let factory = select_backend(registry, &label, &kind, &info.input_infos, &info.output_infos)?;
            let backend = factory.backend_id();

            let descriptor = QueueDescriptor::new(kind, in_handles, out_handles);
            descriptor.validate(&info)?;
            let workload = factory.create_workload(descriptor, info)?;
            info!(layer = %label, backend = %backend, workload = workload.name(), "workload created");

            graph.mark_workload_bound(id)?;
            layers.push(LoadedLayer {
                layer: id,
                backend,
                workload,
            });
        }

        Ok(Self {
            layers,
            inputs,
            outputs,
            handles,
        })
    }

    /// Like [`load`](Self::load), allocating zeroed host handles for every
    /// slot. Input and output shapes must be inferable from the graph.
    pub fn load_with_cpu_handles(graph: &mut Graph, registry: &BackendRegistry) -> Result<Self> {
        graph.validate_tensor_shapes()?;
        let handles = allocate_cpu_tensor_handles(graph)?;
        Self::load(graph, registry, handles)
    }

    /// Run every workload once, in topological order.
    pub fn execute(&self) -> Result<()> {
        for entry in &self.layers {
            trace!(layer = %entry.layer, workload = entry.workload.name(), "execute");
            entry.workload.execute()?;
        }
        Ok(())
    }

    /// Backend chosen for `layer`, if it was compiled.
    pub fn backend_for(&self, layer: LayerId) -> Option<BackendId> {
        self.layers
            .iter()
            .find(|e| e.layer == layer)
            .map(|e| e.backend)
    }

    /// `(layer, backend, workload name)` in execution order.
    pub fn workloads(&self) -> impl Iterator<Item = (LayerId, BackendId, &str)> + '_ {
        self.layers
            .iter()
            .map(|e| (e.layer, e.backend, e.workload.name()))
    }

    /// Handle bound to the Input layer with `binding_id`.
    pub fn input_handle(&self, binding_id: u32) -> Option<&Arc<dyn TensorHandle>> {
        self.inputs.get(&binding_id)
    }

    /// Handle read by the Output layer with `binding_id`.
    pub fn output_handle(&self, binding_id: u32) -> Option<&Arc<dyn TensorHandle>> {
        self.outputs.get(&binding_id)
    }

    pub fn handle(&self, slot: OutputSlotRef) -> Option<&Arc<dyn TensorHandle>> {
        self.handles.get(&slot)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl std::fmt::Debug for LoadedNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedNetwork")
            .field("workloads", &self.layers.len())
            .finish_non_exhaustive()
    }
}

fn missing_handle(label: &str, side: &str) -> NxError {
    NxError::LayerValidation {
        layer: label.to_owned(),
        reason: format!("no tensor handle bound for an {side} slot"),
    }
}

fn select_backend<'r>(
    registry: &'r BackendRegistry,
    label: &str,
    kind: &LayerKind,
    inputs: &[crate::TensorInfo],
    outputs: &[crate::TensorInfo],
) -> Result<&'r Arc<dyn WorkloadFactory>> {
    let mut reasons = Vec::new();
    for factory in registry.factories() {
        match factory.is_supported(kind, inputs, outputs) {
            Support::Supported => return Ok(factory),
            Support::Unsupported(reason) => {
                debug!(layer = %label, backend = %factory.backend_id(), %reason, "backend rejected layer");
                reasons.push(format!("{}: {reason}", factory.backend_id()));
            }
        }
    }
    Err(NxError::UnsupportedLayer {
        layer: label.to_owned(),
        reasons,
    })
}
