//! The backend-facing payload and the runnable contract a factory returns.

use std::sync::Arc;

use crate::layers::LayerKind;
use crate::tensor::TensorHandle;
use crate::types::TensorInfo;
use crate::{NxError, Result};

/// Resolved input and output descriptors of one shape-resolved layer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkloadInfo {
    pub input_infos: Vec<TensorInfo>,
    pub output_infos: Vec<TensorInfo>,
}

/// Tensor handles for every slot plus the layer's operation and constants.
///
/// Handles are shared, never owned: the caller keeps them alive for at least
/// as long as any workload built from this descriptor.
#[derive(Clone, Debug)]
pub struct QueueDescriptor {
    pub inputs: Vec<Arc<dyn TensorHandle>>,
    pub outputs: Vec<Arc<dyn TensorHandle>>,
    pub layer: LayerKind,
}

impl QueueDescriptor {
    pub fn new(
        layer: LayerKind,
        inputs: Vec<Arc<dyn TensorHandle>>,
        outputs: Vec<Arc<dyn TensorHandle>>,
    ) -> Self {
        Self {
            inputs,
            outputs,
            layer,
        }
    }

    /// Check handle counts against the layer kind and handle shapes against
    /// the resolved descriptors.
    pub fn validate(&self, info: &WorkloadInfo) -> Result<()> {
        let name = self.layer.layer_type();
        check_side(name, "input", &self.inputs, &info.input_infos, self.layer.num_inputs())?;
        check_side(name, "output", &self.outputs, &info.output_infos, self.layer.num_outputs())
    }
}

fn check_side(
    name: crate::LayerType,
    side: &str,
    handles: &[Arc<dyn TensorHandle>],
    infos: &[TensorInfo],
    expected: usize,
) -> Result<()> {
    if handles.len() != expected || infos.len() != expected {
        return Err(NxError::LayerValidation {
            layer: name.to_string(),
            reason: format!(
                "expected {expected} {side} tensors, got {} handles and {} infos",
                handles.len(),
                infos.len()
            ),
        });
    }
    for (i, (handle, info)) in handles.iter().zip(infos).enumerate() {
        let bound = &handle.tensor_info().shape;
        if *bound != info.shape {
            return Err(NxError::LayerValidation {
                layer: name.to_string(),
                reason: format!(
                    "{side} handle {i} has shape {bound} but the layer resolved {}",
                    info.shape
                ),
            });
        }
    }
    Ok(())
}

/// Executable realization of one layer's operation on one backend.
///
/// `execute` may be called any number of times. It reads the bound input
/// handles and overwrites the bound output handles; it never changes their
/// shapes. A parameter change requires building a new workload.
pub trait Workload: Send {
    fn execute(&self) -> Result<()>;

    /// Short name for diagnostics, e.g. `RefPooling2dWorkload`.
    fn name(&self) -> &str;
}

impl std::fmt::Debug for dyn Workload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workload")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::{ActivationDescriptor, ActivationFunction};
    use crate::tensor::CpuTensorHandle;
    use crate::types::DataType;

    fn handle(dims: &[u32]) -> Arc<dyn TensorHandle> {
        Arc::new(CpuTensorHandle::zeroed(TensorInfo::new(dims, DataType::Float32)))
    }

    fn info(dims: &[u32]) -> TensorInfo {
        TensorInfo::new(dims, DataType::Float32)
    }

    #[test]
    fn test_validate_accepts_matching_handles() {
        let desc = QueueDescriptor::new(
            LayerKind::Activation(ActivationDescriptor::new(ActivationFunction::ReLu)),
            vec![handle(&[2, 3])],
            vec![handle(&[2, 3])],
        );
        let wi = WorkloadInfo {
            input_infos: vec![info(&[2, 3])],
            output_infos: vec![info(&[2, 3])],
        };
        desc.validate(&wi).unwrap();
    }

    #[test]
    fn test_validate_rejects_count_and_shape() {
        let relu = LayerKind::Activation(ActivationDescriptor::new(ActivationFunction::ReLu));
        let wi = WorkloadInfo {
            input_infos: vec![info(&[2, 3])],
            output_infos: vec![info(&[2, 3])],
        };

        let missing = QueueDescriptor::new(relu.clone(), vec![], vec![handle(&[2, 3])]);
        assert!(missing.validate(&wi).is_err());

        let reshaped = QueueDescriptor::new(relu, vec![handle(&[3, 2])], vec![handle(&[2, 3])]);
        assert!(reshaped.validate(&wi).is_err());
    }
}
