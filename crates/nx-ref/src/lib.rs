//! Pure Rust CPU backend: the correctness oracle for every other backend.
//!
//! Every layer kind is evaluated by self-contained kernels in [`kernels`].
//! The factory accepts any Float32 configuration and only binds
//! [`CpuTensorHandle`](nx_core::CpuTensorHandle)s.

pub mod kernels;
mod workload;

use std::sync::Arc;

use tracing::debug;

use nx_core::backend::require_data_type;
use nx_core::config::REF_BACKEND;
use nx_core::descriptors::LstmActivation;
use nx_core::{
    BackendId, BackendRegistry, DataType, LayerKind, QueueDescriptor, Result, Support, TensorInfo,
    Workload, WorkloadFactory, WorkloadInfo,
};

pub use workload::RefWorkload;

/// Reference workload factory.
#[derive(Debug, Default, Clone, Copy)]
pub struct RefWorkloadFactory;

impl WorkloadFactory for RefWorkloadFactory {
    fn backend_id(&self) -> BackendId {
        REF_BACKEND
    }

    fn is_supported(
        &self,
        layer: &LayerKind,
        inputs: &[TensorInfo],
        outputs: &[TensorInfo],
    ) -> Support {
        if layer.is_binding() {
            return Support::unsupported("binding layers have no workload");
        }
        if let LayerKind::Lstm { descriptor, .. } = layer
            && let Err(err) = LstmActivation::try_from(descriptor.activation_func)
        {
            return Support::Unsupported(err.to_string());
        }
        require_data_type(inputs, DataType::Float32, REF_BACKEND)
            .and_then(|| require_data_type(outputs, DataType::Float32, REF_BACKEND))
    }

    fn create_workload(
        &self,
        descriptor: QueueDescriptor,
        info: WorkloadInfo,
    ) -> Result<Box<dyn Workload>> {
        descriptor.validate(&info)?;
        if let LayerKind::Lstm { descriptor: lstm, .. } = &descriptor.layer {
            LstmActivation::try_from(lstm.activation_func)?;
        }
        let workload = RefWorkload::new(descriptor.layer, descriptor.inputs, descriptor.outputs)?;
        debug!(workload = workload.name(), "created reference workload");
        Ok(Box::new(workload))
    }
}

/// Registry holding only the reference backend.
pub fn ref_registry() -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    registry.register(Arc::new(RefWorkloadFactory));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use nx_core::descriptors::{ActivationDescriptor, ActivationFunction, LstmDescriptor, LstmParams};

    #[test]
    fn test_rejects_non_float() {
        let relu = LayerKind::Activation(ActivationDescriptor::new(ActivationFunction::ReLu));
        let f32_info = TensorInfo::new([4], DataType::Float32);
        let q_info = TensorInfo::new([4], DataType::QAsymm8).with_quantization(0.5, 3);

        assert!(RefWorkloadFactory
            .is_supported(&relu, &[f32_info.clone()], &[f32_info.clone()])
            .is_supported());
        match RefWorkloadFactory.is_supported(&relu, &[q_info], &[f32_info]) {
            Support::Unsupported(reason) => assert!(reason.contains("QAsymm8"), "{reason}"),
            Support::Supported => panic!("quantized input accepted"),
        }
    }

    #[test]
    fn test_lstm_activation_checked_before_create() {
        let lstm = |activation_func| LayerKind::Lstm {
            descriptor: LstmDescriptor {
                activation_func,
                ..LstmDescriptor::default()
            },
            params: Box::new(LstmParams::basic(2, 2, 2, 0.0)),
        };
        let info = TensorInfo::new([1, 2], DataType::Float32);
        let (inputs, outputs) = (vec![info.clone(); 3], vec![info; 4]);
        assert!(RefWorkloadFactory.is_supported(&lstm(4), &inputs, &outputs).is_supported());
        match RefWorkloadFactory.is_supported(&lstm(2), &inputs, &outputs) {
            Support::Unsupported(reason) => assert!(reason.contains("activation"), "{reason}"),
            Support::Supported => panic!("activation 2 accepted"),
        }
    }

    #[test]
    fn test_binding_layers_unsupported() {
        let input = LayerKind::Input { binding_id: 0 };
        assert!(!RefWorkloadFactory.is_supported(&input, &[], &[]).is_supported());
    }
}
