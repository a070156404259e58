use std::sync::Arc;

use tracing::debug;

use nx_core::backend::require_data_type;
use nx_core::config::ACCEL_BACKEND;
use nx_core::{
    BackendId, DataType, LayerKind, QueueDescriptor, Support, TensorInfo, Workload,
    WorkloadFactory, WorkloadInfo,
};

use crate::context::{AccelContext, StagingTelemetry};
use crate::functions::{ElementwiseFunction, LstmFunction, PoolingFunction, SoftmaxFunction};
use crate::workloads::{AccelLstmWorkload, AccelWorkload};

/// Factory for the staged accelerator backend.
///
/// Float32 only. Pooling (max, average), a subset of activations, 2D
/// softmax and LSTM have native functions; every other configuration is
/// reported unsupported.
#[derive(Debug, Clone)]
pub struct AccelWorkloadFactory {
    ctx: Arc<AccelContext>,
}

impl Default for AccelWorkloadFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl AccelWorkloadFactory {
    pub fn new() -> Self {
        Self::with_context(AccelContext::new())
    }

    pub fn with_context(ctx: Arc<AccelContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<AccelContext> {
        &self.ctx
    }

    pub fn telemetry(&self) -> StagingTelemetry {
        self.ctx.telemetry()
    }
}

fn single_io<'a>(
    inputs: &'a [TensorInfo],
    outputs: &'a [TensorInfo],
    check: impl FnOnce(&'a TensorInfo, &'a TensorInfo) -> Support,
) -> Support {
    match (inputs, outputs) {
        ([input], [output]) => check(input, output),
        _ => Support::unsupported(format!(
            "expected one input and one output, got {} and {}",
            inputs.len(),
            outputs.len()
        )),
    }
}

impl WorkloadFactory for AccelWorkloadFactory {
    fn backend_id(&self) -> BackendId {
        ACCEL_BACKEND
    }

    fn is_supported(&self, layer: &LayerKind, inputs: &[TensorInfo], outputs: &[TensorInfo]) -> Support {
        let data_types = require_data_type(inputs, DataType::Float32, ACCEL_BACKEND)
            .and_then(|| require_data_type(outputs, DataType::Float32, ACCEL_BACKEND));
        if !data_types.is_supported() {
            return data_types;
        }
        match layer {
            LayerKind::Pooling2d(desc) => {
                single_io(inputs, outputs, |i, o| PoolingFunction::validate(desc, i, o))
            }
            LayerKind::Activation(desc) => {
                single_io(inputs, outputs, |i, o| ElementwiseFunction::validate(desc, i, o))
            }
            LayerKind::Softmax(desc) => {
                single_io(inputs, outputs, |i, o| SoftmaxFunction::validate(desc, i, o))
            }
            LayerKind::Lstm { descriptor, params } => {
                LstmFunction::validate(descriptor, params, inputs, outputs)
            }
            other => Support::unsupported(format!(
                "{} has no native function",
                other.layer_type()
            )),
        }
    }

    fn create_workload(
        &self,
        descriptor: QueueDescriptor,
        info: WorkloadInfo,
    ) -> nx_core::Result<Box<dyn Workload>> {
        let workload: Box<dyn Workload> = if matches!(descriptor.layer, LayerKind::Lstm { .. }) {
            Box::new(AccelLstmWorkload::new(Arc::clone(&self.ctx), descriptor, &info)?)
        } else {
            Box::new(AccelWorkload::new(descriptor, &info)?)
        };
        debug!(
            workload = workload.name(),
            live_bytes = self.ctx.telemetry().live_bytes,
            "created accelerator workload"
        );
        Ok(workload)
    }
}
