//! Workloads wrapping a configured, prepared native function.

use std::sync::Arc;

use tracing::debug;

use nx_core::descriptors::LstmActivation;
use nx_core::{LayerKind, NxError, QueueDescriptor, TensorHandle, Workload, WorkloadInfo};

use crate::context::AccelContext;
use crate::functions::LstmTensor;
use crate::functions::{
    ElementwiseFunction, LstmFunction, LstmOperands, LstmWeights, NativeFunction, PoolingFunction,
    SoftmaxFunction,
};
use crate::staging::Operand;
use crate::{AccelError, Result};

fn single(handles: &[Arc<dyn TensorHandle>], what: &str) -> Result<Operand> {
    match handles {
        [handle] => Operand::import(Arc::clone(handle)),
        _ => Err(AccelError::InvalidConfiguration(format!(
            "expected one {what} tensor, got {}",
            handles.len()
        ))),
    }
}

/// Stateless single-input workload: pooling, activation, softmax.
#[derive(Debug)]
pub struct AccelWorkload {
    name: String,
    function: Box<dyn NativeFunction>,
}

impl AccelWorkload {
    pub fn new(descriptor: QueueDescriptor, info: &WorkloadInfo) -> nx_core::Result<Self> {
        descriptor.validate(info)?;
        let input = single(&descriptor.inputs, "input")?;
        let output = single(&descriptor.outputs, "output")?;
        let mut function: Box<dyn NativeFunction> = match &descriptor.layer {
            LayerKind::Pooling2d(desc) => Box::new(PoolingFunction::configure(desc, input, output)?),
            LayerKind::Activation(desc) => {
                Box::new(ElementwiseFunction::configure(*desc, input, output)?)
            }
            LayerKind::Softmax(desc) => Box::new(SoftmaxFunction::configure(desc, input, output)?),
            other => {
                return Err(AccelError::Unsupported(format!(
                    "{} has no single-input native function",
                    other.layer_type()
                ))
                .into());
            }
        };
        function.prepare()?;
        Ok(Self {
            name: format!("Accel{}Workload", descriptor.layer.layer_type()),
            function,
        })
    }
}

impl Workload for AccelWorkload {
    fn execute(&self) -> nx_core::Result<()> {
        Ok(self.function.run()?)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// LSTM workload owning its staged weights.
///
/// Only tensors the configured function reads survive construction;
/// [`retained_tensors`](Self::retained_tensors) lists them.
#[derive(Debug)]
pub struct AccelLstmWorkload {
    function: LstmFunction,
    weights: LstmWeights,
}

impl AccelLstmWorkload {
    pub fn new(
        ctx: Arc<AccelContext>,
        descriptor: QueueDescriptor,
        info: &WorkloadInfo,
    ) -> nx_core::Result<Self> {
        descriptor.validate(info)?;
        let LayerKind::Lstm {
            descriptor: lstm,
            params,
        } = &descriptor.layer
        else {
            return Err(NxError::InvalidParameter(format!(
                "LSTM workload built for {}",
                descriptor.layer.layer_type()
            )));
        };
        let activation = LstmActivation::try_from(lstm.activation_func)?;

        let mut weights = LstmWeights::allocate(&ctx, lstm, params)?;
        let operands = LstmOperands::import(&descriptor.inputs, &descriptor.outputs)?;
        let mut function = LstmFunction::configure(ctx, *lstm, activation, &weights, operands)?;

        let released = weights.release_unreferenced();
        if !released.is_empty() {
            debug!(?released, "released unreferenced LSTM staging tensors");
        }
        function.prepare()?;
        Ok(Self { function, weights })
    }

    pub fn retained_tensors(&self) -> Vec<LstmTensor> {
        self.weights.allocated()
    }
}

impl Workload for AccelLstmWorkload {
    fn execute(&self) -> nx_core::Result<()> {
        Ok(self.function.run()?)
    }

    fn name(&self) -> &str {
        "AccelLstmWorkload"
    }
}
