use std::sync::Arc;

use nx_core::tensor::as_cpu_handle;
use nx_core::{CpuTensorHandle, LayerKind, Result, TensorHandle, TensorShape, Workload};

use crate::kernels::{self, KernelInput, kernel_error};

/// One layer evaluated by the reference kernels on host-memory handles.
pub struct RefWorkload {
    name: String,
    layer: LayerKind,
    inputs: Vec<Arc<dyn TensorHandle>>,
    outputs: Vec<Arc<dyn TensorHandle>>,
    output_shapes: Vec<TensorShape>,
}

impl RefWorkload {
    pub(crate) fn new(
        layer: LayerKind,
        inputs: Vec<Arc<dyn TensorHandle>>,
        outputs: Vec<Arc<dyn TensorHandle>>,
    ) -> Result<Self> {
        for handle in inputs.iter().chain(&outputs) {
            cpu(handle)?;
        }
        let output_shapes = outputs
            .iter()
            .map(|h| h.tensor_info().shape.clone())
            .collect();
        Ok(Self {
            name: format!("Ref{}Workload", layer.layer_type()),
            layer,
            inputs,
            outputs,
            output_shapes,
        })
    }
}

fn cpu(handle: &Arc<dyn TensorHandle>) -> Result<&CpuTensorHandle> {
    as_cpu_handle(handle.as_ref())
        .ok_or_else(|| kernel_error(format!("unsupported tensor handle {handle:?}")))
}

impl Workload for RefWorkload {
    fn execute(&self) -> Result<()> {
        let results = {
            let guards = self
                .inputs
                .iter()
                .map(|h| cpu(h).map(|c| (c.read(), &c.tensor_info().shape)))
                .collect::<Result<Vec<_>>>()?;
            let inputs: Vec<KernelInput<'_>> = guards
                .iter()
                .map(|(data, shape)| KernelInput {
                    data: data.as_slice(),
                    shape,
                })
                .collect();
            kernels::eval_layer(&self.layer, &inputs, &self.output_shapes)?
        };

        for (handle, data) in self.outputs.iter().zip(results) {
            cpu(handle)?.copy_from(&data)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
