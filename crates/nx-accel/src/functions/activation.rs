//! Elementwise activation and row softmax.

use nx_core::descriptors::{ActivationDescriptor, ActivationFunction, SoftmaxDescriptor};
use nx_core::{Support, TensorInfo};

use super::{NativeFunction, ensure_prepared};
use crate::staging::Operand;
use crate::{AccelError, Result};

const NATIVE_ACTIVATIONS: [ActivationFunction; 6] = [
    ActivationFunction::ReLu,
    ActivationFunction::BoundedReLu,
    ActivationFunction::Sigmoid,
    ActivationFunction::TanH,
    ActivationFunction::Linear,
    ActivationFunction::Abs,
];

#[derive(Debug)]
pub struct ElementwiseFunction {
    descriptor: ActivationDescriptor,
    input: Operand,
    output: Operand,
    prepared: bool,
}

impl ElementwiseFunction {
    pub fn validate(desc: &ActivationDescriptor, input: &TensorInfo, output: &TensorInfo) -> Support {
        if !NATIVE_ACTIVATIONS.contains(&desc.function) {
            return Support::unsupported(format!("{:?} activation has no native function", desc.function));
        }
        if input.shape != output.shape {
            return Support::unsupported(format!(
                "activation output {} differs from input {}",
                output.shape, input.shape
            ));
        }
        Support::Supported
    }

    pub fn configure(descriptor: ActivationDescriptor, input: Operand, output: Operand) -> Result<Self> {
        if !NATIVE_ACTIVATIONS.contains(&descriptor.function) {
            return Err(AccelError::Unsupported(format!("{:?} activation", descriptor.function)));
        }
        if input.shape() != output.shape() {
            return Err(AccelError::InvalidConfiguration(format!(
                "activation output {} differs from input {}",
                output.shape(),
                input.shape()
            )));
        }
        Ok(Self {
            descriptor,
            input,
            output,
            prepared: false,
        })
    }
}

impl NativeFunction for ElementwiseFunction {
    fn name(&self) -> &'static str {
        "activation"
    }

    fn prepare(&mut self) -> Result<()> {
        self.prepared = true;
        Ok(())
    }

    fn run(&self) -> Result<()> {
        ensure_prepared(self.prepared, self.name())?;
        let mut data = self.input.read()?;
        data.iter_mut().for_each(|x| *x = self.descriptor.apply(*x));
        self.output.write(&data)
    }
}

/// Softmax along the last axis of a `[rows, cols]` tensor.
#[derive(Debug)]
pub struct SoftmaxFunction {
    beta: f32,
    cols: usize,
    input: Operand,
    output: Operand,
    prepared: bool,
}

impl SoftmaxFunction {
    pub fn validate(_desc: &SoftmaxDescriptor, input: &TensorInfo, output: &TensorInfo) -> Support {
        if input.shape.num_dimensions() != 2 {
            return Support::unsupported(format!("softmax needs a 2D input, got {}", input.shape));
        }
        if input.shape != output.shape {
            return Support::unsupported("softmax output shape differs from input");
        }
        Support::Supported
    }

    pub fn configure(desc: &SoftmaxDescriptor, input: Operand, output: Operand) -> Result<Self> {
        let shape = input.shape().clone();
        if shape.num_dimensions() != 2 || shape != *output.shape() {
            return Err(AccelError::InvalidConfiguration(format!(
                "softmax needs matching 2D tensors, got {shape} -> {}",
                output.shape()
            )));
        }
        if shape[1] == 0 {
            return Err(AccelError::ZeroLength);
        }
        Ok(Self {
            beta: desc.beta,
            cols: shape[1] as usize,
            input,
            output,
            prepared: false,
        })
    }
}

impl NativeFunction for SoftmaxFunction {
    fn name(&self) -> &'static str {
        "softmax"
    }

    fn prepare(&mut self) -> Result<()> {
        self.prepared = true;
        Ok(())
    }

    fn run(&self) -> Result<()> {
        ensure_prepared(self.prepared, self.name())?;
        let mut data = self.input.read()?;
        for row in data.chunks_exact_mut(self.cols) {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0;
            for x in row.iter_mut() {
                *x = ((*x - max) * self.beta).exp();
                sum += *x;
            }
            row.iter_mut().for_each(|x| *x /= sum);
        }
        self.output.write(&data)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use nx_core::tensor::as_cpu_handle;
    use nx_core::{CpuTensorHandle, DataType, TensorHandle};

    fn handle(dims: &[u32], data: Vec<f32>) -> Arc<dyn TensorHandle> {
        Arc::new(CpuTensorHandle::from_f32(TensorInfo::new(dims, DataType::Float32), data).unwrap())
    }

    #[test]
    fn test_bounded_relu() {
        let desc = ActivationDescriptor {
            function: ActivationFunction::BoundedReLu,
            a: 1.0,
            b: -1.0,
        };
        let input = handle(&[4], vec![-3.0, -0.5, 0.5, 3.0]);
        let output = handle(&[4], vec![0.0; 4]);
        let mut f = ElementwiseFunction::configure(
            desc,
            Operand::import(input).unwrap(),
            Operand::import(Arc::clone(&output)).unwrap(),
        )
        .unwrap();
        f.prepare().unwrap();
        f.run().unwrap();
        assert_eq!(
            as_cpu_handle(output.as_ref()).unwrap().to_vec(),
            vec![-1.0, -0.5, 0.5, 1.0]
        );
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let input = handle(&[2, 3], vec![1.0, 2.0, 3.0, -1.0, 0.0, 5.0]);
        let output = handle(&[2, 3], vec![0.0; 6]);
        let mut f = SoftmaxFunction::configure(
            &SoftmaxDescriptor::default(),
            Operand::import(input).unwrap(),
            Operand::import(Arc::clone(&output)).unwrap(),
        )
        .unwrap();
        f.prepare().unwrap();
        f.run().unwrap();
        let out = as_cpu_handle(output.as_ref()).unwrap().to_vec();
        for row in out.chunks(3) {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        }
        assert!(out[2] > out[1] && out[1] > out[0]);
    }

    #[test]
    fn test_validate_subset() {
        let info = TensorInfo::new([2, 3], DataType::Float32);
        let sqrt = ActivationDescriptor::new(ActivationFunction::Sqrt);
        assert!(!ElementwiseFunction::validate(&sqrt, &info, &info).is_supported());
        let relu = ActivationDescriptor::new(ActivationFunction::ReLu);
        assert!(ElementwiseFunction::validate(&relu, &info, &info).is_supported());

        let four_d = TensorInfo::new([1, 2, 3, 4], DataType::Float32);
        let softmax = SoftmaxDescriptor::default();
        assert!(SoftmaxFunction::validate(&softmax, &info, &info).is_supported());
        assert!(!SoftmaxFunction::validate(&softmax, &four_d, &four_d).is_supported());
    }
}
