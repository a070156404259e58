//! Fully connected output shape: `[batch, ...] -> [batch, numOutputs]`.

use super::ShapeError;
use crate::descriptors::FullyConnectedDescriptor;
use crate::tensor::ConstTensor;
use crate::types::TensorShape;

pub(super) fn infer(
    desc: &FullyConnectedDescriptor,
    weights: &ConstTensor,
    bias: Option<&ConstTensor>,
    input: &TensorShape,
) -> Result<TensorShape, ShapeError> {
    if input.num_dimensions() < 2 {
        return Err(ShapeError::Rank {
            expected: 2,
            actual: input.num_dimensions(),
        });
    }
    let w = &weights.info().shape;
    if w.num_dimensions() != 2 {
        return Err(ShapeError::Mismatch(format!(
            "fully connected weights must be 2D, got {w}"
        )));
    }

    let batch = input[0];
    let input_size = input.dims()[1..]
        .iter()
        .try_fold(1u32, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| {
            ShapeError::InvalidConfiguration(format!("flattened input {input} overflows"))
        })?;
    let (weight_inputs, num_outputs) = if desc.transpose_weight_matrix {
        (w[1], w[0])
    } else {
        (w[0], w[1])
    };

    if weight_inputs != input_size {
        return Err(ShapeError::Mismatch(format!(
            "weights {w} expect {weight_inputs} inputs, input {input} flattens to {input_size}"
        )));
    }
    if let Some(bias) = bias
        && bias.info().shape != TensorShape::new([num_outputs])
    {
        return Err(ShapeError::Mismatch(format!(
            "bias shape {} does not match {num_outputs} outputs",
            bias.info().shape
        )));
    }

    Ok(TensorShape::new([batch, num_outputs]))
}
