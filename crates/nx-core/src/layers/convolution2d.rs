//! 2D convolution output shape arithmetic (NCHW, weights `[O, I, kH, kW]`).

use super::ShapeError;
use crate::descriptors::Convolution2dDescriptor;
use crate::tensor::ConstTensor;
use crate::types::TensorShape;

fn conv_extent(in_size: u32, low_pad: u32, high_pad: u32, kernel: u32, stride: u32) -> Result<u32, ShapeError> {
    let padded = u64::from(in_size) + u64::from(low_pad) + u64::from(high_pad);
    let kernel = u64::from(kernel);
    if kernel > padded {
        return Err(ShapeError::InvalidConfiguration(format!(
            "kernel extent {kernel} exceeds padded input extent {padded}"
        )));
    }
    let size = (padded - kernel) / u64::from(stride) + 1;
    u32::try_from(size)
        .map_err(|_| ShapeError::InvalidConfiguration(format!("convolved extent {size} overflows")))
}

pub(super) fn infer(
    desc: &Convolution2dDescriptor,
    weights: &ConstTensor,
    bias: Option<&ConstTensor>,
    input: &TensorShape,
) -> Result<TensorShape, ShapeError> {
    if input.num_dimensions() != 4 {
        return Err(ShapeError::Rank {
            expected: 4,
            actual: input.num_dimensions(),
        });
    }
    let filter = &weights.info().shape;
    if filter.num_dimensions() != 4 {
        return Err(ShapeError::Mismatch(format!(
            "convolution weights must be 4D [O, I, kH, kW], got {filter}"
        )));
    }
    if desc.stride_x == 0 || desc.stride_y == 0 {
        return Err(ShapeError::InvalidConfiguration(
            "convolution strides must be non-zero".into(),
        ));
    }
    if filter[1] != input[1] {
        return Err(ShapeError::Mismatch(format!(
            "weights expect {} input channels, input {input} has {}",
            filter[1], input[1]
        )));
    }
    if let Some(bias) = bias
        && bias.info().shape != TensorShape::new([filter[0]])
    {
        return Err(ShapeError::Mismatch(format!(
            "bias shape {} does not match {} output channels",
            bias.info().shape,
            filter[0]
        )));
    }

    let out_height = conv_extent(input[2], desc.pad_top, desc.pad_bottom, filter[2], desc.stride_y)?;
    let out_width = conv_extent(input[3], desc.pad_left, desc.pad_right, filter[3], desc.stride_x)?;

    Ok(TensorShape::new([input[0], filter[0], out_height, out_width]))
}
