//! 2D pooling output shape arithmetic.

use super::ShapeError;
use crate::descriptors::{OutputShapeRounding, Pooling2dDescriptor};
use crate::types::TensorShape;

/// Pooled extent along one spatial axis.
///
/// `out = round((in + low + high - pool) / stride) + 1`, then decremented by
/// one when the last window would start at or beyond `in + low`, so that no
/// window begins inside the high padding.
pub fn pooled_extent(
    in_size: u32,
    low_pad: u32,
    high_pad: u32,
    pool_size: u32,
    stride: u32,
    rounding: OutputShapeRounding,
) -> Result<u32, ShapeError> {
    if stride == 0 {
        return Err(ShapeError::InvalidConfiguration(
            "stride can only be zero when performing global pooling".into(),
        ));
    }
    let padded = u64::from(in_size) + u64::from(low_pad) + u64::from(high_pad);
    let pool = u64::from(pool_size);
    if pool > padded {
        return Err(ShapeError::InvalidConfiguration(format!(
            "pooling window {pool_size} exceeds padded input extent {padded}"
        )));
    }
    let read_size = padded - pool;
    let stride = u64::from(stride);

    let mut size = match rounding {
        OutputShapeRounding::Ceiling => read_size.div_ceil(stride) + 1,
        OutputShapeRounding::Floor => read_size / stride + 1,
    };

    if (size - 1) * stride >= u64::from(in_size) + u64::from(low_pad) {
        size -= 1;
    }

    u32::try_from(size)
        .map_err(|_| ShapeError::InvalidConfiguration(format!("pooled extent {size} overflows")))
}

pub(super) fn infer(
    desc: &Pooling2dDescriptor,
    input: &TensorShape,
) -> Result<TensorShape, ShapeError> {
    if input.num_dimensions() != 4 {
        return Err(ShapeError::Rank {
            expected: 4,
            actual: input.num_dimensions(),
        });
    }

    let (in_batch, in_channels, in_height, in_width) = (input[0], input[1], input[2], input[3]);

    let (out_height, out_width) = if desc.is_global() {
        (1, 1)
    } else {
        let out_width = pooled_extent(
            in_width,
            desc.pad_left,
            desc.pad_right,
            desc.pool_width,
            desc.stride_x,
            desc.output_shape_rounding,
        )?;
        let out_height = pooled_extent(
            in_height,
            desc.pad_top,
            desc.pad_bottom,
            desc.pool_height,
            desc.stride_y,
            desc.output_shape_rounding,
        )?;
        (out_height, out_width)
    };

    Ok(TensorShape::new([in_batch, in_channels, out_height, out_width]))
}
