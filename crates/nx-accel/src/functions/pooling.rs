//! 2D pooling over NCHW tensors.

use smallvec::SmallVec;

use nx_core::descriptors::{PaddingMethod, Pooling2dDescriptor, PoolingAlgorithm};
use nx_core::{Support, TensorInfo};

use super::{NativeFunction, ensure_prepared};
use crate::staging::Operand;
use crate::{AccelError, Result};

/// Window extent along one axis, precomputed per output position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    /// First real element covered.
    start: usize,
    /// One past the last real element covered.
    end: usize,
    /// Covered positions including padding.
    padded: usize,
}

fn spans(
    out_len: usize,
    in_len: usize,
    pool: usize,
    stride: usize,
    pad_lo: usize,
    pad_hi: usize,
) -> SmallVec<[Span; 16]> {
    (0..out_len)
        .map(|o| {
            let lo = (o * stride) as isize - pad_lo as isize;
            let hi = (lo + pool as isize).min((in_len + pad_hi) as isize);
            Span {
                start: lo.clamp(0, in_len as isize) as usize,
                end: hi.clamp(0, in_len as isize) as usize,
                padded: (hi - lo).max(0) as usize,
            }
        })
        .collect()
}

#[derive(Debug)]
pub struct PoolingFunction {
    algorithm: PoolingAlgorithm,
    count_padding: bool,
    planes: usize,
    in_hw: (usize, usize),
    rows: SmallVec<[Span; 16]>,
    cols: SmallVec<[Span; 16]>,
    input: Operand,
    output: Operand,
    prepared: bool,
}

impl PoolingFunction {
    pub fn validate(desc: &Pooling2dDescriptor, input: &TensorInfo, output: &TensorInfo) -> Support {
        if desc.pool_type == PoolingAlgorithm::L2 {
            return Support::unsupported("L2 pooling has no native function");
        }
        if input.shape.num_dimensions() != 4 || output.shape.num_dimensions() != 4 {
            return Support::unsupported(format!(
                "pooling requires 4D tensors, got {} -> {}",
                input.shape, output.shape
            ));
        }
        if input.shape[0] != output.shape[0] || input.shape[1] != output.shape[1] {
            return Support::unsupported(format!(
                "pooling cannot change batch or channels ({} -> {})",
                input.shape, output.shape
            ));
        }
        if input.shape[2] == 0 || input.shape[3] == 0 {
            return Support::unsupported(format!("pooling input {} has an empty plane", input.shape));
        }
        Support::Supported
    }

    pub fn configure(desc: &Pooling2dDescriptor, input: Operand, output: Operand) -> Result<Self> {
        let (in_shape, out_shape) = (input.shape().clone(), output.shape().clone());
        if in_shape.num_dimensions() != 4 || out_shape.num_dimensions() != 4 {
            return Err(AccelError::InvalidConfiguration(format!(
                "pooling requires 4D tensors, got {in_shape} -> {out_shape}"
            )));
        }
        if desc.pool_type == PoolingAlgorithm::L2 {
            return Err(AccelError::Unsupported("L2 pooling".into()));
        }

        let d = |s: &nx_core::TensorShape, i: usize| s[i] as usize;
        let (in_h, in_w) = (d(&in_shape, 2), d(&in_shape, 3));
        let (out_h, out_w) = (d(&out_shape, 2), d(&out_shape, 3));
        if in_h == 0 || in_w == 0 {
            return Err(AccelError::ZeroLength);
        }

        let (rows, cols) = if desc.is_global() {
            (spans(out_h, in_h, in_h, 1, 0, 0), spans(out_w, in_w, in_w, 1, 0, 0))
        } else {
            (
                spans(
                    out_h,
                    in_h,
                    desc.pool_height as usize,
                    desc.stride_y as usize,
                    desc.pad_top as usize,
                    desc.pad_bottom as usize,
                ),
                spans(
                    out_w,
                    in_w,
                    desc.pool_width as usize,
                    desc.stride_x as usize,
                    desc.pad_left as usize,
                    desc.pad_right as usize,
                ),
            )
        };

        Ok(Self {
            algorithm: desc.pool_type,
            count_padding: desc.padding_method == PaddingMethod::IgnoreValue && !desc.is_global(),
            planes: d(&in_shape, 0) * d(&in_shape, 1),
            in_hw: (in_h, in_w),
            rows,
            cols,
            input,
            output,
            prepared: false,
        })
    }

    fn reduce(&self, plane: &[f32], row: Span, col: Span) -> f32 {
        let in_w = self.in_hw.1;
        let count = (row.end - row.start) * (col.end - col.start);
        if count == 0 {
            return 0.0;
        }
        let window = (row.start..row.end).flat_map(|y| &plane[y * in_w + col.start..y * in_w + col.end]);
        match self.algorithm {
            PoolingAlgorithm::Max => window.fold(f32::NEG_INFINITY, |m, &v| m.max(v)),
            _ => {
                let divisor = if self.count_padding {
                    row.padded * col.padded
                } else {
                    count
                };
                window.sum::<f32>() / divisor as f32
            }
        }
    }
}

impl NativeFunction for PoolingFunction {
    fn name(&self) -> &'static str {
        "pooling"
    }

    fn prepare(&mut self) -> Result<()> {
        self.prepared = true;
        Ok(())
    }

    fn run(&self) -> Result<()> {
        ensure_prepared(self.prepared, self.name())?;
        let src = self.input.read()?;
        let plane_len = self.in_hw.0 * self.in_hw.1;
        let mut dst = Vec::with_capacity(self.planes * self.rows.len() * self.cols.len());
        for plane in src.chunks_exact(plane_len).take(self.planes) {
            for &row in &self.rows {
                for &col in &self.cols {
                    dst.push(self.reduce(plane, row, col));
                }
            }
        }
        self.output.write(&dst)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use nx_core::tensor::as_cpu_handle;
    use nx_core::{CpuTensorHandle, DataType, TensorHandle};

    fn operand(dims: [u32; 4], data: Option<Vec<f32>>) -> (Arc<dyn TensorHandle>, Operand) {
        let info = TensorInfo::new(dims, DataType::Float32);
        let handle: Arc<dyn TensorHandle> = Arc::new(match data {
            Some(data) => CpuTensorHandle::from_f32(info, data).unwrap(),
            None => CpuTensorHandle::zeroed(info),
        });
        let op = Operand::import(Arc::clone(&handle)).unwrap();
        (handle, op)
    }

    #[test]
    fn test_spans_clip_to_padding() {
        // in 4, pool 3, stride 2, pad 1/1 -> windows [-1,2) [1,4)
        let s = spans(2, 4, 3, 2, 1, 1);
        assert_eq!(s[0], Span { start: 0, end: 2, padded: 3 });
        assert_eq!(s[1], Span { start: 1, end: 4, padded: 3 });
    }

    #[test]
    fn test_average_counts_padding_only_when_asked() {
        let data: Vec<f32> = (1..=4).map(|v| v as f32).collect();
        for (method, expected) in [(PaddingMethod::IgnoreValue, 0.25), (PaddingMethod::Exclude, 1.0)] {
            let desc = Pooling2dDescriptor {
                pool_type: PoolingAlgorithm::Average,
                pad_left: 1,
                pad_top: 1,
                padding_method: method,
                ..Pooling2dDescriptor::window(PoolingAlgorithm::Average, 2, 2)
            };
            let (_, input) = operand([1, 1, 2, 2], Some(data.clone()));
            let (out, output) = operand([1, 1, 1, 1], None);
            let mut f = PoolingFunction::configure(&desc, input, output).unwrap();
            f.prepare().unwrap();
            f.run().unwrap();
            assert_eq!(as_cpu_handle(out.as_ref()).unwrap().to_vec(), vec![expected]);
        }
    }

    #[test]
    fn test_run_before_prepare_fails() {
        let desc = Pooling2dDescriptor::window(PoolingAlgorithm::Max, 2, 2);
        let (_, input) = operand([1, 1, 2, 2], None);
        let (_, output) = operand([1, 1, 1, 1], None);
        let f = PoolingFunction::configure(&desc, input, output).unwrap();
        assert!(matches!(f.run(), Err(AccelError::Unprepared("pooling"))));
    }

    #[test]
    fn test_validate_rejects_l2() {
        let info = TensorInfo::new([1, 1, 4, 4], DataType::Float32);
        let out = TensorInfo::new([1, 1, 2, 2], DataType::Float32);
        let l2 = Pooling2dDescriptor::window(PoolingAlgorithm::L2, 2, 2);
        assert!(!PoolingFunction::validate(&l2, &info, &out).is_supported());
        let max = Pooling2dDescriptor::window(PoolingAlgorithm::Max, 2, 2);
        assert!(PoolingFunction::validate(&max, &info, &out).is_supported());
    }

    #[test]
    fn test_validate_rejects_empty_plane() {
        let desc = Pooling2dDescriptor {
            pad_left: 1,
            pad_right: 1,
            ..Pooling2dDescriptor::window(PoolingAlgorithm::Max, 2, 1)
        };
        let out = TensorInfo::new([1, 1, 1, 1], DataType::Float32);
        for dims in [[1, 1, 0, 4], [1, 1, 4, 0]] {
            let info = TensorInfo::new(dims, DataType::Float32);
            assert!(!PoolingFunction::validate(&desc, &info, &out).is_supported());
        }
        let (_, input) = operand([1, 1, 0, 4], None);
        let (_, output) = operand([1, 1, 1, 1], None);
        assert!(matches!(
            PoolingFunction::configure(&desc, input, output),
            Err(AccelError::ZeroLength)
        ));
    }
}
