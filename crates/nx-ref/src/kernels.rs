//! Reference kernels.
//!
//! Straightforward safe Rust for every layer kind, favouring readability over
//! speed. Tensors are dense row-major `f32`; 4D activations are NCHW.

use smallvec::SmallVec;

use nx_core::descriptors::{
    ActivationDescriptor, Convolution2dDescriptor, FullyConnectedDescriptor, LstmActivation,
    LstmDescriptor, LstmParams, PaddingMethod, PoolingAlgorithm, Pooling2dDescriptor,
    SoftmaxDescriptor,
};
use nx_core::config::REF_BACKEND;
use nx_core::{ConstTensor, LayerKind, NxError, Result, TensorShape};

/// Materialized input passed to a kernel.
pub struct KernelInput<'a> {
    pub data: &'a [f32],
    pub shape: &'a TensorShape,
}

/// Evaluate one layer. Returns one buffer per output slot, sized for the
/// matching entry of `outputs`.
pub fn eval_layer(
    layer: &LayerKind,
    inputs: &[KernelInput<'_>],
    outputs: &[TensorShape],
) -> Result<Vec<Vec<f32>>> {
    match layer {
        LayerKind::Input { .. } | LayerKind::Output { .. } => Err(kernel_error(
            "binding layers carry no computation".into(),
        )),
        LayerKind::Activation(desc) => Ok(vec![activation(desc, require_input(inputs, 0)?.data)]),
        LayerKind::Softmax(desc) => Ok(vec![softmax(desc, require_input(inputs, 0)?)?]),
        LayerKind::Addition => Ok(vec![addition(
            require_input(inputs, 0)?,
            require_input(inputs, 1)?,
            require_output(outputs, 0)?,
        )]),
        LayerKind::FullyConnected {
            descriptor,
            weights,
            bias,
        } => Ok(vec![fully_connected(
            descriptor,
            require_input(inputs, 0)?,
            weights,
            bias.as_ref(),
        )?]),
        LayerKind::Convolution2d {
            descriptor,
            weights,
            bias,
        } => Ok(vec![convolution2d(
            descriptor,
            require_input(inputs, 0)?,
            weights,
            bias.as_ref(),
            require_output(outputs, 0)?,
        )?]),
        LayerKind::Pooling2d(desc) => Ok(vec![pooling2d(
            desc,
            require_input(inputs, 0)?,
            require_output(outputs, 0)?,
        )?]),
        LayerKind::Lstm { descriptor, params } => {
            let activation = LstmActivation::try_from(descriptor.activation_func)?;
            let out = lstm(
                descriptor,
                params,
                activation,
                require_input(inputs, 0)?,
                require_input(inputs, 1)?,
                require_input(inputs, 2)?,
            )?;
            Ok(vec![out.scratch, out.output_state, out.cell_state, out.output])
        }
    }
}

pub(crate) fn kernel_error(message: String) -> NxError {
    NxError::Backend {
        backend: REF_BACKEND,
        message,
    }
}

fn require_input<'a>(inputs: &'a [KernelInput<'_>], idx: usize) -> Result<&'a KernelInput<'a>> {
    inputs
        .get(idx)
        .ok_or_else(|| kernel_error(format!("expected input at index {idx}")))
}

fn require_output(outputs: &[TensorShape], idx: usize) -> Result<&TensorShape> {
    outputs
        .get(idx)
        .ok_or_else(|| kernel_error(format!("expected output shape at index {idx}")))
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

// ── Elementwise ─────────────────────────────────────────────────────────

pub fn activation(desc: &ActivationDescriptor, data: &[f32]) -> Vec<f32> {
    data.iter().map(|&x| desc.apply(x)).collect()
}

/// Softmax over the last dimension: `exp(beta * (x - max)) / sum`.
pub fn softmax(desc: &SoftmaxDescriptor, a: &KernelInput<'_>) -> Result<Vec<f32>> {
    let dim = a
        .shape
        .dims()
        .last()
        .copied()
        .ok_or_else(|| kernel_error("softmax of a scalar".into()))? as usize;
    if dim == 0 {
        return Ok(Vec::new());
    }

    let mut data = a.data.to_vec();
    for row in data.chunks_mut(dim) {
        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum_exp = 0.0f32;
        for x in row.iter_mut() {
            *x = (desc.beta * (*x - max_val)).exp();
            sum_exp += *x;
        }
        for x in row.iter_mut() {
            *x /= sum_exp;
        }
    }
    Ok(data)
}

/// Elementwise sum with numpy-style broadcasting into `out_shape`.
pub fn addition(a: &KernelInput<'_>, b: &KernelInput<'_>, out_shape: &TensorShape) -> Vec<f32> {
    let total = out_shape.num_elements();
    let mut result = vec![0.0f32; total];
    for (flat, out) in result.iter_mut().enumerate() {
        let ia = broadcast_index(flat, out_shape, a.shape);
        let ib = broadcast_index(flat, out_shape, b.shape);
        *out = a.data[ia] + b.data[ib];
    }
    result
}

/// Map a flat index of the broadcast output to a flat index of one operand.
fn broadcast_index(out_flat: usize, out_shape: &TensorShape, in_shape: &TensorShape) -> usize {
    let out_dims = out_shape.dims();
    let in_dims = in_shape.dims();
    let pad = out_dims.len() - in_dims.len();

    let mut coords: SmallVec<[usize; 5]> = SmallVec::from_elem(0, out_dims.len());
    let mut remaining = out_flat;
    for d in (0..out_dims.len()).rev() {
        let extent = out_dims[d] as usize;
        coords[d] = remaining % extent;
        remaining /= extent;
    }

    let mut in_flat = 0usize;
    for (d, &extent) in in_dims.iter().enumerate() {
        let coord = if extent == 1 { 0 } else { coords[d + pad] };
        in_flat = in_flat * extent as usize + coord;
    }
    in_flat
}

// ── Dense ───────────────────────────────────────────────────────────────

/// `[batch, in] x W + bias`. W is `[in, out]`, or `[out, in]` when transposed.
pub fn fully_connected(
    desc: &FullyConnectedDescriptor,
    input: &KernelInput<'_>,
    weights: &ConstTensor,
    bias: Option<&ConstTensor>,
) -> Result<Vec<f32>> {
    let w_shape = &weights.info().shape;
    if w_shape.num_dimensions() != 2 {
        return Err(kernel_error(format!("weights must be 2D, got {w_shape}")));
    }
    let (k, n) = if desc.transpose_weight_matrix {
        (w_shape[1] as usize, w_shape[0] as usize)
    } else {
        (w_shape[0] as usize, w_shape[1] as usize)
    };
    let batch = input.shape[0] as usize;
    if batch * k != input.data.len() {
        return Err(kernel_error(format!(
            "input {} does not flatten to [{batch}, {k}]",
            input.shape
        )));
    }

    let w = weights.data();
    let mut out = vec![0.0f32; batch * n];
    for b in 0..batch {
        let row = &input.data[b * k..(b + 1) * k];
        for j in 0..n {
            let mut sum = bias.map_or(0.0, |bias| bias.data()[j]);
            for (p, &x) in row.iter().enumerate() {
                let wv = if desc.transpose_weight_matrix {
                    w[j * k + p]
                } else {
                    w[p * n + j]
                };
                sum += x * wv;
            }
            out[b * n + j] = sum;
        }
    }
    Ok(out)
}

/// Direct NCHW convolution with zero padding.
pub fn convolution2d(
    desc: &Convolution2dDescriptor,
    input: &KernelInput<'_>,
    weights: &ConstTensor,
    bias: Option<&ConstTensor>,
    out_shape: &TensorShape,
) -> Result<Vec<f32>> {
    if input.shape.num_dimensions() != 4 || out_shape.num_dimensions() != 4 {
        return Err(kernel_error("convolution2d requires 4D tensors".into()));
    }
    let [batch, in_c, in_h, in_w] = nchw(input.shape);
    let [_, out_c, out_h, out_w] = nchw(out_shape);
    let w_shape = &weights.info().shape;
    let (k_h, k_w) = (w_shape[2] as usize, w_shape[3] as usize);
    let (stride_y, stride_x) = (desc.stride_y as usize, desc.stride_x as usize);
    let (pad_top, pad_left) = (desc.pad_top as isize, desc.pad_left as isize);
    let w = weights.data();

    let mut out = vec![0.0f32; out_shape.num_elements()];
    for n in 0..batch {
        for o in 0..out_c {
            let b = bias.map_or(0.0, |bias| bias.data()[o]);
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut sum = b;
                    for c in 0..in_c {
                        for ky in 0..k_h {
                            let iy = (oy * stride_y + ky) as isize - pad_top;
                            if iy < 0 || iy >= in_h as isize {
                                continue;
                            }
                            for kx in 0..k_w {
                                let ix = (ox * stride_x + kx) as isize - pad_left;
                                if ix < 0 || ix >= in_w as isize {
                                    continue;
                                }
                                let x = input.data
                                    [((n * in_c + c) * in_h + iy as usize) * in_w + ix as usize];
                                sum += x * w[((o * in_c + c) * k_h + ky) * k_w + kx];
                            }
                        }
                    }
                    out[((n * out_c + o) * out_h + oy) * out_w + ox] = sum;
                }
            }
        }
    }
    Ok(out)
}

fn nchw(shape: &TensorShape) -> [usize; 4] {
    [
        shape[0] as usize,
        shape[1] as usize,
        shape[2] as usize,
        shape[3] as usize,
    ]
}

// ── Pooling ─────────────────────────────────────────────────────────────

/// 2D pooling over NCHW input into the already-inferred `out_shape`.
///
/// Windows are clipped to the padded input. With `IgnoreValue` the divisor
/// counts padding positions; with `Exclude` only real elements count. A
/// window that covers no real element produces zero.
pub fn pooling2d(
    desc: &Pooling2dDescriptor,
    input: &KernelInput<'_>,
    out_shape: &TensorShape,
) -> Result<Vec<f32>> {
    if input.shape.num_dimensions() != 4 || out_shape.num_dimensions() != 4 {
        return Err(kernel_error("pooling2d requires 4D tensors".into()));
    }
    let [batch, channels, in_h, in_w] = nchw(input.shape);
    let [_, _, out_h, out_w] = nchw(out_shape);

    let global = desc.is_global();
    let (pool_h, pool_w, stride_y, stride_x, pad_top, pad_left, pad_bottom, pad_right) = if global {
        (in_h, in_w, 1, 1, 0, 0, 0, 0)
    } else {
        (
            desc.pool_height as usize,
            desc.pool_width as usize,
            desc.stride_y as usize,
            desc.stride_x as usize,
            desc.pad_top as isize,
            desc.pad_left as isize,
            desc.pad_bottom as isize,
            desc.pad_right as isize,
        )
    };

    let mut out = vec![0.0f32; out_shape.num_elements()];
    for n in 0..batch {
        for c in 0..channels {
            let plane = &input.data[(n * channels + c) * in_h * in_w..][..in_h * in_w];
            for oy in 0..out_h {
                let y0 = (oy * stride_y) as isize - pad_top;
                let y1 = (y0 + pool_h as isize).min(in_h as isize + pad_bottom);
                for ox in 0..out_w {
                    let x0 = (ox * stride_x) as isize - pad_left;
                    let x1 = (x0 + pool_w as isize).min(in_w as isize + pad_right);
                    let padded_count = ((y1 - y0) * (x1 - x0)).max(0) as usize;

                    let (ys, ye) = (y0.max(0) as usize, y1.min(in_h as isize).max(0) as usize);
                    let (xs, xe) = (x0.max(0) as usize, x1.min(in_w as isize).max(0) as usize);

                    let mut acc = match desc.pool_type {
                        PoolingAlgorithm::Max => f32::NEG_INFINITY,
                        PoolingAlgorithm::Average | PoolingAlgorithm::L2 => 0.0,
                    };
                    let mut count = 0usize;
                    for y in ys..ye {
                        for &v in &plane[y * in_w + xs..y * in_w + xe] {
                            acc = match desc.pool_type {
                                PoolingAlgorithm::Max => acc.max(v),
                                PoolingAlgorithm::Average => acc + v,
                                PoolingAlgorithm::L2 => acc + v * v,
                            };
                            count += 1;
                        }
                    }

                    let divisor = match desc.padding_method {
                        PaddingMethod::IgnoreValue if !global => padded_count,
                        _ => count,
                    };
                    let value = if count == 0 {
                        0.0
                    } else {
                        match desc.pool_type {
                            PoolingAlgorithm::Max => acc,
                            PoolingAlgorithm::Average => acc / divisor as f32,
                            PoolingAlgorithm::L2 => (acc / divisor as f32).sqrt(),
                        }
                    };
                    out[((n * channels + c) * out_h + oy) * out_w + ox] = value;
                }
            }
        }
    }
    Ok(out)
}

// ── Recurrent ───────────────────────────────────────────────────────────

/// Results of one LSTM step.
#[derive(Debug, Clone, PartialEq)]
pub struct LstmOutputs {
    /// Activated gate values per batch row: `[input?, cell, forget, output]`.
    pub scratch: Vec<f32>,
    pub output_state: Vec<f32>,
    pub cell_state: Vec<f32>,
    pub output: Vec<f32>,
}

/// `W x` for one row of `x`, with W stored `[rows, cols]`.
fn gemv_accumulate(acc: &mut [f32], w: &ConstTensor, x: &[f32]) {
    let cols = x.len();
    for (r, a) in acc.iter_mut().enumerate() {
        let row = &w.data()[r * cols..(r + 1) * cols];
        *a += row.iter().zip(x).map(|(w, x)| w * x).sum::<f32>();
    }
}

fn clip(x: f32, threshold: f32) -> f32 {
    if threshold > 0.0 {
        x.clamp(-threshold, threshold)
    } else {
        x
    }
}

/// One LSTM cell step.
pub fn lstm(
    desc: &LstmDescriptor,
    params: &LstmParams,
    activation: LstmActivation,
    input: &KernelInput<'_>,
    output_state_in: &KernelInput<'_>,
    cell_state_in: &KernelInput<'_>,
) -> Result<LstmOutputs> {
    let dims = params.dims().map_err(kernel_error)?;
    params.check_shapes(&dims).map_err(kernel_error)?;
    let batch = input.shape.dim(0).unwrap_or(0);
    for (operand, width) in [
        (input, dims.input_size),
        (output_state_in, dims.output_size),
        (cell_state_in, dims.units),
    ] {
        if operand.shape.dims() != [batch, width] || operand.data.len() != operand.shape.num_elements() {
            return Err(kernel_error(format!(
                "LSTM operand {} does not match [{batch}, {width}]",
                operand.shape
            )));
        }
    }
    let batch = batch as usize;
    let (n_input, n_output) = (dims.input_size as usize, dims.output_size as usize);
    let units = dims.units as usize;
    let gates = if desc.cifg_enabled { 3 } else { 4 };

    let missing = |what: &str| kernel_error(format!("LSTM parameter {what} is missing"));
    let input_gate = if desc.cifg_enabled {
        None
    } else {
        Some((
            params
                .input_to_input_weights
                .as_ref()
                .ok_or_else(|| missing("input_to_input_weights"))?,
            params
                .recurrent_to_input_weights
                .as_ref()
                .ok_or_else(|| missing("recurrent_to_input_weights"))?,
            params
                .input_gate_bias
                .as_ref()
                .ok_or_else(|| missing("input_gate_bias"))?,
        ))
    };
    let peephole = if desc.peephole_enabled {
        Some((
            params
                .cell_to_forget_weights
                .as_ref()
                .ok_or_else(|| missing("cell_to_forget_weights"))?,
            params
                .cell_to_output_weights
                .as_ref()
                .ok_or_else(|| missing("cell_to_output_weights"))?,
        ))
    } else {
        None
    };
    let projection = if desc.projection_enabled {
        Some(
            params
                .projection_weights
                .as_ref()
                .ok_or_else(|| missing("projection_weights"))?,
        )
    } else {
        None
    };

    let mut out = LstmOutputs {
        scratch: vec![0.0; batch * units * gates],
        output_state: vec![0.0; batch * n_output],
        cell_state: vec![0.0; batch * units],
        output: vec![0.0; batch * n_output],
    };

    for b in 0..batch {
        let x = &input.data[b * n_input..(b + 1) * n_input];
        let h = &output_state_in.data[b * n_output..(b + 1) * n_output];
        let c_prev = &cell_state_in.data[b * units..(b + 1) * units];

        let gate = |w_x: &ConstTensor, w_h: &ConstTensor, bias: &ConstTensor| {
            let mut acc = bias.data().to_vec();
            gemv_accumulate(&mut acc, w_x, x);
            gemv_accumulate(&mut acc, w_h, h);
            acc
        };

        let mut forget = gate(
            &params.input_to_forget_weights,
            &params.recurrent_to_forget_weights,
            &params.forget_gate_bias,
        );
        let mut cell = gate(
            &params.input_to_cell_weights,
            &params.recurrent_to_cell_weights,
            &params.cell_bias,
        );
        let mut output_gate = gate(
            &params.input_to_output_weights,
            &params.recurrent_to_output_weights,
            &params.output_gate_bias,
        );

        if let Some((to_forget, _)) = peephole {
            for (f, (w, c)) in forget.iter_mut().zip(to_forget.data().iter().zip(c_prev)) {
                *f += w * c;
            }
        }
        forget.iter_mut().for_each(|f| *f = sigmoid(*f));
        cell.iter_mut().for_each(|g| *g = activation.apply(*g));

        let input_gate_values: Vec<f32> = match input_gate {
            Some((w_x, w_h, bias)) => {
                let mut i = gate(w_x, w_h, bias);
                if desc.peephole_enabled
                    && let Some(to_input) = &params.cell_to_input_weights
                {
                    for (v, (w, c)) in i.iter_mut().zip(to_input.data().iter().zip(c_prev)) {
                        *v += w * c;
                    }
                }
                i.into_iter().map(sigmoid).collect()
            }
            None => forget.iter().map(|f| 1.0 - f).collect(),
        };

        let c_new: Vec<f32> = (0..units)
            .map(|u| clip(forget[u] * c_prev[u] + input_gate_values[u] * cell[u], desc.clipping_thres_cell))
            .collect();

        if let Some((_, to_output)) = peephole {
            for (o, (w, c)) in output_gate.iter_mut().zip(to_output.data().iter().zip(&c_new)) {
                *o += w * c;
            }
        }
        output_gate.iter_mut().for_each(|o| *o = sigmoid(*o));

        let hidden: Vec<f32> = (0..units)
            .map(|u| output_gate[u] * activation.apply(c_new[u]))
            .collect();

        let h_new: Vec<f32> = match projection {
            Some(w_proj) => {
                let mut acc = params
                    .projection_bias
                    .as_ref()
                    .map_or_else(|| vec![0.0; n_output], |bias| bias.data().to_vec());
                gemv_accumulate(&mut acc, w_proj, &hidden);
                acc.into_iter()
                    .map(|v| clip(v, desc.clipping_thres_proj))
                    .collect()
            }
            None => hidden,
        };

        let scratch = &mut out.scratch[b * units * gates..(b + 1) * units * gates];
        let mut blocks = scratch.chunks_mut(units);
        if !desc.cifg_enabled
            && let Some(block) = blocks.next()
        {
            block.copy_from_slice(&input_gate_values);
        }
        for values in [&cell, &forget, &output_gate] {
            if let Some(block) = blocks.next() {
                block.copy_from_slice(values);
            }
        }

        out.cell_state[b * units..(b + 1) * units].copy_from_slice(&c_new);
        out.output_state[b * n_output..(b + 1) * n_output].copy_from_slice(&h_new);
        out.output[b * n_output..(b + 1) * n_output].copy_from_slice(&h_new);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nx_core::descriptors::{ActivationFunction, OutputShapeRounding};

    fn input<'a>(data: &'a [f32], shape: &'a TensorShape) -> KernelInput<'a> {
        KernelInput { data, shape }
    }

    #[test]
    fn test_max_pool_2x2() {
        let shape = TensorShape::new([1, 1, 4, 4]);
        let data: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let desc = Pooling2dDescriptor::window(PoolingAlgorithm::Max, 2, 2);
        let out = pooling2d(&desc, &input(&data, &shape), &TensorShape::new([1, 1, 2, 2])).unwrap();
        assert_eq!(out, vec![5.0, 7.0, 13.0, 15.0]);
    }

    #[test]
    fn test_average_pool_padding_methods() {
        // 3x3 window, stride 1, pad 1 on a 2x2 input of ones: the top-left
        // window covers 4 real elements out of 9 positions.
        let shape = TensorShape::new([1, 1, 2, 2]);
        let data = [1.0f32; 4];
        let base = Pooling2dDescriptor {
            pad_left: 1,
            pad_right: 1,
            pad_top: 1,
            pad_bottom: 1,
            ..Pooling2dDescriptor::window(PoolingAlgorithm::Average, 3, 1)
        };
        let out_shape = TensorShape::new([1, 1, 2, 2]);

        let exclude = Pooling2dDescriptor {
            padding_method: PaddingMethod::Exclude,
            ..base
        };
        let out = pooling2d(&exclude, &input(&data, &shape), &out_shape).unwrap();
        assert_eq!(out, vec![1.0; 4]);

        let ignore = Pooling2dDescriptor {
            padding_method: PaddingMethod::IgnoreValue,
            ..base
        };
        let out = pooling2d(&ignore, &input(&data, &shape), &out_shape).unwrap();
        assert!(out.iter().all(|&v| (v - 4.0 / 9.0).abs() < 1e-6), "{out:?}");
    }

    #[test]
    fn test_global_l2_pool() {
        let shape = TensorShape::new([1, 2, 1, 2]);
        let data = [3.0, 4.0, 0.0, 2.0];
        let desc = Pooling2dDescriptor {
            output_shape_rounding: OutputShapeRounding::Ceiling,
            ..Pooling2dDescriptor::window(PoolingAlgorithm::L2, 1, 0)
        };
        let out = pooling2d(&desc, &input(&data, &shape), &TensorShape::new([1, 2, 1, 1])).unwrap();
        let expected = [(12.5f32).sqrt(), (2.0f32).sqrt()];
        for (a, b) in out.iter().zip(expected) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_softmax_beta() {
        let shape = TensorShape::new([1, 2]);
        let data = [0.0, 1.0];
        let out = softmax(&SoftmaxDescriptor { beta: 2.0 }, &input(&data, &shape)).unwrap();
        let e = (2.0f32).exp();
        assert!((out[1] - e / (1.0 + e)).abs() < 1e-6);
        assert!((out.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_addition_broadcast() {
        let a_shape = TensorShape::new([2, 3]);
        let b_shape = TensorShape::new([3]);
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [10.0, 20.0, 30.0];
        let out = addition(&input(&a, &a_shape), &input(&b, &b_shape), &a_shape);
        assert_eq!(out, vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn test_fully_connected_transposed() {
        let shape = TensorShape::new([1, 2]);
        let data = [1.0, 2.0];
        // [out=3, in=2]
        let weights = ConstTensor::new(
            nx_core::TensorInfo::new([3, 2], nx_core::DataType::Float32),
            vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0],
        )
        .unwrap();
        let desc = FullyConnectedDescriptor {
            bias_enabled: true,
            transpose_weight_matrix: true,
        };
        let bias = ConstTensor::filled([3], 0.5);
        let out = fully_connected(&desc, &input(&data, &shape), &weights, Some(&bias)).unwrap();
        assert_eq!(out, vec![1.5, 2.5, 3.5]);
    }

    #[test]
    fn test_convolution_padding() {
        let shape = TensorShape::new([1, 1, 2, 2]);
        let data = [1.0, 2.0, 3.0, 4.0];
        let desc = Convolution2dDescriptor {
            pad_left: 1,
            pad_right: 1,
            pad_top: 1,
            pad_bottom: 1,
            stride_x: 1,
            stride_y: 1,
            bias_enabled: false,
        };
        let weights = ConstTensor::filled([1, 1, 3, 3], 1.0);
        let out = convolution2d(
            &desc,
            &input(&data, &shape),
            &weights,
            None,
            &TensorShape::new([1, 1, 2, 2]),
        )
        .unwrap();
        assert_eq!(out, vec![10.0; 4]);
    }

    #[test]
    fn test_lstm_cifg_zero_weights() {
        // With zero weights every gate pre-activation is 0:
        // f = o = 0.5, i = 1 - f = 0.5, g = tanh(0) = 0.
        let params = LstmParams::basic(2, 3, 3, 0.0);
        let desc = LstmDescriptor::default();
        let (xs, hs, cs) = (
            TensorShape::new([1, 2]),
            TensorShape::new([1, 3]),
            TensorShape::new([1, 3]),
        );
        let out = lstm(
            &desc,
            &params,
            LstmActivation::TanH,
            &input(&[1.0, -1.0], &xs),
            &input(&[0.0; 3], &hs),
            &input(&[1.0, 2.0, -2.0], &cs),
        )
        .unwrap();

        assert_eq!(out.cell_state, vec![0.5, 1.0, -1.0]);
        let expected: Vec<f32> = out.cell_state.iter().map(|c| 0.5 * c.tanh()).collect();
        assert_eq!(out.output, expected);
        assert_eq!(out.output_state, expected);
        assert_eq!(out.scratch.len(), 9);
        assert_eq!(&out.scratch[3..6], &[0.5, 0.5, 0.5]);
    }

    #[test]
    fn test_lstm_cell_clipping() {
        let params = LstmParams::basic(1, 1, 1, 0.0);
        let desc = LstmDescriptor {
            clipping_thres_cell: 1.0,
            ..LstmDescriptor::default()
        };
        let s = TensorShape::new([1, 1]);
        let out = lstm(
            &desc,
            &params,
            LstmActivation::None,
            &input(&[0.0], &s),
            &input(&[0.0], &s),
            &input(&[10.0], &s),
        )
        .unwrap();
        assert_eq!(out.cell_state, vec![1.0]);
    }

    #[test]
    fn test_lstm_rejects_short_bias() {
        let mut params = LstmParams::basic(2, 2, 2, 0.0);
        params.cell_bias = ConstTensor::filled([1], 0.0);
        let s = TensorShape::new([1, 2]);
        let err = lstm(
            &LstmDescriptor::default(),
            &params,
            LstmActivation::TanH,
            &input(&[0.0; 2], &s),
            &input(&[0.0; 2], &s),
            &input(&[0.0; 2], &s),
        )
        .unwrap_err();
        assert!(matches!(err, NxError::Backend { .. }), "{err}");
    }

    #[test]
    fn test_eval_layer_rejects_bad_lstm_activation() {
        let layer = LayerKind::Lstm {
            descriptor: LstmDescriptor {
                activation_func: 2,
                ..LstmDescriptor::default()
            },
            params: Box::new(LstmParams::basic(1, 1, 1, 0.0)),
        };
        assert!(matches!(
            eval_layer(&layer, &[], &[]),
            Err(NxError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_activation_kernel() {
        let desc = ActivationDescriptor {
            function: ActivationFunction::BoundedReLu,
            a: 6.0,
            b: 0.0,
        };
        assert_eq!(activation(&desc, &[-1.0, 3.0, 9.0]), vec![0.0, 3.0, 6.0]);
    }
}
