//! Single-step LSTM cell over staged weights.
//!
//! Weight staging is driven by the descriptor's feature flags: a tensor of
//! an optional group gets a staging buffer only when its group is enabled
//! (input gate when CIFG is off, projection, peephole). Configuring the
//! function takes references to the buffers its execution plan actually
//! reads; [`LstmWeights::release_unreferenced`] then drops the rest before
//! anything is uploaded.

use std::sync::Arc;

use nx_core::descriptors::{LstmActivation, LstmDescriptor, LstmDims, LstmParams, LstmTensor};
use nx_core::{ConstTensor, Support, TensorHandle, TensorInfo, TensorShape};

use super::{NativeFunction, StagedConstant, ensure_prepared, upload_pending};
use crate::context::AccelContext;
use crate::staging::{Operand, StagingTensor};
use crate::{AccelError, Result};

/// Expected `[input, output_state_in, cell_state_in]` and
/// `[scratch, output_state_out, cell_state_out, output]` shapes.
fn io_shapes(dims: &LstmDims, batch: u32, gates: u32) -> ([TensorShape; 3], [TensorShape; 4]) {
    let row = |n: u32| TensorShape::new([batch, n]);
    (
        [row(dims.input_size), row(dims.output_size), row(dims.units)],
        [
            row(dims.units.saturating_mul(gates)),
            row(dims.output_size),
            row(dims.units),
            row(dims.output_size),
        ],
    )
}

fn gate_count(desc: &LstmDescriptor) -> u32 {
    if desc.cifg_enabled { 3 } else { 4 }
}

/// Tensors the descriptor's flags enable, with their dimensions checked.
fn staging_plan<'a>(
    desc: &LstmDescriptor,
    params: &'a LstmParams,
) -> std::result::Result<(Vec<(LstmTensor, &'a ConstTensor)>, LstmDims), String> {
    use LstmTensor::*;

    params.check_groups(desc)?;
    let dims = params.dims()?;
    params.check_shapes(&dims)?;

    let mut plan = vec![
        (InputToForgetWeights, &params.input_to_forget_weights),
        (InputToCellWeights, &params.input_to_cell_weights),
        (InputToOutputWeights, &params.input_to_output_weights),
        (RecurrentToForgetWeights, &params.recurrent_to_forget_weights),
        (RecurrentToCellWeights, &params.recurrent_to_cell_weights),
        (RecurrentToOutputWeights, &params.recurrent_to_output_weights),
        (ForgetGateBias, &params.forget_gate_bias),
        (CellBias, &params.cell_bias),
        (OutputGateBias, &params.output_gate_bias),
    ];
    let mut optional = |tensor, source: &'a Option<ConstTensor>| {
        if let Some(source) = source {
            plan.push((tensor, source));
        }
    };
    if !desc.cifg_enabled {
        optional(InputToInputWeights, &params.input_to_input_weights);
        optional(RecurrentToInputWeights, &params.recurrent_to_input_weights);
        optional(InputGateBias, &params.input_gate_bias);
        optional(CellToInputWeights, &params.cell_to_input_weights);
    }
    if desc.projection_enabled {
        optional(ProjectionWeights, &params.projection_weights);
        optional(ProjectionBias, &params.projection_bias);
    }
    if desc.peephole_enabled {
        optional(CellToForgetWeights, &params.cell_to_forget_weights);
        optional(CellToOutputWeights, &params.cell_to_output_weights);
    }

    if !desc.projection_enabled && dims.output_size != dims.units {
        return Err(format!(
            "output size {} must equal {} units without projection",
            dims.output_size, dims.units
        ));
    }
    Ok((plan, dims))
}

fn check_io(
    dims: &LstmDims,
    gates: u32,
    inputs: [&TensorShape; 3],
    outputs: [&TensorShape; 4],
) -> std::result::Result<(), String> {
    if inputs[0].num_dimensions() != 2 {
        return Err(format!("LSTM input must be 2D, got {}", inputs[0]));
    }
    let (want_in, want_out) = io_shapes(dims, inputs[0][0], gates);
    for (actual, expected) in inputs.into_iter().zip(&want_in).chain(outputs.into_iter().zip(&want_out)) {
        if actual != expected {
            return Err(format!("LSTM tensor has shape {actual}, expected {expected}"));
        }
    }
    Ok(())
}

// ── Staged weights ──────────────────────────────────────────────────────

/// Staging buffers for the constants a cell configuration may read.
#[derive(Debug)]
pub struct LstmWeights {
    dims: LstmDims,
    staged: Vec<(LstmTensor, StagedConstant)>,
}

impl LstmWeights {
    /// Allocate a staging buffer for every tensor the descriptor enables.
    pub fn allocate(ctx: &Arc<AccelContext>, desc: &LstmDescriptor, params: &LstmParams) -> Result<Self> {
        let (plan, dims) = staging_plan(desc, params).map_err(AccelError::InvalidConfiguration)?;
        let staged = plan
            .into_iter()
            .map(|(tensor, source)| Ok((tensor, StagedConstant::allocate(ctx, source)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { dims, staged })
    }

    pub fn get(&self, tensor: LstmTensor) -> Option<&StagedConstant> {
        self.staged
            .iter()
            .find_map(|(t, staged)| (*t == tensor).then_some(staged))
    }

    fn require(&self, tensor: LstmTensor) -> Result<&StagedConstant> {
        self.get(tensor)
            .ok_or_else(|| AccelError::InvalidConfiguration(format!("{tensor:?} was not staged")))
    }

    /// Tensors that currently hold a staging buffer.
    pub fn allocated(&self) -> Vec<LstmTensor> {
        self.staged.iter().map(|(t, _)| *t).collect()
    }

    /// Drop every buffer nothing else references. Returns what was dropped.
    pub fn release_unreferenced(&mut self) -> Vec<LstmTensor> {
        let mut released = Vec::new();
        self.staged.retain(|(tensor, staged)| {
            let referenced = Arc::strong_count(&staged.tensor) > 1;
            if !referenced {
                released.push(*tensor);
            }
            referenced
        });
        released
    }
}

// ── Operands ────────────────────────────────────────────────────────────

/// Caller tensors bound to the cell.
#[derive(Debug, Clone)]
pub struct LstmOperands {
    pub input: Operand,
    pub output_state_in: Operand,
    pub cell_state_in: Operand,
    pub scratch: Operand,
    pub output_state_out: Operand,
    pub cell_state_out: Operand,
    pub output: Operand,
}

impl LstmOperands {
    pub fn import(inputs: &[Arc<dyn TensorHandle>], outputs: &[Arc<dyn TensorHandle>]) -> Result<Self> {
        let [input, output_state_in, cell_state_in] = inputs else {
            return Err(AccelError::InvalidConfiguration(format!(
                "LSTM takes 3 inputs, got {}",
                inputs.len()
            )));
        };
        let [scratch, output_state_out, cell_state_out, output] = outputs else {
            return Err(AccelError::InvalidConfiguration(format!(
                "LSTM produces 4 outputs, got {}",
                outputs.len()
            )));
        };
        let import = |h: &Arc<dyn TensorHandle>| Operand::import(Arc::clone(h));
        Ok(Self {
            input: import(input)?,
            output_state_in: import(output_state_in)?,
            cell_state_in: import(cell_state_in)?,
            scratch: import(scratch)?,
            output_state_out: import(output_state_out)?,
            cell_state_out: import(cell_state_out)?,
            output: import(output)?,
        })
    }
}

// ── Function ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Gate {
    input_weights: Arc<StagingTensor>,
    recurrent_weights: Arc<StagingTensor>,
    bias: Arc<StagingTensor>,
    peephole: Option<Arc<StagingTensor>>,
}

impl Gate {
    fn pre_activation(&self, x: &[f32], h: &[f32], cell: &[f32]) -> Vec<f32> {
        let mut acc = self.bias.to_vec();
        matvec_accumulate(&mut acc, &self.input_weights.read(), x);
        matvec_accumulate(&mut acc, &self.recurrent_weights.read(), h);
        if let Some(peephole) = &self.peephole {
            for (a, (w, c)) in acc.iter_mut().zip(peephole.read().iter().zip(cell)) {
                *a += w * c;
            }
        }
        acc
    }
}

#[derive(Debug)]
struct Projection {
    weights: Arc<StagingTensor>,
    bias: Option<Arc<StagingTensor>>,
}

fn matvec_accumulate(acc: &mut [f32], w: &[f32], x: &[f32]) {
    for (a, row) in acc.iter_mut().zip(w.chunks_exact(x.len())) {
        *a += row.iter().zip(x).map(|(w, x)| w * x).sum::<f32>();
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn clip(x: f32, threshold: f32) -> f32 {
    if threshold > 0.0 {
        x.clamp(-threshold, threshold)
    } else {
        x
    }
}

#[derive(Debug)]
pub struct LstmFunction {
    ctx: Arc<AccelContext>,
    descriptor: LstmDescriptor,
    activation: LstmActivation,
    dims: LstmDims,
    operands: LstmOperands,
    input_gate: Option<Gate>,
    forget_gate: Gate,
    cell_gate: Gate,
    output_gate: Gate,
    projection: Option<Projection>,
    pending: Vec<StagedConstant>,
    prepared: bool,
}

impl LstmFunction {
    pub fn validate(
        desc: &LstmDescriptor,
        params: &LstmParams,
        inputs: &[TensorInfo],
        outputs: &[TensorInfo],
    ) -> Support {
        let check = || {
            LstmActivation::try_from(desc.activation_func).map_err(|e| e.to_string())?;
            let (_, dims) = staging_plan(desc, params)?;
            let (Ok(ins), Ok(outs)) = (
                <&[TensorInfo; 3]>::try_from(inputs),
                <&[TensorInfo; 4]>::try_from(outputs),
            ) else {
                return Err(format!(
                    "LSTM needs 3 inputs and 4 outputs, got {} and {}",
                    inputs.len(),
                    outputs.len()
                ));
            };
            check_io(
                &dims,
                gate_count(desc),
                ins.each_ref().map(|i| &i.shape),
                outs.each_ref().map(|o| &o.shape),
            )
        };
        match check() {
            Ok(()) => Support::Supported,
            Err(reason) => Support::Unsupported(reason),
        }
    }

    /// Bind operands and take references to the staged weights the
    /// configuration reads.
    pub fn configure(
        ctx: Arc<AccelContext>,
        descriptor: LstmDescriptor,
        activation: LstmActivation,
        weights: &LstmWeights,
        operands: LstmOperands,
    ) -> Result<Self> {
        use LstmTensor::*;

        let dims = weights.dims;
        check_io(
            &dims,
            gate_count(&descriptor),
            [
                operands.input.shape(),
                operands.output_state_in.shape(),
                operands.cell_state_in.shape(),
            ],
            [
                operands.scratch.shape(),
                operands.output_state_out.shape(),
                operands.cell_state_out.shape(),
                operands.output.shape(),
            ],
        )
        .map_err(AccelError::InvalidConfiguration)?;

        let mut pending = Vec::new();
        let mut take = |tensor| -> Result<Arc<StagingTensor>> {
            let staged = weights.require(tensor)?;
            pending.push(staged.clone());
            Ok(Arc::clone(&staged.tensor))
        };

        let forget_gate = Gate {
            input_weights: take(InputToForgetWeights)?,
            recurrent_weights: take(RecurrentToForgetWeights)?,
            bias: take(ForgetGateBias)?,
            peephole: if descriptor.peephole_enabled {
                Some(take(CellToForgetWeights)?)
            } else {
                None
            },
        };
        let cell_gate = Gate {
            input_weights: take(InputToCellWeights)?,
            recurrent_weights: take(RecurrentToCellWeights)?,
            bias: take(CellBias)?,
            peephole: None,
        };
        let output_gate = Gate {
            input_weights: take(InputToOutputWeights)?,
            recurrent_weights: take(RecurrentToOutputWeights)?,
            bias: take(OutputGateBias)?,
            peephole: if descriptor.peephole_enabled {
                Some(take(CellToOutputWeights)?)
            } else {
                None
            },
        };
        let input_gate = if descriptor.cifg_enabled {
            None
        } else {
            let peephole = if descriptor.peephole_enabled && weights.get(CellToInputWeights).is_some() {
                Some(take(CellToInputWeights)?)
            } else {
                None
            };
            Some(Gate {
                input_weights: take(InputToInputWeights)?,
                recurrent_weights: take(RecurrentToInputWeights)?,
                bias: take(InputGateBias)?,
                peephole,
            })
        };
        let projection = if descriptor.projection_enabled {
            let bias = if weights.get(ProjectionBias).is_some() {
                Some(take(ProjectionBias)?)
            } else {
                None
            };
            Some(Projection {
                weights: take(ProjectionWeights)?,
                bias,
            })
        } else {
            None
        };

        Ok(Self {
            ctx,
            descriptor,
            activation,
            dims,
            operands,
            input_gate,
            forget_gate,
            cell_gate,
            output_gate,
            projection,
            pending,
            prepared: false,
        })
    }
}

impl NativeFunction for LstmFunction {
    fn name(&self) -> &'static str {
        "lstm"
    }

    fn prepare(&mut self) -> Result<()> {
        upload_pending(&self.ctx, &mut self.pending)?;
        self.prepared = true;
        Ok(())
    }

    fn run(&self) -> Result<()> {
        ensure_prepared(self.prepared, self.name())?;
        let units = self.dims.units as usize;
        let (n_in, n_out) = (self.dims.input_size as usize, self.dims.output_size as usize);
        let gates = gate_count(&self.descriptor) as usize;

        let x_all = self.operands.input.read()?;
        let h_all = self.operands.output_state_in.read()?;
        let c_all = self.operands.cell_state_in.read()?;
        let batch = x_all.len() / n_in;

        let mut scratch = Vec::with_capacity(batch * units * gates);
        let mut cell_out = Vec::with_capacity(batch * units);
        let mut hidden_out = Vec::with_capacity(batch * n_out);

        for b in 0..batch {
            let x = &x_all[b * n_in..(b + 1) * n_in];
            let h = &h_all[b * n_out..(b + 1) * n_out];
            let c_prev = &c_all[b * units..(b + 1) * units];

            let forget: Vec<f32> = self
                .forget_gate
                .pre_activation(x, h, c_prev)
                .into_iter()
                .map(sigmoid)
                .collect();
            let candidate: Vec<f32> = self
                .cell_gate
                .pre_activation(x, h, c_prev)
                .into_iter()
                .map(|v| self.activation.apply(v))
                .collect();
            let input: Vec<f32> = match &self.input_gate {
                Some(gate) => gate.pre_activation(x, h, c_prev).into_iter().map(sigmoid).collect(),
                None => forget.iter().map(|f| 1.0 - f).collect(),
            };

            let cell: Vec<f32> = (0..units)
                .map(|u| {
                    clip(
                        forget[u] * c_prev[u] + input[u] * candidate[u],
                        self.descriptor.clipping_thres_cell,
                    )
                })
                .collect();
            let output: Vec<f32> = self
                .output_gate
                .pre_activation(x, h, &cell)
                .into_iter()
                .map(sigmoid)
                .collect();
            let hidden: Vec<f32> = output
                .iter()
                .zip(&cell)
                .map(|(o, c)| o * self.activation.apply(*c))
                .collect();

            match &self.projection {
                Some(projection) => {
                    let mut acc = projection
                        .bias
                        .as_ref()
                        .map_or_else(|| vec![0.0; n_out], |bias| bias.to_vec());
                    matvec_accumulate(&mut acc, &projection.weights.read(), &hidden);
                    hidden_out.extend(
                        acc.into_iter()
                            .map(|v| clip(v, self.descriptor.clipping_thres_proj)),
                    );
                }
                None => hidden_out.extend_from_slice(&hidden),
            }

            if self.input_gate.is_some() {
                scratch.extend_from_slice(&input);
            }
            scratch.extend_from_slice(&candidate);
            scratch.extend_from_slice(&forget);
            scratch.extend_from_slice(&output);
            cell_out.extend_from_slice(&cell);
        }

        self.operands.scratch.write(&scratch)?;
        self.operands.cell_state_out.write(&cell_out)?;
        self.operands.output_state_out.write(&hidden_out)?;
        self.operands.output.write(&hidden_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nx_core::DataType;

    fn infos(rows: &[[u32; 2]]) -> Vec<TensorInfo> {
        rows.iter().map(|r| TensorInfo::new(*r, DataType::Float32)).collect()
    }

    #[test]
    fn test_plan_follows_flags() {
        let desc = LstmDescriptor::default();
        let params = LstmParams::basic(2, 3, 3, 0.1).with_input_gate(2, 3, 0.1);
        let (plan, dims) = staging_plan(&desc, &params).unwrap();
        assert_eq!(plan.len(), 9);
        assert_eq!(
            dims,
            LstmDims {
                units: 3,
                input_size: 2,
                output_size: 3
            }
        );

        let desc = LstmDescriptor {
            cifg_enabled: false,
            ..desc
        };
        let (plan, _) = staging_plan(&desc, &params).unwrap();
        assert!(plan.iter().any(|(t, _)| *t == LstmTensor::InputGateBias));
        assert_eq!(plan.len(), 12);
    }

    #[test]
    fn test_output_size_must_match_units_without_projection() {
        let params = LstmParams::basic(2, 3, 4, 0.0);
        let err = staging_plan(&LstmDescriptor::default(), &params).unwrap_err();
        assert!(err.contains("must equal"), "{err}");
    }

    #[test]
    fn test_validate_checks_io_shapes() {
        let desc = LstmDescriptor::default();
        let params = LstmParams::basic(2, 3, 3, 0.0);
        let inputs = infos(&[[1, 2], [1, 3], [1, 3]]);
        let outputs = infos(&[[1, 9], [1, 3], [1, 3], [1, 3]]);
        assert!(LstmFunction::validate(&desc, &params, &inputs, &outputs).is_supported());

        let bad_scratch = infos(&[[1, 12], [1, 3], [1, 3], [1, 3]]);
        assert!(!LstmFunction::validate(&desc, &params, &inputs, &bad_scratch).is_supported());
        assert!(!LstmFunction::validate(&desc, &params, &inputs[..2], &outputs).is_supported());
    }

    #[test]
    fn test_validate_rejects_malformed_constants() {
        let desc = LstmDescriptor::default();
        let inputs = infos(&[[1, 2], [1, 3], [1, 3]]);
        let outputs = infos(&[[1, 9], [1, 3], [1, 3], [1, 3]]);

        let mut short_bias = LstmParams::basic(2, 3, 3, 0.0);
        short_bias.cell_bias = ConstTensor::filled([1], 0.0);
        let mut scalar_bias = LstmParams::basic(2, 3, 3, 0.0);
        scalar_bias.forget_gate_bias = ConstTensor::filled([0u32; 0], 0.0);
        for params in [short_bias, scalar_bias] {
            assert!(!LstmFunction::validate(&desc, &params, &inputs, &outputs).is_supported());
        }
    }

    #[test]
    fn test_validate_rejects_unknown_activation() {
        let desc = LstmDescriptor {
            activation_func: 5,
            ..LstmDescriptor::default()
        };
        let params = LstmParams::basic(2, 3, 3, 0.0);
        let inputs = infos(&[[1, 2], [1, 3], [1, 3]]);
        let outputs = infos(&[[1, 9], [1, 3], [1, 3], [1, 3]]);
        match LstmFunction::validate(&desc, &params, &inputs, &outputs) {
            Support::Unsupported(reason) => assert!(reason.contains("activation"), "{reason}"),
            Support::Supported => panic!("activation 5 accepted"),
        }
    }

    #[test]
    fn test_release_keeps_referenced_buffers() {
        let ctx = AccelContext::new();
        let desc = LstmDescriptor::default();
        let params = LstmParams::basic(2, 2, 2, 0.5);
        let mut weights = LstmWeights::allocate(&ctx, &desc, &params).unwrap();
        let held = Arc::clone(&weights.require(LstmTensor::CellBias).unwrap().tensor);

        let released = weights.release_unreferenced();
        assert_eq!(released.len(), 8);
        assert_eq!(weights.allocated(), vec![LstmTensor::CellBias]);
        drop(held);
        assert_eq!(ctx.telemetry().live_tensors, 1);
    }
}
