//! Immutable parameter records, one per parameterized layer kind.

use crate::tensor::ConstTensor;
use crate::types::TensorShape;
use crate::{NxError, Result};

// ── Pooling ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PoolingAlgorithm {
    Max,
    Average,
    L2,
}

/// Rounding applied to `readSize / stride` when computing pooled extents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutputShapeRounding {
    Floor,
    Ceiling,
}

impl TryFrom<u32> for OutputShapeRounding {
    type Error = NxError;

    fn try_from(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(OutputShapeRounding::Floor),
            1 => Ok(OutputShapeRounding::Ceiling),
            other => Err(NxError::InvalidParameter(format!(
                "unsupported output shape rounding {other}"
            ))),
        }
    }
}

/// How padded elements take part in average pooling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PaddingMethod {
    /// Padding counts as zero-valued elements in the divisor.
    IgnoreValue,
    /// Padding is excluded from the divisor.
    Exclude,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Pooling2dDescriptor {
    pub pool_type: PoolingAlgorithm,
    pub pad_left: u32,
    pub pad_right: u32,
    pub pad_top: u32,
    pub pad_bottom: u32,
    pub pool_width: u32,
    pub pool_height: u32,
    /// Both strides zero selects global pooling.
    pub stride_x: u32,
    pub stride_y: u32,
    pub output_shape_rounding: OutputShapeRounding,
    pub padding_method: PaddingMethod,
}

impl Default for Pooling2dDescriptor {
    fn default() -> Self {
        Self {
            pool_type: PoolingAlgorithm::Max,
            pad_left: 0,
            pad_right: 0,
            pad_top: 0,
            pad_bottom: 0,
            pool_width: 0,
            pool_height: 0,
            stride_x: 0,
            stride_y: 0,
            output_shape_rounding: OutputShapeRounding::Floor,
            padding_method: PaddingMethod::Exclude,
        }
    }
}

impl Pooling2dDescriptor {
    /// Square window with matching stride and no padding.
    pub fn window(pool_type: PoolingAlgorithm, size: u32, stride: u32) -> Self {
        Self {
            pool_type,
            pool_width: size,
            pool_height: size,
            stride_x: stride,
            stride_y: stride,
            ..Self::default()
        }
    }

    pub fn is_global(&self) -> bool {
        self.stride_x == 0 && self.stride_y == 0
    }
}

// ── Convolution ─────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Convolution2dDescriptor {
    pub pad_left: u32,
    pub pad_right: u32,
    pub pad_top: u32,
    pub pad_bottom: u32,
    pub stride_x: u32,
    pub stride_y: u32,
    pub bias_enabled: bool,
}

// ── Activations ─────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActivationFunction {
    Sigmoid,
    TanH,
    Linear,
    ReLu,
    /// min(a, max(b, x))
    BoundedReLu,
    SoftReLu,
    LeakyReLu,
    Abs,
    Sqrt,
    Square,
}

/// `a` and `b` are the function's scalar parameters (e.g. `a * tanh(b * x)`,
/// the upper/lower bounds of `BoundedReLu`, the slope of `LeakyReLu`).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ActivationDescriptor {
    pub function: ActivationFunction,
    pub a: f32,
    pub b: f32,
}

impl ActivationDescriptor {
    pub fn new(function: ActivationFunction) -> Self {
        Self {
            function,
            a: 0.0,
            b: 0.0,
        }
    }

    /// Apply the function to one element.
    pub fn apply(&self, x: f32) -> f32 {
        let (a, b) = (self.a, self.b);
        match self.function {
            ActivationFunction::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            ActivationFunction::TanH => a * (b * x).tanh(),
            ActivationFunction::Linear => a * x + b,
            ActivationFunction::ReLu => x.max(0.0),
            ActivationFunction::BoundedReLu => x.max(b).min(a),
            ActivationFunction::SoftReLu => (1.0 + x.exp()).ln(),
            ActivationFunction::LeakyReLu => {
                if x > 0.0 {
                    x
                } else {
                    a * x
                }
            }
            ActivationFunction::Abs => x.abs(),
            ActivationFunction::Sqrt => x.sqrt(),
            ActivationFunction::Square => x * x,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SoftmaxDescriptor {
    pub beta: f32,
}

impl Default for SoftmaxDescriptor {
    fn default() -> Self {
        Self { beta: 1.0 }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FullyConnectedDescriptor {
    pub bias_enabled: bool,
    /// Weights are `[numOutputs, inputSize]` instead of `[inputSize, numOutputs]`.
    pub transpose_weight_matrix: bool,
}

// ── Recurrent cell ──────────────────────────────────────────────────────

/// LSTM cell configuration.
///
/// `activation_func` keeps the raw enumeration emitted by model producers
/// (0 none, 1 ReLu, 3 ReLu6, 4 TanH, 6 Sigmoid) and is only checked when a
/// workload is constructed; see [`LstmActivation`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LstmDescriptor {
    pub activation_func: u32,
    /// Cell state clipping threshold; 0 disables clipping.
    pub clipping_thres_cell: f32,
    /// Projection output clipping threshold; 0 disables clipping.
    pub clipping_thres_proj: f32,
    /// Coupled input and forget gate: the input gate is `1 - forget`.
    pub cifg_enabled: bool,
    pub peephole_enabled: bool,
    pub projection_enabled: bool,
}

impl Default for LstmDescriptor {
    fn default() -> Self {
        Self {
            activation_func: 4,
            clipping_thres_cell: 0.0,
            clipping_thres_proj: 0.0,
            cifg_enabled: true,
            peephole_enabled: false,
            projection_enabled: false,
        }
    }
}

/// Decoded cell/output activation of an LSTM.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LstmActivation {
    None,
    ReLu,
    ReLu6,
    TanH,
    Sigmoid,
}

impl TryFrom<u32> for LstmActivation {
    type Error = NxError;

    fn try_from(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(LstmActivation::None),
            1 => Ok(LstmActivation::ReLu),
            3 => Ok(LstmActivation::ReLu6),
            4 => Ok(LstmActivation::TanH),
            6 => Ok(LstmActivation::Sigmoid),
            other => Err(NxError::InvalidParameter(format!(
                "wrong type of LSTM activation function: {other}"
            ))),
        }
    }
}

impl LstmActivation {
    pub fn apply(self, x: f32) -> f32 {
        match self {
            LstmActivation::None => x,
            LstmActivation::ReLu => x.max(0.0),
            LstmActivation::ReLu6 => x.clamp(0.0, 6.0),
            LstmActivation::TanH => x.tanh(),
            LstmActivation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        }
    }
}

/// Identifies one constant operand of an LSTM cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LstmTensor {
    InputToInputWeights,
    InputToForgetWeights,
    InputToCellWeights,
    InputToOutputWeights,
    RecurrentToInputWeights,
    RecurrentToForgetWeights,
    RecurrentToCellWeights,
    RecurrentToOutputWeights,
    CellToInputWeights,
    CellToForgetWeights,
    CellToOutputWeights,
    InputGateBias,
    ForgetGateBias,
    CellBias,
    OutputGateBias,
    ProjectionWeights,
    ProjectionBias,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LstmDims {
    pub units: u32,
    pub input_size: u32,
    pub output_size: u32,
}

impl LstmDims {
    /// Shape `tensor` must have for a cell of these dimensions.
    pub fn expected(&self, tensor: LstmTensor) -> TensorShape {
        use LstmTensor::*;
        let LstmDims {
            units,
            input_size,
            output_size,
        } = *self;
        match tensor {
            InputToInputWeights | InputToForgetWeights | InputToCellWeights | InputToOutputWeights => {
                TensorShape::new([units, input_size])
            }
            RecurrentToInputWeights
            | RecurrentToForgetWeights
            | RecurrentToCellWeights
            | RecurrentToOutputWeights => TensorShape::new([units, output_size]),
            CellToInputWeights | CellToForgetWeights | CellToOutputWeights | InputGateBias
            | ForgetGateBias | CellBias | OutputGateBias => TensorShape::new([units]),
            ProjectionWeights => TensorShape::new([output_size, units]),
            ProjectionBias => TensorShape::new([output_size]),
        }
    }
}

/// Weights and biases of an LSTM cell.
///
/// Input weights are `[numUnits, inputSize]`, recurrent weights
/// `[numUnits, outputSize]`, biases and peephole weights `[numUnits]`,
/// projection weights `[outputSize, numUnits]`.
#[derive(Clone, Debug, PartialEq)]
pub struct LstmParams {
    pub input_to_forget_weights: ConstTensor,
    pub input_to_cell_weights: ConstTensor,
    pub input_to_output_weights: ConstTensor,
    pub recurrent_to_forget_weights: ConstTensor,
    pub recurrent_to_cell_weights: ConstTensor,
    pub recurrent_to_output_weights: ConstTensor,
    pub forget_gate_bias: ConstTensor,
    pub cell_bias: ConstTensor,
    pub output_gate_bias: ConstTensor,

    // Required unless CIFG is enabled.
    pub input_to_input_weights: Option<ConstTensor>,
    pub recurrent_to_input_weights: Option<ConstTensor>,
    pub cell_to_input_weights: Option<ConstTensor>,
    pub input_gate_bias: Option<ConstTensor>,

    // Projection.
    pub projection_weights: Option<ConstTensor>,
    pub projection_bias: Option<ConstTensor>,

    // Peephole.
    pub cell_to_forget_weights: Option<ConstTensor>,
    pub cell_to_output_weights: Option<ConstTensor>,
}

impl LstmParams {
    /// Basic parameter set (CIFG, no peephole, no projection) with every
    /// element set to `value`.
    pub fn basic(input_size: u32, num_units: u32, output_size: u32, value: f32) -> Self {
        Self {
            input_to_forget_weights: ConstTensor::filled([num_units, input_size], value),
            input_to_cell_weights: ConstTensor::filled([num_units, input_size], value),
            input_to_output_weights: ConstTensor::filled([num_units, input_size], value),
            recurrent_to_forget_weights: ConstTensor::filled([num_units, output_size], value),
            recurrent_to_cell_weights: ConstTensor::filled([num_units, output_size], value),
            recurrent_to_output_weights: ConstTensor::filled([num_units, output_size], value),
            forget_gate_bias: ConstTensor::filled([num_units], value),
            cell_bias: ConstTensor::filled([num_units], value),
            output_gate_bias: ConstTensor::filled([num_units], value),
            input_to_input_weights: None,
            recurrent_to_input_weights: None,
            cell_to_input_weights: None,
            input_gate_bias: None,
            projection_weights: None,
            projection_bias: None,
            cell_to_forget_weights: None,
            cell_to_output_weights: None,
        }
    }

    /// Add the input-gate group required when CIFG is disabled.
    pub fn with_input_gate(mut self, input_size: u32, output_size: u32, value: f32) -> Self {
        let num_units = self.num_units().unwrap_or_default();
        self.input_to_input_weights = Some(ConstTensor::filled([num_units, input_size], value));
        self.recurrent_to_input_weights = Some(ConstTensor::filled([num_units, output_size], value));
        self.input_gate_bias = Some(ConstTensor::filled([num_units], value));
        self
    }

    pub fn with_peephole(mut self, value: f32) -> Self {
        let num_units = self.num_units().unwrap_or_default();
        self.cell_to_forget_weights = Some(ConstTensor::filled([num_units], value));
        self.cell_to_output_weights = Some(ConstTensor::filled([num_units], value));
        if self.input_to_input_weights.is_some() {
            self.cell_to_input_weights = Some(ConstTensor::filled([num_units], value));
        }
        self
    }

    pub fn with_projection(mut self, output_size: u32, value: f32, bias: bool) -> Self {
        let num_units = self.num_units().unwrap_or_default();
        self.projection_weights = Some(ConstTensor::filled([output_size, num_units], value));
        self.projection_bias = bias.then(|| ConstTensor::filled([output_size], value));
        self
    }

    /// Cell width, read from the forget gate bias. `None` when the bias is
    /// not at least 1D.
    pub fn num_units(&self) -> Option<u32> {
        self.forget_gate_bias.info().shape.dim(0)
    }

    /// Cell dimensions implied by the forget gate bias and weights.
    pub fn dims(&self) -> std::result::Result<LstmDims, String> {
        let units = self
            .num_units()
            .ok_or_else(|| format!("forget_gate_bias {} is not 1D", self.forget_gate_bias.info().shape))?;
        let input_size = self.input_to_forget_weights.info().shape.dim(1).ok_or_else(|| {
            format!(
                "input_to_forget_weights {} is not 2D",
                self.input_to_forget_weights.info().shape
            )
        })?;
        let output_size = self.recurrent_to_forget_weights.info().shape.dim(1).ok_or_else(|| {
            format!(
                "recurrent_to_forget_weights {} is not 2D",
                self.recurrent_to_forget_weights.info().shape
            )
        })?;
        Ok(LstmDims {
            units,
            input_size,
            output_size,
        })
    }

    /// Every supplied tensor with its identity, required ones first.
    pub fn tensors(&self) -> Vec<(LstmTensor, &ConstTensor)> {
        use LstmTensor::*;
        let required = [
            (InputToForgetWeights, &self.input_to_forget_weights),
            (InputToCellWeights, &self.input_to_cell_weights),
            (InputToOutputWeights, &self.input_to_output_weights),
            (RecurrentToForgetWeights, &self.recurrent_to_forget_weights),
            (RecurrentToCellWeights, &self.recurrent_to_cell_weights),
            (RecurrentToOutputWeights, &self.recurrent_to_output_weights),
            (ForgetGateBias, &self.forget_gate_bias),
            (CellBias, &self.cell_bias),
            (OutputGateBias, &self.output_gate_bias),
        ];
        let optional = [
            (InputToInputWeights, &self.input_to_input_weights),
            (RecurrentToInputWeights, &self.recurrent_to_input_weights),
            (CellToInputWeights, &self.cell_to_input_weights),
            (InputGateBias, &self.input_gate_bias),
            (ProjectionWeights, &self.projection_weights),
            (ProjectionBias, &self.projection_bias),
            (CellToForgetWeights, &self.cell_to_forget_weights),
            (CellToOutputWeights, &self.cell_to_output_weights),
        ];
        required
            .into_iter()
            .chain(
                optional
                    .into_iter()
                    .filter_map(|(tensor, source)| source.as_ref().map(|s| (tensor, s))),
            )
            .collect()
    }

    /// Check every supplied tensor against the shape `dims` implies.
    pub fn check_shapes(&self, dims: &LstmDims) -> std::result::Result<(), String> {
        for (tensor, source) in self.tensors() {
            let expected = dims.expected(tensor);
            if source.info().shape != expected {
                return Err(format!(
                    "{tensor:?} has shape {}, expected {expected}",
                    source.info().shape
                ));
            }
        }
        Ok(())
    }

    /// Check that every group the descriptor enables is present.
    pub fn check_groups(&self, descriptor: &LstmDescriptor) -> std::result::Result<(), String> {
        if !descriptor.cifg_enabled {
            if self.input_to_input_weights.is_none() {
                return Err("CIFG disabled but input_to_input_weights is missing".into());
            }
            if self.recurrent_to_input_weights.is_none() {
                return Err("CIFG disabled but recurrent_to_input_weights is missing".into());
            }
            if self.input_gate_bias.is_none() {
                return Err("CIFG disabled but input_gate_bias is missing".into());
            }
        }
        if descriptor.projection_enabled && self.projection_weights.is_none() {
            return Err("projection enabled but projection_weights is missing".into());
        }
        if descriptor.peephole_enabled
            && (self.cell_to_forget_weights.is_none() || self.cell_to_output_weights.is_none())
        {
            return Err("peephole enabled but cell_to_forget/cell_to_output weights are missing".into());
        }
        Ok(())
    }
}
