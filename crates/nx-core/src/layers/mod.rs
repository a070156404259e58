//! Layer kinds and their shape inference.
//!
//! Every operation a graph node can perform is a variant of [`LayerKind`],
//! carrying its immutable parameter record and constant operands. Each kind
//! has a fixed number of input and output slots and a pure
//! `infer_output_shapes` rule.

mod convolution2d;
mod elementwise;
mod fully_connected;
mod lstm;
mod pooling2d;

pub use pooling2d::pooled_extent;

use crate::descriptors::{
    ActivationDescriptor, Convolution2dDescriptor, FullyConnectedDescriptor, LstmDescriptor,
    LstmParams, Pooling2dDescriptor, SoftmaxDescriptor,
};
use crate::tensor::ConstTensor;
use crate::types::TensorShape;

/// Error returned when input shapes or parameters are inconsistent for a layer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ShapeError {
    #[error("expected {expected} input shapes, got {actual}")]
    InputCount { expected: usize, actual: usize },

    #[error("expected a {expected}D input, got {actual}D")]
    Rank { expected: usize, actual: usize },

    #[error("shape mismatch: {0}")]
    Mismatch(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Operation-kind tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LayerType {
    Input,
    Output,
    Activation,
    Softmax,
    Addition,
    FullyConnected,
    Convolution2d,
    Pooling2d,
    Lstm,
}

impl std::fmt::Display for LayerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// A layer's operation: kind tag, parameter record and constant operands.
#[derive(Clone, Debug, PartialEq)]
pub enum LayerKind {
    // ── Bindings ────────────────────────────────────────────────────────
    /// Network input; its output TensorInfo is set by the caller.
    Input { binding_id: u32 },
    Output { binding_id: u32 },

    // ── Elementwise ─────────────────────────────────────────────────────
    Activation(ActivationDescriptor),
    Softmax(SoftmaxDescriptor),
    Addition,

    // ── Parameterized ───────────────────────────────────────────────────
    FullyConnected {
        descriptor: FullyConnectedDescriptor,
        weights: ConstTensor,
        bias: Option<ConstTensor>,
    },
    Convolution2d {
        descriptor: Convolution2dDescriptor,
        weights: ConstTensor,
        bias: Option<ConstTensor>,
    },
    Pooling2d(Pooling2dDescriptor),

    // ── Recurrent ───────────────────────────────────────────────────────
    Lstm {
        descriptor: LstmDescriptor,
        params: Box<LstmParams>,
    },
}

impl LayerKind {
    pub fn layer_type(&self) -> LayerType {
        match self {
            LayerKind::Input { .. } => LayerType::Input,
            LayerKind::Output { .. } => LayerType::Output,
            LayerKind::Activation(_) => LayerType::Activation,
            LayerKind::Softmax(_) => LayerType::Softmax,
            LayerKind::Addition => LayerType::Addition,
            LayerKind::FullyConnected { .. } => LayerType::FullyConnected,
            LayerKind::Convolution2d { .. } => LayerType::Convolution2d,
            LayerKind::Pooling2d(_) => LayerType::Pooling2d,
            LayerKind::Lstm { .. } => LayerType::Lstm,
        }
    }

    /// Number of input slots; fixed for the kind.
    pub fn num_inputs(&self) -> usize {
        match self {
            LayerKind::Input { .. } => 0,
            LayerKind::Addition => 2,
            LayerKind::Lstm { .. } => 3,
            _ => 1,
        }
    }

    /// Number of output slots; fixed for the kind.
    pub fn num_outputs(&self) -> usize {
        match self {
            LayerKind::Output { .. } => 0,
            LayerKind::Lstm { .. } => 4,
            _ => 1,
        }
    }

    /// Whether the layer is a binding point rather than an operation.
    pub fn is_binding(&self) -> bool {
        matches!(self, LayerKind::Input { .. } | LayerKind::Output { .. })
    }

    /// Infer output shapes from input shapes. Pure and deterministic.
    pub fn infer_output_shapes(
        &self,
        inputs: &[TensorShape],
    ) -> Result<Vec<TensorShape>, ShapeError> {
        if inputs.len() != self.num_inputs() {
            return Err(ShapeError::InputCount {
                expected: self.num_inputs(),
                actual: inputs.len(),
            });
        }
        match self {
            LayerKind::Input { .. } => Err(ShapeError::InvalidConfiguration(
                "input shapes are bound by the caller".into(),
            )),
            LayerKind::Output { .. } => Ok(Vec::new()),
            LayerKind::Activation(_) | LayerKind::Softmax(_) => {
                Ok(vec![elementwise::infer_unary(&inputs[0])])
            }
            LayerKind::Addition => Ok(vec![elementwise::infer_addition(&inputs[0], &inputs[1])?]),
            LayerKind::FullyConnected {
                descriptor,
                weights,
                bias,
            } => Ok(vec![fully_connected::infer(
                descriptor,
                weights,
                bias.as_ref(),
                &inputs[0],
            )?]),
            LayerKind::Convolution2d {
                descriptor,
                weights,
                bias,
            } => Ok(vec![convolution2d::infer(
                descriptor,
                weights,
                bias.as_ref(),
                &inputs[0],
            )?]),
            LayerKind::Pooling2d(descriptor) => Ok(vec![pooling2d::infer(descriptor, &inputs[0])?]),
            LayerKind::Lstm { descriptor, params } => lstm::infer(descriptor, params, inputs),
        }
    }

    /// Parameter consistency that does not depend on input shapes.
    pub fn check_parameters(&self) -> Result<(), String> {
        match self {
            LayerKind::FullyConnected {
                descriptor, bias, ..
            } => check_bias(descriptor.bias_enabled, bias.as_ref()),
            LayerKind::Convolution2d {
                descriptor, bias, ..
            } => check_bias(descriptor.bias_enabled, bias.as_ref()),
            LayerKind::Lstm { descriptor, params } => params.check_groups(descriptor),
            _ => Ok(()),
        }
    }

    /// Constant operands referenced by the layer, in a stable order.
    pub fn constants(&self) -> Vec<&ConstTensor> {
        match self {
            LayerKind::FullyConnected { weights, bias, .. }
            | LayerKind::Convolution2d { weights, bias, .. } => {
                std::iter::once(weights).chain(bias.as_ref()).collect()
            }
            LayerKind::Lstm { params, .. } => {
                params.tensors().into_iter().map(|(_, tensor)| tensor).collect()
            }
            _ => Vec::new(),
        }
    }
}

fn check_bias(bias_enabled: bool, bias: Option<&ConstTensor>) -> Result<(), String> {
    match (bias_enabled, bias.is_some()) {
        (true, false) => Err("bias enabled but no bias tensor given".into()),
        (false, true) => Err("bias tensor given but bias is disabled".into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::{ActivationFunction, PoolingAlgorithm};

    fn s(dims: &[u32]) -> TensorShape {
        TensorShape::new(dims)
    }

    #[test]
    fn test_slot_counts() {
        assert_eq!(LayerKind::Input { binding_id: 0 }.num_inputs(), 0);
        assert_eq!(LayerKind::Output { binding_id: 0 }.num_outputs(), 0);
        assert_eq!(LayerKind::Addition.num_inputs(), 2);
        let lstm = LayerKind::Lstm {
            descriptor: LstmDescriptor::default(),
            params: Box::new(LstmParams::basic(2, 4, 4, 0.0)),
        };
        assert_eq!((lstm.num_inputs(), lstm.num_outputs()), (3, 4));
    }

    #[test]
    fn test_input_count_checked() {
        let pool = LayerKind::Pooling2d(Pooling2dDescriptor::window(PoolingAlgorithm::Max, 2, 2));
        assert_eq!(
            pool.infer_output_shapes(&[]),
            Err(ShapeError::InputCount {
                expected: 1,
                actual: 0
            })
        );
    }

    #[test]
    fn test_activation_preserves_shape() {
        let act = LayerKind::Activation(ActivationDescriptor::new(ActivationFunction::ReLu));
        let out = act.infer_output_shapes(&[s(&[1, 3, 8, 8])]).unwrap();
        assert_eq!(out, vec![s(&[1, 3, 8, 8])]);
    }

    #[test]
    fn test_bias_consistency() {
        let fc = LayerKind::FullyConnected {
            descriptor: FullyConnectedDescriptor {
                bias_enabled: true,
                transpose_weight_matrix: false,
            },
            weights: ConstTensor::filled([4, 2], 1.0),
            bias: None,
        };
        assert!(fc.check_parameters().is_err());
    }

    #[test]
    fn test_constants_listed() {
        let conv = LayerKind::Convolution2d {
            descriptor: Convolution2dDescriptor {
                stride_x: 1,
                stride_y: 1,
                bias_enabled: true,
                ..Default::default()
            },
            weights: ConstTensor::filled([2, 3, 3, 3], 1.0),
            bias: Some(ConstTensor::filled([2], 0.0)),
        };
        assert_eq!(conv.constants().len(), 2);

        let lstm = LayerKind::Lstm {
            descriptor: LstmDescriptor::default(),
            params: Box::new(LstmParams::basic(2, 4, 4, 0.0).with_projection(4, 0.0, true)),
        };
        assert_eq!(lstm.constants().len(), 11);
    }
}
