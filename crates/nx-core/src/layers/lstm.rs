//! LSTM cell shapes.
//!
//! Inputs: `input [batch, inputSize]`, `output_state_in [batch, outputSize]`,
//! `cell_state_in [batch, numUnits]`.
//! Outputs: `scratch_buffer [batch, numUnits * gates]`,
//! `output_state_out [batch, outputSize]`, `cell_state_out [batch, numUnits]`,
//! `output [batch, outputSize]`, where `gates` is 3 with CIFG and 4 without.

use super::ShapeError;
use crate::descriptors::{LstmDescriptor, LstmParams};
use crate::types::TensorShape;

pub(super) fn infer(
    desc: &LstmDescriptor,
    params: &LstmParams,
    inputs: &[TensorShape],
) -> Result<Vec<TensorShape>, ShapeError> {
    for shape in inputs {
        if shape.num_dimensions() != 2 {
            return Err(ShapeError::Rank {
                expected: 2,
                actual: shape.num_dimensions(),
            });
        }
    }
    let (input, output_state_in, cell_state_in) = (&inputs[0], &inputs[1], &inputs[2]);

    let batch = input[0];
    let output_size = output_state_in[1];
    let num_units = cell_state_in[1];

    if output_state_in[0] != batch || cell_state_in[0] != batch {
        return Err(ShapeError::Mismatch(format!(
            "state batch sizes {output_state_in} / {cell_state_in} differ from input batch {batch}"
        )));
    }
    let dims = params.dims().map_err(ShapeError::Mismatch)?;
    if dims.units != num_units {
        return Err(ShapeError::Mismatch(format!(
            "cell state has {num_units} units, weights have {}",
            dims.units
        )));
    }
    if dims.input_size != input[1] || dims.output_size != output_size {
        return Err(ShapeError::Mismatch(format!(
            "weights expect input size {} and output size {}, inputs give {} and {output_size}",
            dims.input_size, dims.output_size, input[1]
        )));
    }
    params.check_shapes(&dims).map_err(ShapeError::Mismatch)?;
    if !desc.projection_enabled && output_size != num_units {
        return Err(ShapeError::Mismatch(format!(
            "output size {output_size} must equal {num_units} units without projection"
        )));
    }

    let gates = if desc.cifg_enabled { 3 } else { 4 };
    let scratch = num_units.checked_mul(gates).ok_or_else(|| {
        ShapeError::InvalidConfiguration(format!("scratch width {num_units} x {gates} overflows"))
    })?;
    Ok(vec![
        TensorShape::new([batch, scratch]),
        TensorShape::new([batch, output_size]),
        TensorShape::new([batch, num_units]),
        TensorShape::new([batch, output_size]),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::ConstTensor;

    fn shapes(batch: u32, input: u32, units: u32, output: u32) -> Vec<TensorShape> {
        vec![
            TensorShape::new([batch, input]),
            TensorShape::new([batch, output]),
            TensorShape::new([batch, units]),
        ]
    }

    #[test]
    fn test_lstm_cifg_scratch() {
        let desc = LstmDescriptor::default();
        let params = LstmParams::basic(5, 4, 4, 0.0);
        let out = infer(&desc, &params, &shapes(2, 5, 4, 4)).unwrap();
        assert_eq!(out[0], TensorShape::new([2, 12]));
        assert_eq!(out[1], TensorShape::new([2, 4]));
        assert_eq!(out[2], TensorShape::new([2, 4]));
        assert_eq!(out[3], TensorShape::new([2, 4]));
    }

    #[test]
    fn test_lstm_full_gates_with_projection() {
        let desc = LstmDescriptor {
            cifg_enabled: false,
            projection_enabled: true,
            ..Default::default()
        };
        let params = LstmParams::basic(5, 4, 3, 0.0)
            .with_input_gate(5, 3, 0.0)
            .with_projection(3, 0.0, false);
        let out = infer(&desc, &params, &shapes(1, 5, 4, 3)).unwrap();
        assert_eq!(out[0], TensorShape::new([1, 16]));
        assert_eq!(out[3], TensorShape::new([1, 3]));
    }

    #[test]
    fn test_lstm_every_tensor_checked() {
        let desc = LstmDescriptor {
            cifg_enabled: false,
            peephole_enabled: true,
            ..Default::default()
        };
        let good = LstmParams::basic(5, 4, 4, 0.0)
            .with_input_gate(5, 4, 0.0)
            .with_peephole(0.0);
        assert!(infer(&desc, &good, &shapes(1, 5, 4, 4)).is_ok());

        let mut cell_bias = good.clone();
        cell_bias.cell_bias = ConstTensor::filled([1], 0.0);
        let mut recurrent = good.clone();
        recurrent.recurrent_to_input_weights = Some(ConstTensor::filled([4, 3], 0.0));
        let mut peephole = good.clone();
        peephole.cell_to_output_weights = Some(ConstTensor::filled([4, 1], 0.0));
        for params in [cell_bias, recurrent, peephole] {
            assert!(matches!(
                infer(&desc, &params, &shapes(1, 5, 4, 4)),
                Err(ShapeError::Mismatch(_))
            ));
        }
    }

    #[test]
    fn test_lstm_scalar_forget_bias() {
        let mut params = LstmParams::basic(5, 1, 1, 0.0);
        params.forget_gate_bias = ConstTensor::filled([0u32; 0], 0.0);
        assert!(matches!(
            infer(&LstmDescriptor::default(), &params, &shapes(1, 5, 1, 1)),
            Err(ShapeError::Mismatch(_))
        ));
    }

    #[test]
    fn test_lstm_unit_mismatch() {
        let desc = LstmDescriptor::default();
        let params = LstmParams::basic(5, 4, 4, 0.0);
        assert!(infer(&desc, &params, &shapes(1, 5, 6, 6)).is_err());
    }
}
