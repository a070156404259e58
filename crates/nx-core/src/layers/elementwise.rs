//! Shape rules for activation, softmax and addition.

use super::ShapeError;
use crate::types::TensorShape;

pub(super) fn infer_unary(input: &TensorShape) -> TensorShape {
    input.clone()
}

pub(super) fn infer_addition(a: &TensorShape, b: &TensorShape) -> Result<TensorShape, ShapeError> {
    TensorShape::broadcast(a, b)
        .ok_or_else(|| ShapeError::Mismatch(format!("cannot broadcast {a} with {b}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addition_broadcasts() {
        let a = TensorShape::new([1, 3, 4, 4]);
        let b = TensorShape::new([1, 3, 1, 1]);
        assert_eq!(infer_addition(&a, &b).unwrap(), a);
        assert!(infer_addition(&a, &TensorShape::new([2, 4, 4])).is_err());
    }
}
