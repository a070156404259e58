//! Tensor descriptors: DataType, TensorShape, TensorInfo.

use std::ops::Index;

use smallvec::SmallVec;

/// Element types a tensor slot can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    Float32,
    Float16,
    QAsymm8,
    Signed32,
    Boolean,
}

impl DataType {
    /// Size in bytes of a single element.
    pub fn size_bytes(self) -> usize {
        match self {
            DataType::Float32 | DataType::Signed32 => 4,
            DataType::Float16 => 2,
            DataType::QAsymm8 | DataType::Boolean => 1,
        }
    }

    pub fn is_quantized(self) -> bool {
        matches!(self, DataType::QAsymm8)
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::Float32 => write!(f, "Float32"),
            DataType::Float16 => write!(f, "Float16"),
            DataType::QAsymm8 => write!(f, "QAsymm8"),
            DataType::Signed32 => write!(f, "Signed32"),
            DataType::Boolean => write!(f, "Boolean"),
        }
    }
}

/// Tensor shape: an immutable, ordered list of unsigned extents.
///
/// Two shapes are equal iff they have the same rank and the same extents in
/// order. Four-dimensional shapes are laid out `[batch, channels, height, width]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TensorShape(SmallVec<[u32; 5]>);

impl TensorShape {
    pub fn new(dims: impl AsRef<[u32]>) -> Self {
        Self(SmallVec::from_slice(dims.as_ref()))
    }

    /// Number of dimensions (rank).
    pub fn num_dimensions(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements.
    pub fn num_elements(&self) -> usize {
        self.0.iter().map(|&d| d as usize).product()
    }

    pub fn dims(&self) -> &[u32] {
        &self.0
    }

    /// Dimension at `axis`, or `None` when out of range.
    pub fn dim(&self, axis: usize) -> Option<u32> {
        self.0.get(axis).copied()
    }

    /// Compute the broadcast shape of two shapes, or None if incompatible.
    pub fn broadcast(a: &TensorShape, b: &TensorShape) -> Option<TensorShape> {
        let rank = a.num_dimensions().max(b.num_dimensions());
        let mut result = SmallVec::<[u32; 5]>::with_capacity(rank);

        for i in 0..rank {
            let da = trailing_dim(a, i);
            let db = trailing_dim(b, i);
            if da == db || db == 1 {
                result.push(da);
            } else if da == 1 {
                result.push(db);
            } else {
                return None;
            }
        }

        result.reverse();
        Some(TensorShape(result))
    }
}

fn trailing_dim(shape: &TensorShape, i: usize) -> u32 {
    let n = shape.num_dimensions();
    if i < n { shape.0[n - 1 - i] } else { 1 }
}

impl Index<usize> for TensorShape {
    type Output = u32;

    fn index(&self, axis: usize) -> &u32 {
        &self.0[axis]
    }
}

impl From<&[u32]> for TensorShape {
    fn from(dims: &[u32]) -> Self {
        Self::new(dims)
    }
}

impl<const N: usize> From<[u32; N]> for TensorShape {
    fn from(dims: [u32; N]) -> Self {
        Self::new(dims)
    }
}

impl std::fmt::Display for TensorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

/// Shape + element type (+ quantization) of the data flowing through a slot.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorInfo {
    pub shape: TensorShape,
    pub data_type: DataType,
    pub quantization_scale: f32,
    pub quantization_offset: i32,
}

impl TensorInfo {
    pub fn new(shape: impl Into<TensorShape>, data_type: DataType) -> Self {
        Self {
            shape: shape.into(),
            data_type,
            quantization_scale: 0.0,
            quantization_offset: 0,
        }
    }

    pub fn with_quantization(mut self, scale: f32, offset: i32) -> Self {
        self.quantization_scale = scale;
        self.quantization_offset = offset;
        self
    }

    pub fn num_elements(&self) -> usize {
        self.shape.num_elements()
    }

    pub fn num_bytes(&self) -> usize {
        self.num_elements() * self.data_type.size_bytes()
    }
}

impl std::fmt::Display for TensorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.data_type, self.shape)
    }
}
