//! Constant operands and externally owned tensor handles.
//!
//! The core never owns activation memory. Callers hand workloads
//! `Arc<dyn TensorHandle>` values whose lifetime must exceed the workload's;
//! backends downcast them (via [`TensorHandle::as_any`]) into the native
//! representation their kernels need.

use std::any::Any;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::{DataType, TensorInfo};
use crate::{NxError, Result};

/// Immutable constant operand (weights, biases) owned by a layer.
///
/// The payload is shared between clones; [`ConstTensor::data_mut`] detaches
/// it first, so mutating a cloned layer's parameters never reaches the
/// original.
#[derive(Clone, Debug, PartialEq)]
pub struct ConstTensor {
    info: TensorInfo,
    data: Arc<Vec<f32>>,
}

impl ConstTensor {
    pub fn new(info: TensorInfo, data: Vec<f32>) -> Result<Self> {
        if data.len() != info.num_elements() {
            return Err(NxError::InvalidParameter(format!(
                "constant data length {} does not match shape {} (expected {})",
                data.len(),
                info.shape,
                info.num_elements(),
            )));
        }
        Ok(Self {
            info,
            data: Arc::new(data),
        })
    }

    /// Float32 constant filled with `value`.
    pub fn filled(dims: impl AsRef<[u32]>, value: f32) -> Self {
        let info = TensorInfo::new(crate::TensorShape::new(dims), DataType::Float32);
        let data = vec![value; info.num_elements()];
        Self {
            info,
            data: Arc::new(data),
        }
    }

    pub fn info(&self) -> &TensorInfo {
        &self.info
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable access to the payload, copying it if it is shared.
    pub fn data_mut(&mut self) -> &mut [f32] {
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    /// Whether two constants share the same payload allocation.
    pub fn shares_storage_with(&self, other: &ConstTensor) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

/// Externally supplied tensor memory bound to a workload.
pub trait TensorHandle: Send + Sync + std::fmt::Debug {
    /// Resolved descriptor of the memory behind this handle.
    fn tensor_info(&self) -> &TensorInfo;

    /// Access to the concrete handle type for backend-native downcasts.
    fn as_any(&self) -> &dyn Any;
}

/// Host-memory tensor handle holding `f32` elements.
///
/// Every bundled backend accepts this handle. Element storage is guarded by a
/// reader/writer lock; ordering between producers and consumers comes from
/// the graph's topological order, not from this lock.
#[derive(Debug)]
pub struct CpuTensorHandle {
    info: TensorInfo,
    data: RwLock<Vec<f32>>,
}

impl CpuTensorHandle {
    /// Zero-initialised handle for `info`.
    pub fn zeroed(info: TensorInfo) -> Self {
        let n = info.num_elements();
        Self {
            info,
            data: RwLock::new(vec![0.0; n]),
        }
    }

    pub fn from_f32(info: TensorInfo, data: Vec<f32>) -> Result<Self> {
        if data.len() != info.num_elements() {
            return Err(NxError::InvalidParameter(format!(
                "data length {} does not match shape {} (expected {})",
                data.len(),
                info.shape,
                info.num_elements(),
            )));
        }
        Ok(Self {
            info,
            data: RwLock::new(data),
        })
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<f32>> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<f32>> {
        self.data.write()
    }

    /// Overwrite the contents; the length must match the descriptor.
    pub fn copy_from(&self, src: &[f32]) -> Result<()> {
        let mut dst = self.data.write();
        if src.len() != dst.len() {
            return Err(NxError::InvalidParameter(format!(
                "copy of {} elements into tensor {} of {} elements",
                src.len(),
                self.info.shape,
                dst.len(),
            )));
        }
        dst.copy_from_slice(src);
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data.read().clone()
    }
}

impl TensorHandle for CpuTensorHandle {
    fn tensor_info(&self) -> &TensorInfo {
        &self.info
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Downcast a handle to the host-memory representation.
pub fn as_cpu_handle(handle: &dyn TensorHandle) -> Option<&CpuTensorHandle> {
    handle.as_any().downcast_ref::<CpuTensorHandle>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_const_tensor_length_checked() {
        let info = TensorInfo::new([2, 2], DataType::Float32);
        assert!(ConstTensor::new(info.clone(), vec![1.0; 3]).is_err());
        assert!(ConstTensor::new(info, vec![1.0; 4]).is_ok());
    }

    #[test]
    fn test_const_tensor_copy_on_write() {
        let original = ConstTensor::filled([4], 1.0);
        let mut copy = original.clone();
        assert!(copy.shares_storage_with(&original));

        copy.data_mut()[0] = 9.0;
        assert!(!copy.shares_storage_with(&original));
        assert_eq!(original.data(), &[1.0, 1.0, 1.0, 1.0]);
        assert_eq!(copy.data()[0], 9.0);
    }

    #[test]
    fn test_cpu_handle_downcast() {
        let handle: Arc<dyn TensorHandle> =
            Arc::new(CpuTensorHandle::zeroed(TensorInfo::new([3], DataType::Float32)));
        let cpu = as_cpu_handle(handle.as_ref()).unwrap();
        cpu.copy_from(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(cpu.to_vec(), vec![1.0, 2.0, 3.0]);
        assert!(cpu.copy_from(&[1.0]).is_err());
    }
}
