//! Backend-private staging tensors and the operands native functions read.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};

use nx_core::tensor::as_cpu_handle;
use nx_core::{TensorHandle, TensorShape};

use crate::context::AccelContext;
use crate::{AccelError, Result};

/// Device-side buffer owned by a workload. Freed, and un-charged from its
/// context, when the last reference drops.
#[derive(Debug)]
pub struct StagingTensor {
    shape: TensorShape,
    data: RwLock<Vec<f32>>,
    ctx: Arc<AccelContext>,
}

impl StagingTensor {
    pub(crate) fn new(ctx: Arc<AccelContext>, shape: TensorShape) -> Result<Self> {
        let len = shape.num_elements();
        if len == 0 {
            return Err(AccelError::ZeroLength);
        }
        ctx.charge(len * size_of::<f32>());
        Ok(Self {
            shape,
            data: RwLock::new(vec![0.0; len]),
            ctx,
        })
    }

    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.shape.num_elements()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write(&self, src: &[f32]) -> Result<()> {
        let mut dst = self.data.write();
        if src.len() != dst.len() {
            return Err(AccelError::LengthMismatch {
                shape: self.shape.clone(),
                expected: dst.len(),
                got: src.len(),
            });
        }
        dst.copy_from_slice(src);
        Ok(())
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<f32>> {
        self.data.read()
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data.read().clone()
    }
}

impl Drop for StagingTensor {
    fn drop(&mut self) {
        self.ctx.release(self.len() * size_of::<f32>());
    }
}

/// Tensor a native function reads or writes: caller memory imported
/// without copying ownership, or a staging tensor.
#[derive(Debug, Clone)]
pub enum Operand {
    Imported(Arc<dyn TensorHandle>),
    Staged(Arc<StagingTensor>),
}

impl Operand {
    /// Import a caller handle. Only host-accessible handles can be imported.
    pub fn import(handle: Arc<dyn TensorHandle>) -> Result<Self> {
        if as_cpu_handle(handle.as_ref()).is_none() {
            return Err(AccelError::ForeignHandle);
        }
        Ok(Operand::Imported(handle))
    }

    pub fn shape(&self) -> &TensorShape {
        match self {
            Operand::Imported(h) => &h.tensor_info().shape,
            Operand::Staged(t) => t.shape(),
        }
    }

    pub fn read(&self) -> Result<Vec<f32>> {
        match self {
            Operand::Imported(h) => as_cpu_handle(h.as_ref())
                .map(|c| c.to_vec())
                .ok_or(AccelError::ForeignHandle),
            Operand::Staged(t) => Ok(t.to_vec()),
        }
    }

    pub fn write(&self, src: &[f32]) -> Result<()> {
        match self {
            Operand::Imported(h) => {
                let cpu = as_cpu_handle(h.as_ref()).ok_or(AccelError::ForeignHandle)?;
                cpu.copy_from(src).map_err(|_| AccelError::LengthMismatch {
                    shape: h.tensor_info().shape.clone(),
                    expected: h.tensor_info().num_elements(),
                    got: src.len(),
                })
            }
            Operand::Staged(t) => t.write(src),
        }
    }
}
