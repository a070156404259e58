//! Native functions: the backend's executable operators.
//!
//! Each function follows the same life cycle:
//!
//! 1. `validate(..)`: static, side-effect free capability check used by
//!    the factory's `is_supported`.
//! 2. `configure(..)`: binds operands and precomputes the execution plan.
//!    Fails only for configurations `validate` rejects.
//! 3. [`NativeFunction::prepare`]: uploads constant operands into their
//!    staging tensors. Runs once; later calls are no-ops.
//! 4. [`NativeFunction::run`]: executes the plan. Repeatable.

pub mod activation;
pub mod lstm;
pub mod pooling;

use std::sync::Arc;

use nx_core::ConstTensor;

use crate::context::AccelContext;
use crate::staging::StagingTensor;
use crate::{AccelError, Result};

pub use activation::{ElementwiseFunction, SoftmaxFunction};
pub use lstm::{LstmFunction, LstmOperands, LstmWeights};
pub use nx_core::descriptors::LstmTensor;
pub use pooling::PoolingFunction;

pub trait NativeFunction: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Upload constants. Idempotent.
    fn prepare(&mut self) -> Result<()>;

    fn run(&self) -> Result<()>;
}

/// Staging tensor paired with the constant it receives during `prepare`.
#[derive(Debug, Clone)]
pub struct StagedConstant {
    pub tensor: Arc<StagingTensor>,
    pub source: ConstTensor,
}

impl StagedConstant {
    /// Allocate a staging tensor shaped like `source`. Nothing is copied yet.
    pub fn allocate(ctx: &Arc<AccelContext>, source: &ConstTensor) -> Result<Self> {
        Ok(Self {
            tensor: ctx.allocate(source.info().shape.clone())?,
            source: source.clone(),
        })
    }
}

/// Upload every pending constant, leaving the list empty.
pub(crate) fn upload_pending(ctx: &AccelContext, pending: &mut Vec<StagedConstant>) -> Result<()> {
    for constant in pending.drain(..) {
        ctx.upload(&constant.tensor, constant.source.data())?;
    }
    Ok(())
}

pub(crate) fn ensure_prepared(prepared: bool, name: &'static str) -> Result<()> {
    if prepared {
        Ok(())
    } else {
        Err(AccelError::Unprepared(name))
    }
}
