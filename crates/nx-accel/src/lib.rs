//! Staged accelerator backend.
//!
//! Models a vendor compute library: every workload owns backend-private
//! staging tensors, wires them into a native function through
//! `validate / configure / prepare / run`, uploads constant operands once
//! during `prepare`, and releases any staging tensor the configured function
//! does not reference.
//!
//! Only a subset of layer kinds has a native function. Everything else is
//! answered with `Support::Unsupported` so the loader falls back to another
//! backend.

pub mod context;
pub mod factory;
pub mod functions;
pub mod staging;
pub mod workloads;

pub use context::{AccelContext, StagingTelemetry};
pub use factory::AccelWorkloadFactory;
pub use staging::{Operand, StagingTensor};

use nx_core::config::ACCEL_BACKEND;
use nx_core::{NxError, TensorShape};

pub type Result<T> = std::result::Result<T, AccelError>;

#[derive(thiserror::Error, Debug)]
pub enum AccelError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("staging tensor has zero elements")]
    ZeroLength,

    #[error("length mismatch for {shape}: expected {expected} elements, got {got}")]
    LengthMismatch {
        shape: TensorShape,
        expected: usize,
        got: usize,
    },

    #[error("function {0} was run before being prepared")]
    Unprepared(&'static str),

    #[error("tensor handle is not host-accessible")]
    ForeignHandle,
}

impl From<AccelError> for NxError {
    fn from(err: AccelError) -> Self {
        NxError::Backend {
            backend: ACCEL_BACKEND,
            message: err.to_string(),
        }
    }
}
