//! Backend-agnostic neural-network execution core.
//!
//! `nx-core` provides the tensor descriptors (`TensorShape`, `TensorInfo`), the
//! layer graph with its connection slots, per-layer shape inference and
//! validation, and the two-phase workload factory protocol that backends
//! implement.
//!
//! # Backends
//!
//! - `nx-ref`: self-contained reference CPU kernels, accepts every Float32 layer
//! - `nx-accel`: staged compute-library style backend with prepared functions

pub mod backend;
pub mod config;
pub mod descriptors;
pub mod graph;
pub mod layer;
pub mod layers;
pub mod logging;
pub mod network;
pub mod schedule;
pub mod tensor;
pub mod types;
pub mod workload;

pub use backend::{BackendId, BackendRegistry, Support, WorkloadFactory};
pub use config::EngineConfig;
pub use graph::Graph;
pub use layer::{InputSlotRef, Layer, LayerId, LayerState, OutputSlotRef};
pub use layers::{LayerKind, LayerType, ShapeError};
pub use logging::{LogSeverity, configure_logging};
pub use network::{LoadedNetwork, TensorHandles, allocate_cpu_tensor_handles};
pub use tensor::{ConstTensor, CpuTensorHandle, TensorHandle};
pub use types::{DataType, TensorInfo, TensorShape};
pub use workload::{QueueDescriptor, Workload, WorkloadInfo};

pub type Result<T> = std::result::Result<T, NxError>;

#[derive(thiserror::Error, Debug)]
pub enum NxError {
    /// Rejected graph mutation. The graph is left unchanged.
    #[error("structural error: {0}")]
    Structural(String),

    #[error(
        "{layer}: TensorShape set on OutputSlot[{slot}] does not match the inferred shape: \
         expected {expected}, got {actual}"
    )]
    ShapeMismatch {
        layer: String,
        slot: usize,
        expected: TensorShape,
        actual: TensorShape,
    },

    #[error("{layer}: shape inference failed: {source}")]
    Shape {
        layer: String,
        #[source]
        source: ShapeError,
    },

    #[error("{layer}: {reason}")]
    LayerValidation { layer: String, reason: String },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("unknown layer {0}")]
    UnknownLayer(LayerId),

    #[error("no backend supports layer {layer}: {}", reasons.join("; "))]
    UnsupportedLayer { layer: String, reasons: Vec<String> },

    #[error("backend {backend}: {message}")]
    Backend { backend: BackendId, message: String },

    #[error("logging: {0}")]
    Logging(String),
}
