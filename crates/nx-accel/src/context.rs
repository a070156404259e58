//! Shared device context: staging-memory accounting.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::info;

use nx_core::TensorShape;

use crate::Result;
use crate::staging::StagingTensor;

/// Snapshot of staging memory, used to verify release behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StagingTelemetry {
    /// Bytes held by live staging tensors.
    pub live_bytes: usize,
    /// High-water mark of `live_bytes`.
    pub peak_bytes: usize,
    /// Number of live staging tensors.
    pub live_tensors: usize,
    /// Constant uploads performed since creation.
    pub uploads: usize,
}

/// Device context shared by a factory and every workload it builds.
#[derive(Debug, Default)]
pub struct AccelContext {
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    live_tensors: AtomicUsize,
    uploads: AtomicUsize,
}

impl AccelContext {
    pub fn new() -> Arc<Self> {
        info!("Initialized accelerator context");
        Arc::new(Self::default())
    }

    /// Allocate a zeroed staging tensor charged to this context.
    pub fn allocate(self: &Arc<Self>, shape: TensorShape) -> Result<Arc<StagingTensor>> {
        StagingTensor::new(Arc::clone(self), shape).map(Arc::new)
    }

    /// Copy constant data into a staging tensor.
    pub fn upload(&self, tensor: &StagingTensor, data: &[f32]) -> Result<()> {
        tensor.write(data)?;
        self.uploads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn telemetry(&self) -> StagingTelemetry {
        StagingTelemetry {
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
            live_tensors: self.live_tensors.load(Ordering::Relaxed),
            uploads: self.uploads.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn charge(&self, bytes: usize) {
        let live = self.live_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.peak_bytes.fetch_max(live, Ordering::Relaxed);
        self.live_tensors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn release(&self, bytes: usize) {
        self.live_bytes.fetch_sub(bytes, Ordering::Relaxed);
        self.live_tensors.fetch_sub(1, Ordering::Relaxed);
    }
}
