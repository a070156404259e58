//! Workload factory protocol and backend registry.
//!
//! A backend compiles a layer in two phases. `is_supported` is a pure check
//! against resolved `TensorInfo`s that returns a negative answer for
//! configurations it cannot run. `create_workload` is only called after a
//! positive answer and binds the caller's tensor handles.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::layers::LayerKind;
use crate::types::TensorInfo;
use crate::workload::{QueueDescriptor, Workload, WorkloadInfo};
use crate::Result;

/// Name of a backend, e.g. `CpuRef`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId(pub &'static str);

impl std::fmt::Display for BackendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// Capability answer. `Unsupported` is an expected outcome, not an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Support {
    Supported,
    Unsupported(String),
}

impl Support {
    pub fn is_supported(&self) -> bool {
        matches!(self, Support::Supported)
    }

    pub fn unsupported(reason: impl Into<String>) -> Self {
        Support::Unsupported(reason.into())
    }

    /// Chain two checks, keeping the first rejection.
    pub fn and_then(self, next: impl FnOnce() -> Support) -> Support {
        match self {
            Support::Supported => next(),
            rejected => rejected,
        }
    }
}

/// Require every descriptor to carry `data_type`.
pub fn require_data_type(
    infos: &[TensorInfo],
    data_type: crate::DataType,
    backend: BackendId,
) -> Support {
    match infos.iter().find(|i| i.data_type != data_type) {
        Some(info) => Support::Unsupported(format!(
            "{backend} only supports {data_type} tensors, got {}",
            info.data_type
        )),
        None => Support::Supported,
    }
}

/// Per-backend two-phase layer compiler.
pub trait WorkloadFactory: Send + Sync {
    fn backend_id(&self) -> BackendId;

    /// Pure capability and shape check. Must not allocate device resources.
    fn is_supported(
        &self,
        layer: &LayerKind,
        inputs: &[TensorInfo],
        outputs: &[TensorInfo],
    ) -> Support;

    /// Build an executable workload for a layer `is_supported` accepted.
    ///
    /// Errors here are contract violations, e.g. an out-of-range enumeration
    /// in the parameter record.
    fn create_workload(
        &self,
        descriptor: QueueDescriptor,
        info: WorkloadInfo,
    ) -> Result<Box<dyn Workload>>;
}

/// Registered factories, tried in preference order.
#[derive(Default)]
pub struct BackendRegistry {
    factories: HashMap<BackendId, Arc<dyn WorkloadFactory>>,
    preference: Vec<BackendId>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. Later registrations of the same id replace earlier
    /// ones and keep their preference position.
    pub fn register(&mut self, factory: Arc<dyn WorkloadFactory>) {
        let id = factory.backend_id();
        if self.factories.insert(id, factory).is_none() {
            self.preference.push(id);
        }
        debug!(backend = %id, "registered workload factory");
    }

    pub fn get(&self, id: BackendId) -> Option<&Arc<dyn WorkloadFactory>> {
        self.factories.get(&id)
    }

    /// Reorder backends. Ids not listed keep their relative order after the
    /// listed ones; unknown ids are ignored.
    pub fn set_preference(&mut self, order: &[BackendId]) {
        let mut preference: Vec<BackendId> = Vec::with_capacity(self.preference.len());
        let listed = order.iter().filter(|id| self.factories.contains_key(id));
        for id in listed.chain(&self.preference) {
            if !preference.contains(id) {
                preference.push(*id);
            }
        }
        self.preference = preference;
    }

    pub fn preference(&self) -> &[BackendId] {
        &self.preference
    }

    /// Factories in preference order.
    pub fn factories(&self) -> impl Iterator<Item = &Arc<dyn WorkloadFactory>> + '_ {
        self.preference.iter().filter_map(|id| self.factories.get(id))
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("preference", &self.preference)
            .finish_non_exhaustive()
    }
}
