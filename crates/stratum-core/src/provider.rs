//! Provider adapter seam and the per-kind registry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use stratum_state::{Attributes, ProviderHandle};

use crate::error::ProviderResult;
use crate::model::{Parameters, ResourceKind};
use crate::readiness::Poll;

/// Translates the generic create/probe/destroy contract into calls against
/// one concrete API.
///
/// `create` and `destroy` only need the request to be *accepted*; the engine
/// then polls `probe_ready` / `probe_destroyed` through a readiness gate.
/// Implementations must be safe to call concurrently for different
/// resources.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Request creation. `parameters` are fully resolved.
    async fn create(&self, id: &str, parameters: &Parameters) -> ProviderResult<ProviderHandle>;

    /// Report whether the resource is usable; `Ready` carries its outputs.
    async fn probe_ready(&self, handle: &ProviderHandle) -> ProviderResult<Poll<Attributes>>;

    /// Request deletion.
    async fn destroy(&self, handle: &ProviderHandle) -> ProviderResult<()>;

    /// `Ready(())` once the resource is gone.
    async fn probe_destroyed(&self, handle: &ProviderHandle) -> ProviderResult<Poll<()>>;
}

/// Adapters keyed by resource kind.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: BTreeMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: impl Into<ResourceKind>, adapter: Arc<dyn ProviderAdapter>) {
        let kind: ResourceKind = kind.into();
        self.adapters.insert(kind.as_str().to_string(), adapter);
    }

    pub fn with(
        mut self,
        kind: impl Into<ResourceKind>,
        adapter: Arc<dyn ProviderAdapter>,
    ) -> Self {
        self.register(kind, adapter);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.adapters.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("kinds", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}
