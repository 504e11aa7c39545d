//! Service state management.

use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::store::RunStore;

/// Shared service state.
///
/// Contains the ledger store and the pipeline configuration it was opened with.
pub struct ServiceState<S: RunStore> {
    /// The ledger and run-metadata store.
    pub store: Arc<S>,
    /// Configuration in effect.
    pub config: Arc<PipelineConfig>,
}

impl<S: RunStore> ServiceState<S> {
    /// Create new service state over a store.
    pub fn new(store: S, config: PipelineConfig) -> Self {
        Self::from_shared(Arc::new(store), config)
    }

    /// Create service state over a store shared with pipelines.
    pub fn from_shared(store: Arc<S>, config: PipelineConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }
}

impl<S: RunStore> Clone for ServiceState<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[test]
    fn test_clone_shares_store() {
        let state = ServiceState::new(InMemoryStore::new(), PipelineConfig::default());
        let cloned = state.clone();
        assert!(Arc::ptr_eq(&state.store, &cloned.store));
        assert_eq!(cloned.config.num_physical_shards, 4);
    }
}
