use std::sync::Arc;

use crate::config::ForestConfig;
use crate::coordinator::MutationCoordinator;
use crate::lock::TreeLocks;
use crate::query::QueryFacade;
use crate::store::NodeStore;

/// Entry point tying one store to its coordinator and query façade.
///
/// Cheap to clone; clones share the store, the configuration and the lock
/// registry, so every writer of one forest must go through clones of the same
/// repository.
pub struct TreeRepository<S> {
    store: Arc<S>,
    config: Arc<ForestConfig>,
    coordinator: MutationCoordinator<S>,
    query: QueryFacade<S>,
}

impl<S> Clone for TreeRepository<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            coordinator: self.coordinator.clone(),
            query: self.query.clone(),
        }
    }
}

impl<S> TreeRepository<S>
where
    S: NodeStore,
{
    pub fn new(store: Arc<S>, config: ForestConfig) -> Self {
        let config = Arc::new(config);
        let locks = Arc::new(TreeLocks::new());
        Self {
            coordinator: MutationCoordinator::new(
                Arc::clone(&store),
                Arc::clone(&config),
                locks,
            ),
            query: QueryFacade::new(Arc::clone(&store), Arc::clone(&config)),
            store,
            config,
        }
    }

    /// Structural writes.
    pub fn coordinator(&self) -> &MutationCoordinator<S> {
        &self.coordinator
    }

    /// Cached reads.
    pub fn query(&self) -> &QueryFacade<S> {
        &self.query
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &ForestConfig {
        &self.config
    }
}
