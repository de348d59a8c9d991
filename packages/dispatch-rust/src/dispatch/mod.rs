//! Task intake and execution.
//!
//! A [`Dispatcher`] serves one consumer. All dispatchers of a process share a
//! [`DispatchContext`]: the resource pool, the operation registry and the
//! driver connector.

mod dispatcher;
mod task;

use std::sync::Arc;

use storelane_core::Connector;

use crate::operations::OperationRegistry;
use crate::pool::ResourcePool;

pub use dispatcher::Dispatcher;
pub use task::Task;

/// Process-wide collaborators shared by every dispatcher.
#[derive(Clone)]
pub struct DispatchContext {
    pub pool: Arc<ResourcePool>,
    pub registry: Arc<OperationRegistry>,
    pub connector: Arc<dyn Connector>,
}

impl DispatchContext {
    /// A fresh pool and the standard operation table over `connector`.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            pool: Arc::new(ResourcePool::new()),
            registry: Arc::new(OperationRegistry::standard()),
            connector,
        }
    }

    #[must_use]
    pub fn with_pool(mut self, pool: Arc<ResourcePool>) -> Self {
        self.pool = pool;
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: OperationRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }
}

impl std::fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchContext")
            .field("pool_entries", &self.pool.len())
            .field("operations", &self.registry.len())
            .finish_non_exhaustive()
    }
}
