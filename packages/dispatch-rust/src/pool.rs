//! Keyed, reference-counted pool of lazily connected resources.
//!
//! Each [`DeploymentIdentity`] maps to at most one live entry. The first
//! acquirer invokes the connection factory; everyone arriving before the
//! connection settles shares the same [`ResourceFuture`]. The entry is removed
//! when the last holder releases it, and the connection (if one was ever
//! created) is closed exactly once.

use std::future::Future;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::Mutex;
use storelane_core::{Database, DeploymentIdentity, DispatchError};

use crate::admission::AdmissionQueue;
use crate::observer::{LoggingObserver, ResourceObserver};

/// Memoized connection attempt shared by every acquirer of one entry.
pub type ResourceFuture = Shared<BoxFuture<'static, Result<Arc<PooledResource>, DispatchError>>>;

/// Lifecycle of a pool entry's connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationState {
    Pending,
    Ready,
    Failed,
}

// ---------------------------------------------------------------------------
// PooledResource
// ---------------------------------------------------------------------------

/// A connected database plus the admission gate of everything running on it.
pub struct PooledResource {
    identity: DeploymentIdentity,
    database: Arc<dyn Database>,
    admission: Arc<AdmissionQueue>,
}

impl PooledResource {
    fn new(
        identity: DeploymentIdentity,
        database: Arc<dyn Database>,
        limit: usize,
        observer: Arc<dyn ResourceObserver>,
    ) -> Self {
        let admission = AdmissionQueue::new(identity.clone(), limit, observer);
        Self {
            identity,
            database,
            admission,
        }
    }

    #[must_use]
    pub fn identity(&self) -> &DeploymentIdentity {
        &self.identity
    }

    #[must_use]
    pub fn database(&self) -> &Arc<dyn Database> {
        &self.database
    }

    #[must_use]
    pub fn admission(&self) -> &Arc<AdmissionQueue> {
        &self.admission
    }
}

impl std::fmt::Debug for PooledResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledResource")
            .field("identity", &self.identity)
            .field("database", &self.database.name())
            .field("limit", &self.admission.limit())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ResourcePool
// ---------------------------------------------------------------------------

struct PoolEntry {
    refcount: usize,
    state: Arc<Mutex<CreationState>>,
    resource: ResourceFuture,
}

/// Process-wide pool, constructed once and shared by reference with every
/// dispatcher.
pub struct ResourcePool {
    entries: DashMap<DeploymentIdentity, PoolEntry>,
    observer: Arc<dyn ResourceObserver>,
}

impl ResourcePool {
    /// Creates an empty pool that reports through [`LoggingObserver`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_observer(Arc::new(LoggingObserver))
    }

    #[must_use]
    pub fn with_observer(observer: Arc<dyn ResourceObserver>) -> Self {
        Self {
            entries: DashMap::new(),
            observer,
        }
    }

    /// Takes a reference on the entry for `identity`, creating it with
    /// `factory` if absent.
    ///
    /// The reference count is incremented before this returns, even while the
    /// connection is still pending. `factory` is invoked only when a new entry
    /// is created. `limit` configures the admission gate of a new resource and
    /// is ignored for an existing entry.
    pub fn acquire<F, Fut>(
        &self,
        identity: &DeploymentIdentity,
        limit: usize,
        factory: F,
    ) -> ResourceFuture
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Arc<dyn Database>>> + Send + 'static,
    {
        let mut entry = self
            .entries
            .entry(identity.clone())
            .or_insert_with(|| self.create_entry(identity.clone(), limit, factory()));
        entry.refcount += 1;
        tracing::debug!(deployment = %identity, refcount = entry.refcount, "resource acquired");
        entry.resource.clone()
    }

    fn create_entry<Fut>(&self, identity: DeploymentIdentity, limit: usize, connect: Fut) -> PoolEntry
    where
        Fut: Future<Output = anyhow::Result<Arc<dyn Database>>> + Send + 'static,
    {
        let state = Arc::new(Mutex::new(CreationState::Pending));
        let settled = Arc::clone(&state);
        let observer = Arc::clone(&self.observer);
        tracing::info!(deployment = %identity, limit, "connecting");
        let resource = async move {
            match connect.await {
                Ok(database) => {
                    *settled.lock() = CreationState::Ready;
                    tracing::info!(deployment = %identity, database = database.name(), "connected");
                    Ok(Arc::new(PooledResource::new(identity, database, limit, observer)))
                }
                Err(err) => {
                    *settled.lock() = CreationState::Failed;
                    tracing::error!(deployment = %identity, error = %err, "failed to create client");
                    Err(DispatchError::connection(identity.to_string(), err))
                }
            }
        }
        .boxed()
        .shared();
        PoolEntry {
            refcount: 0,
            state,
            resource,
        }
    }

    /// Drops one reference. The last release removes the entry and closes the
    /// connection once it has settled successfully.
    ///
    /// Close errors go to the observer. Releasing an unknown identity is a no-op.
    pub fn release(&self, identity: &DeploymentIdentity) {
        let Entry::Occupied(mut occupied) = self.entries.entry(identity.clone()) else {
            return;
        };
        let entry = occupied.get_mut();
        entry.refcount = entry.refcount.saturating_sub(1);
        tracing::debug!(deployment = %identity, refcount = entry.refcount, "resource released");
        if entry.refcount > 0 {
            return;
        }
        let PoolEntry { state, resource, .. } = occupied.remove();
        if *state.lock() == CreationState::Failed {
            // The client was never created.
            return;
        }
        self.close_when_settled(identity.clone(), resource);
    }

    fn close_when_settled(&self, identity: DeploymentIdentity, resource: ResourceFuture) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                deployment = %identity,
                "released outside a runtime, client left unclosed"
            );
            return;
        };
        let observer = Arc::clone(&self.observer);
        handle.spawn(async move {
            let Ok(resource) = resource.await else {
                return;
            };
            match resource.database().close().await {
                Ok(()) => tracing::info!(deployment = %identity, "client closed"),
                Err(err) => observer.on_close_error(&identity, &err),
            }
        });
    }

    /// Current reference count, 0 when no entry exists.
    #[must_use]
    pub fn refcount(&self, identity: &DeploymentIdentity) -> usize {
        self.entries.get(identity).map_or(0, |entry| entry.refcount)
    }

    /// Creation state of the entry, if one exists.
    #[must_use]
    pub fn creation_state(&self, identity: &DeploymentIdentity) -> Option<CreationState> {
        self.entries.get(identity).map(|entry| *entry.state.lock())
    }

    #[must_use]
    pub fn contains(&self, identity: &DeploymentIdentity) -> bool {
        self.entries.contains_key(identity)
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ResourcePool {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
