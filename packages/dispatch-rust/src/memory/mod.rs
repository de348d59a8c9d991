//! In-process implementation of the driver traits.
//!
//! [`MemoryConnector`] keeps one [`MemoryDatabase`] per database name for the
//! lifetime of the connector, so data written through one connection is
//! visible to the next. Useful for tests, the replay tool and local runs
//! without a real document store.

mod collection;
mod filter;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use storelane_core::{Collection, ConnectTarget, Connector, Database};

pub use collection::MemoryCollection;

/// Database name used when the connection URI names none.
pub const DEFAULT_DATABASE: &str = "test";

// ---------------------------------------------------------------------------
// MemoryConnector
// ---------------------------------------------------------------------------

/// [`Connector`] over in-memory databases.
#[derive(Default)]
pub struct MemoryConnector {
    databases: DashMap<String, Arc<MemoryDatabase>>,
    connects: AtomicUsize,
    latency: Duration,
    failure: Mutex<Option<String>>,
}

impl MemoryConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every connect and every operation by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Makes every subsequent connect fail with `message`.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.lock() = Some(message.into());
    }

    /// Lets connects succeed again.
    pub fn recover(&self) {
        *self.failure.lock() = None;
    }

    /// Number of connect attempts so far.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// The database with the given name, created on first use.
    #[must_use]
    pub fn database(&self, name: &str) -> Arc<MemoryDatabase> {
        let name = if name.is_empty() { DEFAULT_DATABASE } else { name };
        self.databases
            .entry(name.to_string())
            .or_insert_with(|| MemoryDatabase::with_latency(name, self.latency))
            .clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, target: &ConnectTarget) -> anyhow::Result<Arc<dyn Database>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let failure = self.failure.lock().clone();
        if let Some(message) = failure {
            anyhow::bail!(message);
        }
        tracing::debug!(database = %target.database, "memory connection opened");
        Ok(self.database(&target.database))
    }
}

// ---------------------------------------------------------------------------
// MemoryDatabase
// ---------------------------------------------------------------------------

/// A named set of in-memory collections.
pub struct MemoryDatabase {
    name: String,
    collections: DashMap<String, Arc<MemoryCollection>>,
    latency: Duration,
    closes: AtomicUsize,
}

impl MemoryDatabase {
    #[must_use]
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_latency(name, Duration::ZERO)
    }

    #[must_use]
    pub fn with_latency(name: &str, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            collections: DashMap::new(),
            latency,
            closes: AtomicUsize::new(0),
        })
    }

    /// Concrete handle to a collection, created on first use.
    #[must_use]
    pub fn memory_collection(&self, name: &str) -> Arc<MemoryCollection> {
        self.collections
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryCollection::new(name, self.latency)))
            .clone()
    }

    /// How many times `close` was called.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn collection(&self, name: &str) -> Arc<dyn Collection> {
        self.memory_collection(name)
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
