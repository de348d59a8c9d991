//! storelane dispatch: a task-dispatch layer in front of a document-store
//! driver.
//!
//! Consumers submit [`dispatch::Task`]s to a [`dispatch::Dispatcher`]. Each
//! dispatcher shares a pooled, lazily connected resource per deployment
//! identity ([`pool::ResourcePool`]), passes through that resource's bounded
//! [`admission::AdmissionQueue`] and reports every task as a stream of
//! [`storelane_core::Outcome`]s.

pub mod admission;
pub mod config;
pub mod dispatch;
pub mod memory;
pub mod observability;
pub mod observer;
pub mod operations;
pub mod pool;
pub mod profiling;

pub use admission::{Admission, AdmissionQueue, AdmissionSlot, QueuedWork};
pub use config::{ConfigError, DeploymentConfig, DispatcherSettings};
pub use dispatch::{DispatchContext, Dispatcher, Task};
pub use observer::{CompositeObserver, LoggingObserver, ResourceObserver};
pub use operations::{normalize_arguments, OperationAdapter, OperationRegistry};
pub use pool::{CreationState, PooledResource, ResourcePool};
pub use profiling::{LogStatusSink, ProfilingReporter, ProfilingSnapshot, StatusSink};
