//! Side-channel for conditions that must be reported but never thrown.
//!
//! Close failures, dropped queued tasks and admission bookkeeping violations
//! surface here instead of at the call site that triggered them.

use std::sync::Arc;

use storelane_core::{ConsumerId, DeploymentIdentity, DispatchError};

/// Receives resource-level warnings and errors.
///
/// Used as `Arc<dyn ResourceObserver>` by the pool and every admission queue
/// it creates.
pub trait ResourceObserver: Send + Sync {
    /// Closing the underlying database failed.
    fn on_close_error(&self, identity: &DeploymentIdentity, error: &anyhow::Error);

    /// A queued task was discarded because its consumer is gone.
    fn on_dropped_task(&self, identity: &DeploymentIdentity, consumer: ConsumerId);

    /// An admission bookkeeping check failed.
    fn on_invariant_violation(&self, identity: &DeploymentIdentity, error: &DispatchError);
}

/// Default observer: reports through `tracing` and bumps `metrics` counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl ResourceObserver for LoggingObserver {
    fn on_close_error(&self, identity: &DeploymentIdentity, error: &anyhow::Error) {
        metrics::counter!("storelane_close_errors_total").increment(1);
        tracing::error!(deployment = %identity, error = %error, "error while closing client");
    }

    fn on_dropped_task(&self, identity: &DeploymentIdentity, consumer: ConsumerId) {
        metrics::counter!("storelane_dropped_tasks_total").increment(1);
        tracing::warn!(
            deployment = %identity,
            consumer = %consumer,
            "consumer was removed while having a pending task"
        );
    }

    fn on_invariant_violation(&self, identity: &DeploymentIdentity, error: &DispatchError) {
        metrics::counter!("storelane_invariant_violations_total").increment(1);
        tracing::error!(deployment = %identity, error = %error, "admission bookkeeping is inconsistent");
    }
}

/// Fans out notifications to several observers.
#[derive(Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn ResourceObserver>>,
}

impl CompositeObserver {
    #[must_use]
    pub fn new(observers: Vec<Arc<dyn ResourceObserver>>) -> Self {
        Self { observers }
    }

    /// Adds an observer after construction.
    pub fn add(&mut self, observer: Arc<dyn ResourceObserver>) {
        self.observers.push(observer);
    }
}

impl ResourceObserver for CompositeObserver {
    fn on_close_error(&self, identity: &DeploymentIdentity, error: &anyhow::Error) {
        for observer in &self.observers {
            observer.on_close_error(identity, error);
        }
    }

    fn on_dropped_task(&self, identity: &DeploymentIdentity, consumer: ConsumerId) {
        for observer in &self.observers {
            observer.on_dropped_task(identity, consumer);
        }
    }

    fn on_invariant_violation(&self, identity: &DeploymentIdentity, error: &DispatchError) {
        for observer in &self.observers {
            observer.on_invariant_violation(identity, error);
        }
    }
}

/// Observer that records every notification. Test support.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingObserver {
    pub close_errors: parking_lot::Mutex<Vec<String>>,
    pub dropped: parking_lot::Mutex<Vec<ConsumerId>>,
    pub violations: parking_lot::Mutex<Vec<String>>,
}

#[cfg(test)]
impl ResourceObserver for RecordingObserver {
    fn on_close_error(&self, _identity: &DeploymentIdentity, error: &anyhow::Error) {
        self.close_errors.lock().push(error.to_string());
    }

    fn on_dropped_task(&self, _identity: &DeploymentIdentity, consumer: ConsumerId) {
        self.dropped.lock().push(consumer);
    }

    fn on_invariant_violation(&self, _identity: &DeploymentIdentity, error: &DispatchError) {
        self.violations.lock().push(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_fans_out_to_all_observers() {
        let first = Arc::new(RecordingObserver::default());
        let second = Arc::new(RecordingObserver::default());
        let mut composite = CompositeObserver::new(vec![first.clone()]);
        composite.add(second.clone());
        composite.add(Arc::new(LoggingObserver));

        let identity = DeploymentIdentity::service("orders");
        composite.on_dropped_task(&identity, ConsumerId(9));
        composite.on_close_error(&identity, &anyhow::anyhow!("socket closed"));

        assert_eq!(*first.dropped.lock(), vec![ConsumerId(9)]);
        assert_eq!(*second.dropped.lock(), vec![ConsumerId(9)]);
        assert_eq!(*second.close_errors.lock(), vec!["socket closed".to_string()]);
    }
}
