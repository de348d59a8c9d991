use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use storelane_core::{ConsumerId, DeploymentIdentity, DispatchError, Outcome, OutcomeSink};

use super::{DispatchContext, Task};
use crate::admission::{Admission, AdmissionSlot, QueuedWork};
use crate::config::{DeploymentConfig, DispatcherSettings};
use crate::operations::{normalize_arguments, OperationAdapter, OperationRegistry, OutcomeStream, Scope, ScopeLevel};
use crate::pool::{PooledResource, ResourcePool};
use crate::profiling::{LogStatusSink, ProfilingReporter, ProfilingSnapshot, StatusSink};

enum DispatcherState {
    /// No usable deployment. Every task fails with this error.
    Unconfigured(DispatchError),
    /// Waiting for the pooled resource; tasks are buffered in arrival order.
    Connecting(Vec<Task>),
    Ready(Arc<PooledResource>),
    /// The shared connection attempt failed.
    Failed(DispatchError),
    Closed,
}

/// One consumer's front end to a pooled resource.
///
/// Resolves each task's operation and collection, admits it through the
/// resource's admission queue and forwards its outcomes to the task's sink.
pub struct Dispatcher {
    consumer: ConsumerId,
    identity: Option<DeploymentIdentity>,
    settings: DispatcherSettings,
    pool: Arc<ResourcePool>,
    registry: Arc<OperationRegistry>,
    state: Mutex<DispatcherState>,
    profiling: Arc<ProfilingReporter>,
    this: Weak<Dispatcher>,
}

impl Dispatcher {
    /// Starts a dispatcher that reports status through `tracing`.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn start(
        ctx: &DispatchContext,
        deployment: Option<&DeploymentConfig>,
        settings: DispatcherSettings,
    ) -> Arc<Self> {
        Self::start_with_status(ctx, deployment, settings, Arc::new(LogStatusSink))
    }

    /// Starts a dispatcher and begins acquiring its pooled resource.
    ///
    /// A missing or invalid deployment does not fail here: the dispatcher
    /// starts unconfigured and fails every task it receives.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn start_with_status(
        ctx: &DispatchContext,
        deployment: Option<&DeploymentConfig>,
        settings: DispatcherSettings,
        status: Arc<dyn StatusSink>,
    ) -> Arc<Self> {
        let consumer = ConsumerId::next();
        let profiling = ProfilingReporter::new(consumer, settings.status_interval, status);

        let (identity, state, pending) = match deployment {
            None => (
                None,
                DispatcherState::Unconfigured(DispatchError::configuration("no deployment configured")),
                None,
            ),
            Some(config) => match config.validate() {
                Err(err) => (
                    None,
                    DispatcherState::Unconfigured(DispatchError::configuration(err.to_string())),
                    None,
                ),
                Ok(()) => {
                    let identity = config.identity();
                    let connector = Arc::clone(&ctx.connector);
                    let target = config.connect_target();
                    let resource = ctx.pool.acquire(&identity, config.limit(), move || async move {
                        connector.connect(&target).await
                    });
                    (Some(identity), DispatcherState::Connecting(Vec::new()), Some(resource))
                }
            },
        };

        if let DispatcherState::Unconfigured(err) = &state {
            tracing::warn!(consumer = %consumer, error = %err, "dispatcher has no usable deployment");
        }

        let dispatcher = Arc::new_cyclic(|this| Self {
            consumer,
            identity,
            settings,
            pool: Arc::clone(&ctx.pool),
            registry: Arc::clone(&ctx.registry),
            state: Mutex::new(state),
            profiling,
            this: this.clone(),
        });

        if let Some(resource) = pending {
            let this = Arc::downgrade(&dispatcher);
            tokio::spawn(async move {
                let result = resource.await;
                if let Some(dispatcher) = this.upgrade() {
                    dispatcher.on_connected(result);
                }
            });
        }
        tracing::debug!(consumer = %consumer, deployment = ?dispatcher.identity, "dispatcher started");
        dispatcher
    }

    /// Accepts a task. Its outcomes arrive on the task's sink.
    pub fn submit(&self, task: Task) {
        self.profiling.record_submitted();
        let mut state = self.state.lock();
        let failure = match &mut *state {
            DispatcherState::Connecting(buffered) => {
                buffered.push(task);
                return;
            }
            DispatcherState::Ready(resource) => {
                // Admitting under the lock keeps arrival order; submit never runs work inline.
                self.admit(resource, task);
                return;
            }
            DispatcherState::Unconfigured(err) | DispatcherState::Failed(err) => err.clone(),
            DispatcherState::Closed => DispatchError::ConsumerClosed {
                consumer: self.consumer.to_string(),
            },
        };
        drop(state);
        self.deliver(task.sink.as_ref(), Outcome::Error(failure));
    }

    /// Stops the dispatcher and releases its pool reference. Idempotent.
    ///
    /// Tasks still buffered or queued for this dispatcher are dropped.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), DispatcherState::Closed);
        match previous {
            DispatcherState::Closed => return,
            DispatcherState::Connecting(buffered) => {
                for task in buffered {
                    tracing::warn!(
                        consumer = %self.consumer,
                        operation = ?task.operation,
                        "consumer was closed while having a pending task"
                    );
                }
            }
            DispatcherState::Unconfigured(_) | DispatcherState::Ready(_) | DispatcherState::Failed(_) => {}
        }
        if let Some(identity) = &self.identity {
            self.pool.release(identity);
        }
        tracing::debug!(consumer = %self.consumer, "dispatcher closed");
    }

    #[must_use]
    pub fn consumer(&self) -> ConsumerId {
        self.consumer
    }

    /// Pool key of the deployment, `None` when unconfigured.
    #[must_use]
    pub fn identity(&self) -> Option<&DeploymentIdentity> {
        self.identity.as_ref()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        !matches!(*self.state.lock(), DispatcherState::Closed)
    }

    /// The connected resource, once ready.
    #[must_use]
    pub fn resource(&self) -> Option<Arc<PooledResource>> {
        match &*self.state.lock() {
            DispatcherState::Ready(resource) => Some(Arc::clone(resource)),
            _ => None,
        }
    }

    #[must_use]
    pub fn profiling(&self) -> ProfilingSnapshot {
        self.profiling.snapshot()
    }

    fn on_connected(&self, result: Result<Arc<PooledResource>, DispatchError>) {
        let mut state = self.state.lock();
        let DispatcherState::Connecting(buffered) = &mut *state else {
            return;
        };
        let buffered = std::mem::take(buffered);
        match result {
            Ok(resource) => {
                tracing::debug!(consumer = %self.consumer, buffered = buffered.len(), "resource ready");
                for task in buffered {
                    self.admit(&resource, task);
                }
                *state = DispatcherState::Ready(resource);
            }
            Err(err) => {
                *state = DispatcherState::Failed(err.clone());
                drop(state);
                for task in buffered {
                    self.deliver(task.sink.as_ref(), Outcome::Error(err.clone()));
                }
            }
        }
    }

    fn admit(&self, resource: &Arc<PooledResource>, task: Task) {
        let work = QueuedTask {
            dispatcher: self.this.clone(),
            consumer: self.consumer,
            resource: Arc::clone(resource),
            task,
        };
        if let Admission::Queued { position } = resource.admission().submit(Box::new(work)) {
            tracing::trace!(consumer = %self.consumer, position, "task waiting for a slot");
        }
    }

    async fn execute(&self, resource: &PooledResource, task: Task, slot: AdmissionSlot) {
        let Task {
            operation,
            scope,
            payload,
            sink,
        } = task;
        let terminated = AtomicBool::new(false);
        let tracked = |outcome: Outcome| {
            if outcome.is_terminal() {
                terminated.store(true, Ordering::Release);
            }
            sink.deliver(outcome);
        };
        let run = AssertUnwindSafe(async {
            let outcomes = self
                .resolve(resource, operation, scope)
                .and_then(|(adapter, scope)| {
                    adapter.invoke(scope, normalize_arguments(payload, adapter.arity()))
                });
            match outcomes {
                Ok(outcomes) => self.drive(outcomes, &tracked).await,
                Err(err) => self.deliver(&tracked, Outcome::Error(err)),
            }
        });
        if let Err(panic) = run.catch_unwind().await {
            let message = panic_message(panic.as_ref());
            tracing::error!(consumer = %self.consumer, panic = %message, "operation panicked");
            if !terminated.load(Ordering::Acquire) {
                let err = DispatchError::operation(anyhow::anyhow!("operation panicked: {message}"));
                self.deliver(sink.as_ref(), Outcome::Error(err));
            }
        }
        slot.release();
    }

    /// Picks the adapter and its scope. Dispatcher defaults win over the task.
    fn resolve(
        &self,
        resource: &PooledResource,
        operation: Option<String>,
        scope: Option<String>,
    ) -> Result<(OperationAdapter, Scope), DispatchError> {
        let name = self
            .settings
            .operation
            .clone()
            .or(operation)
            .filter(|name| !name.is_empty())
            .ok_or(DispatchError::MissingOperation)?;
        let adapter = *self
            .registry
            .get(&name)
            .ok_or(DispatchError::UnknownOperation { name })?;
        let database = resource.database();
        let scope = match adapter.scope() {
            ScopeLevel::Database => Scope::Database(Arc::clone(database)),
            ScopeLevel::Collection => {
                let collection = self
                    .settings
                    .collection
                    .clone()
                    .or(scope)
                    .filter(|name| !name.is_empty())
                    .ok_or(DispatchError::MissingCollection)?;
                Scope::Collection(database.collection(&collection))
            }
        };
        Ok((adapter, scope))
    }

    /// Forwards outcomes until the first terminal one.
    async fn drive(&self, mut outcomes: OutcomeStream, sink: &dyn OutcomeSink) {
        while let Some(outcome) = outcomes.next().await {
            let terminal = outcome.is_terminal();
            self.deliver(sink, outcome);
            if terminal {
                return;
            }
        }
        self.deliver(
            sink,
            Outcome::Error(DispatchError::InternalInvariant(
                "outcome stream ended without a terminal outcome",
            )),
        );
    }

    fn deliver(&self, sink: &dyn OutcomeSink, outcome: Outcome) {
        match &outcome {
            Outcome::Iteration(_) => {}
            Outcome::End(_) => self.profiling.record_succeeded(),
            Outcome::Error(err) => {
                tracing::warn!(consumer = %self.consumer, kind = ?err.kind(), error = %err, "task failed");
                self.profiling.record_failed();
            }
        }
        sink.deliver(outcome);
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("consumer", &self.consumer)
            .field("identity", &self.identity)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// QueuedTask
// ---------------------------------------------------------------------------

/// A task bound to its dispatcher while it waits in an admission queue.
struct QueuedTask {
    dispatcher: Weak<Dispatcher>,
    consumer: ConsumerId,
    resource: Arc<PooledResource>,
    task: Task,
}

impl QueuedWork for QueuedTask {
    fn consumer(&self) -> ConsumerId {
        self.consumer
    }

    fn is_live(&self) -> bool {
        self.dispatcher
            .upgrade()
            .is_some_and(|dispatcher| dispatcher.is_open())
    }

    fn run(self: Box<Self>, slot: AdmissionSlot) -> BoxFuture<'static, ()> {
        let QueuedTask {
            dispatcher,
            consumer,
            resource,
            task,
        } = *self;
        async move {
            match dispatcher.upgrade().filter(|dispatcher| dispatcher.is_open()) {
                Some(dispatcher) => dispatcher.execute(&resource, task, slot).await,
                None => {
                    tracing::debug!(consumer = %consumer, "consumer closed before its task started");
                    resource.admission().report_dropped(consumer);
                    slot.release();
                }
            }
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
