//! Per-resource bounded-concurrency gate with a FIFO wait list.
//!
//! A granted task holds an [`AdmissionSlot`]. Releasing the slot hands it
//! straight to the oldest live waiter without lowering `in_flight`, so the
//! bound holds at every instant. `in_flight` only drops once nobody is waiting.
//!
//! Every grant and hand-off is spawned onto the runtime, never run inline.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use storelane_core::{ConsumerId, DeploymentIdentity, DispatchError};
use tokio::runtime::Handle;

use crate::observer::ResourceObserver;

// ---------------------------------------------------------------------------
// QueuedWork
// ---------------------------------------------------------------------------

/// A unit of work waiting for, or holding, an admission slot.
pub trait QueuedWork: Send + 'static {
    /// Consumer the work is bound to.
    fn consumer(&self) -> ConsumerId;

    /// Whether the bound consumer can still take the work. Checked when the
    /// work is handed a slot from the wait queue.
    fn is_live(&self) -> bool;

    /// Starts the work. The slot must be released (or dropped) once the work
    /// reaches a terminal outcome.
    fn run(self: Box<Self>, slot: AdmissionSlot) -> BoxFuture<'static, ()>;
}

/// Result of [`AdmissionQueue::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot was granted; the work is scheduled.
    Granted,
    /// The resource is saturated; the work waits at `position` (0 = next).
    Queued { position: usize },
}

// ---------------------------------------------------------------------------
// AdmissionQueue
// ---------------------------------------------------------------------------

struct AdmissionState {
    in_flight: usize,
    peak_in_flight: usize,
    waiting: VecDeque<Box<dyn QueuedWork>>,
}

/// Admission gate owned by one pooled resource.
pub struct AdmissionQueue {
    identity: DeploymentIdentity,
    /// 0 means unbounded.
    limit: usize,
    state: Mutex<AdmissionState>,
    observer: Arc<dyn ResourceObserver>,
    runtime: Handle,
    violations: AtomicU64,
}

impl AdmissionQueue {
    /// Creates a queue bound to the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn new(
        identity: DeploymentIdentity,
        limit: usize,
        observer: Arc<dyn ResourceObserver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            limit,
            state: Mutex::new(AdmissionState {
                in_flight: 0,
                peak_in_flight: 0,
                waiting: VecDeque::new(),
            }),
            observer,
            runtime: Handle::current(),
            violations: AtomicU64::new(0),
        })
    }

    /// Admits `work` now if a slot is free, otherwise appends it to the wait queue.
    pub fn submit(self: &Arc<Self>, work: Box<dyn QueuedWork>) -> Admission {
        let mut state = self.state.lock();
        if self.limit == 0 || state.in_flight < self.limit {
            state.in_flight += 1;
            state.peak_in_flight = state.peak_in_flight.max(state.in_flight);
            let in_flight = state.in_flight;
            drop(state);
            self.record_in_flight(in_flight);
            self.schedule(work);
            Admission::Granted
        } else {
            state.waiting.push_back(work);
            let position = state.waiting.len() - 1;
            tracing::debug!(
                deployment = %self.identity,
                position,
                "resource saturated, task queued"
            );
            Admission::Queued { position }
        }
    }

    /// Hands the slot to the next live waiter, or frees it.
    fn on_terminal(self: &Arc<Self>) {
        loop {
            let next = {
                let mut state = self.state.lock();
                if let Some(work) = state.waiting.pop_front() {
                    work
                } else {
                    if state.in_flight == 0 {
                        drop(state);
                        self.report_violation(DispatchError::InternalInvariant(
                            "admission slot released with no operation in flight",
                        ));
                        return;
                    }
                    state.in_flight -= 1;
                    let in_flight = state.in_flight;
                    drop(state);
                    self.record_in_flight(in_flight);
                    return;
                }
            };
            if next.is_live() {
                // Hand-off: the slot moves to `next`, in_flight is unchanged.
                self.schedule(next);
                return;
            }
            self.observer.on_dropped_task(&self.identity, next.consumer());
        }
    }

    fn schedule(self: &Arc<Self>, work: Box<dyn QueuedWork>) {
        let slot = AdmissionSlot {
            queue: Some(Arc::clone(self)),
        };
        self.runtime.spawn(work.run(slot));
    }

    /// Reports work of `consumer` that was handed a slot but never ran.
    pub fn report_dropped(&self, consumer: ConsumerId) {
        self.observer.on_dropped_task(&self.identity, consumer);
    }

    fn report_violation(&self, error: DispatchError) {
        self.violations.fetch_add(1, Ordering::Relaxed);
        self.observer.on_invariant_violation(&self.identity, &error);
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_in_flight(&self, in_flight: usize) {
        metrics::gauge!("storelane_in_flight", "deployment" => self.identity.to_string())
            .set(in_flight as f64);
    }

    #[must_use]
    pub fn identity(&self) -> &DeploymentIdentity {
        &self.identity
    }

    /// Configured bound, 0 meaning unbounded.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Operations currently holding a slot.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// Highest `in_flight` ever observed.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.state.lock().peak_in_flight
    }

    /// Tasks waiting for a slot.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.state.lock().waiting.len()
    }

    /// Bookkeeping violations reported so far. Zero under correct use.
    #[must_use]
    pub fn invariant_violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// AdmissionSlot
// ---------------------------------------------------------------------------

/// RAII permission for one running task.
///
/// Dropping the slot releases it, so a task that panics or is cancelled
/// still hands its slot on.
pub struct AdmissionSlot {
    queue: Option<Arc<AdmissionQueue>>,
}

impl AdmissionSlot {
    /// Releases the slot now.
    pub fn release(mut self) {
        if let Some(queue) = self.queue.take() {
            queue.on_terminal();
        }
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.take() {
            queue.on_terminal();
        }
    }
}

impl std::fmt::Debug for AdmissionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionSlot")
            .field("held", &self.queue.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use futures_util::FutureExt;
    use proptest::prelude::*;
    use tokio::sync::oneshot;

    use super::*;
    use crate::observer::RecordingObserver;

    /// Work item that records when it starts and finishes when its gate opens.
    struct GatedWork {
        id: usize,
        consumer: ConsumerId,
        live: Arc<AtomicBool>,
        started: Arc<Mutex<Vec<usize>>>,
        gate: oneshot::Receiver<()>,
        observed_in_flight: Arc<Mutex<Vec<usize>>>,
        queue: Arc<Mutex<Option<Arc<AdmissionQueue>>>>,
    }

    impl QueuedWork for GatedWork {
        fn consumer(&self) -> ConsumerId {
            self.consumer
        }

        fn is_live(&self) -> bool {
            self.live.load(Ordering::SeqCst)
        }

        fn run(self: Box<Self>, slot: AdmissionSlot) -> BoxFuture<'static, ()> {
            async move {
                self.started.lock().push(self.id);
                if let Some(queue) = self.queue.lock().as_ref() {
                    self.observed_in_flight.lock().push(queue.in_flight());
                }
                let _ = self.gate.await;
                slot.release();
            }
            .boxed()
        }
    }

    struct Harness {
        queue: Arc<AdmissionQueue>,
        observer: Arc<RecordingObserver>,
        started: Arc<Mutex<Vec<usize>>>,
        observed_in_flight: Arc<Mutex<Vec<usize>>>,
        queue_cell: Arc<Mutex<Option<Arc<AdmissionQueue>>>>,
    }

    impl Harness {
        fn new(limit: usize) -> Self {
            let observer = Arc::new(RecordingObserver::default());
            let queue = AdmissionQueue::new(
                DeploymentIdentity::service("test"),
                limit,
                observer.clone(),
            );
            Self {
                queue_cell: Arc::new(Mutex::new(Some(queue.clone()))),
                queue,
                observer,
                started: Arc::new(Mutex::new(Vec::new())),
                observed_in_flight: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn submit(&self, id: usize, live: Arc<AtomicBool>) -> (Admission, oneshot::Sender<()>) {
            let (tx, rx) = oneshot::channel();
            let work = GatedWork {
                id,
                consumer: ConsumerId(id as u64),
                live,
                started: self.started.clone(),
                gate: rx,
                observed_in_flight: self.observed_in_flight.clone(),
                queue: self.queue_cell.clone(),
            };
            (self.queue.submit(Box::new(work)), tx)
        }
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    fn alive() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(true))
    }

    #[tokio::test]
    async fn grants_are_deferred_to_the_runtime() {
        let harness = Harness::new(2);
        let (admission, _gate) = harness.submit(1, alive());
        assert_eq!(admission, Admission::Granted);
        assert!(harness.started.lock().is_empty(), "work must not run inline");
        settle().await;
        assert_eq!(*harness.started.lock(), vec![1]);
    }

    #[tokio::test]
    async fn saturated_queue_hands_off_without_dipping() {
        let harness = Harness::new(2);
        let (a1, g1) = harness.submit(1, alive());
        let (a2, _g2) = harness.submit(2, alive());
        let (a3, _g3) = harness.submit(3, alive());
        let (a4, _g4) = harness.submit(4, alive());
        assert_eq!(a1, Admission::Granted);
        assert_eq!(a2, Admission::Granted);
        assert_eq!(a3, Admission::Queued { position: 0 });
        assert_eq!(a4, Admission::Queued { position: 1 });

        settle().await;
        assert_eq!(*harness.started.lock(), vec![1, 2]);
        assert_eq!(harness.queue.in_flight(), 2);

        g1.send(()).unwrap();
        settle().await;
        assert_eq!(*harness.started.lock(), vec![1, 2, 3]);
        assert_eq!(harness.queue.in_flight(), 2);
        assert_eq!(harness.queue.queued(), 1);
        // Task 3 observed the handed-off slot, never a dip to 1.
        assert_eq!(*harness.observed_in_flight.lock(), vec![2, 2, 2]);
        assert_eq!(harness.queue.peak_in_flight(), 2);
    }

    #[tokio::test]
    async fn drains_to_zero_when_everything_finishes() {
        let harness = Harness::new(1);
        let gates: Vec<_> = (0..3).map(|id| harness.submit(id, alive()).1).collect();
        for gate in gates {
            settle().await;
            gate.send(()).unwrap();
        }
        settle().await;
        assert_eq!(*harness.started.lock(), vec![0, 1, 2]);
        assert_eq!(harness.queue.in_flight(), 0);
        assert_eq!(harness.queue.invariant_violations(), 0);
    }

    #[tokio::test]
    async fn dead_consumers_are_skipped_on_hand_off() {
        let harness = Harness::new(1);
        let (_, g1) = harness.submit(1, alive());
        let dead = Arc::new(AtomicBool::new(true));
        let (_, _g2) = harness.submit(2, dead.clone());
        let (_, _g3) = harness.submit(3, alive());
        settle().await;

        dead.store(false, Ordering::SeqCst);
        g1.send(()).unwrap();
        settle().await;

        assert_eq!(*harness.started.lock(), vec![1, 3]);
        assert_eq!(*harness.observer.dropped.lock(), vec![ConsumerId(2)]);
        assert_eq!(harness.queue.in_flight(), 1);
    }

    #[tokio::test]
    async fn dropping_a_slot_releases_it() {
        struct Panicky;
        impl QueuedWork for Panicky {
            fn consumer(&self) -> ConsumerId {
                ConsumerId(0)
            }
            fn is_live(&self) -> bool {
                true
            }
            fn run(self: Box<Self>, slot: AdmissionSlot) -> BoxFuture<'static, ()> {
                async move {
                    let _slot = slot;
                    panic!("driver blew up");
                }
                .boxed()
            }
        }

        let harness = Harness::new(1);
        harness.queue.submit(Box::new(Panicky));
        let (admission, _gate) = harness.submit(7, alive());
        assert_eq!(admission, Admission::Queued { position: 0 });
        settle().await;
        assert_eq!(*harness.started.lock(), vec![7]);
        assert_eq!(harness.queue.in_flight(), 1);
    }

    #[tokio::test]
    async fn unbounded_queue_never_waits() {
        let harness = Harness::new(0);
        let mut gates = Vec::new();
        for id in 0..50 {
            let (admission, gate) = harness.submit(id, alive());
            assert_eq!(admission, Admission::Granted);
            gates.push(gate);
        }
        settle().await;
        assert_eq!(harness.started.lock().len(), 50);
        assert_eq!(harness.queue.in_flight(), 50);
        drop(gates);
        settle().await;
        assert_eq!(harness.queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn spurious_release_is_reported_not_panicking() {
        let harness = Harness::new(1);
        let slot = AdmissionSlot {
            queue: Some(harness.queue.clone()),
        };
        slot.release();
        assert_eq!(harness.queue.invariant_violations(), 1);
        assert_eq!(harness.observer.violations.lock().len(), 1);
        assert_eq!(harness.queue.in_flight(), 0);
    }

    // -- Property tests: bound and FIFO for arbitrary submit/complete interleavings --

    #[derive(Debug, Clone)]
    enum Step {
        Submit,
        Complete(usize),
        Yield,
    }

    fn arb_steps() -> impl Strategy<Value = Vec<Step>> {
        proptest::collection::vec(
            prop_oneof![
                3 => Just(Step::Submit),
                2 => (0usize..64).prop_map(Step::Complete),
                1 => Just(Step::Yield),
            ],
            1..80,
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn in_flight_never_exceeds_limit_and_starts_in_fifo_order(
            limit in 1usize..5,
            steps in arb_steps(),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let (started, peak, violations, final_in_flight) = runtime.block_on(async move {
                let harness = Harness::new(limit);
                let mut gates: Vec<Option<oneshot::Sender<()>>> = Vec::new();
                for step in steps {
                    match step {
                        Step::Submit => {
                            let id = gates.len();
                            let (_, gate) = harness.submit(id, alive());
                            gates.push(Some(gate));
                        }
                        Step::Complete(i) => {
                            let started = harness.started.lock().clone();
                            if let Some(&id) = started.get(i % started.len().max(1)) {
                                if let Some(gate) = gates[id].take() {
                                    let _ = gate.send(());
                                }
                            }
                        }
                        Step::Yield => settle().await,
                    }
                    assert!(harness.queue.in_flight() <= limit);
                }
                for gate in &mut gates {
                    settle().await;
                    if let Some(gate) = gate.take() {
                        let _ = gate.send(());
                    }
                }
                // Gates of tasks still queued were sent early; let them drain.
                tokio::time::timeout(Duration::from_secs(5), async {
                    while harness.queue.in_flight() > 0 {
                        settle().await;
                    }
                })
                .await
                .unwrap();
                let started = harness.started.lock().clone();
                (
                    started,
                    harness.queue.peak_in_flight(),
                    harness.queue.invariant_violations(),
                    harness.queue.in_flight(),
                )
            });
            let expected: Vec<usize> = (0..started.len()).collect();
            prop_assert_eq!(started, expected);
            prop_assert!(peak <= limit);
            prop_assert_eq!(violations, 0);
            prop_assert_eq!(final_in_flight, 0);
        }
    }
}
