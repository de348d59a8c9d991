//! Per-consumer task counters with a debounced status report.
//!
//! The first change after a quiet period is reported immediately and arms a
//! timer. Changes while the timer is armed are folded into one trailing report
//! when it fires.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use storelane_core::ConsumerId;
use tokio::runtime::Handle;

/// Counter values at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProfilingSnapshot {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Receives status reports.
pub trait StatusSink: Send + Sync {
    fn report(&self, consumer: ConsumerId, snapshot: ProfilingSnapshot);
}

/// Reports status through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn report(&self, consumer: ConsumerId, snapshot: ProfilingSnapshot) {
        tracing::info!(
            consumer = %consumer,
            submitted = snapshot.submitted,
            succeeded = snapshot.succeeded,
            failed = snapshot.failed,
            "status"
        );
    }
}

#[derive(Debug, Default)]
struct ProfilingCounters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Task counters of one consumer plus their debounced reporting.
pub struct ProfilingReporter {
    consumer: ConsumerId,
    counters: ProfilingCounters,
    interval: Duration,
    sink: Arc<dyn StatusSink>,
    armed: AtomicBool,
    runtime: Handle,
    this: Weak<ProfilingReporter>,
}

impl ProfilingReporter {
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn new(consumer: ConsumerId, interval: Duration, sink: Arc<dyn StatusSink>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            consumer,
            counters: ProfilingCounters::default(),
            interval,
            sink,
            armed: AtomicBool::new(false),
            runtime: Handle::current(),
            this: this.clone(),
        })
    }

    pub fn record_submitted(&self) {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("storelane_tasks_total", "outcome" => "submitted").increment(1);
        self.changed();
    }

    pub fn record_succeeded(&self) {
        self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("storelane_tasks_total", "outcome" => "succeeded").increment(1);
        self.changed();
    }

    pub fn record_failed(&self) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("storelane_tasks_total", "outcome" => "failed").increment(1);
        self.changed();
    }

    #[must_use]
    pub fn snapshot(&self) -> ProfilingSnapshot {
        ProfilingSnapshot {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    fn changed(&self) {
        if self.armed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.emit();
        let this = self.this.clone();
        let interval = self.interval;
        self.runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(reporter) = this.upgrade() {
                reporter.armed.store(false, Ordering::Release);
                reporter.emit();
            }
        });
    }

    fn emit(&self) {
        self.sink.report(self.consumer, self.snapshot());
    }
}

impl std::fmt::Debug for ProfilingReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfilingReporter")
            .field("consumer", &self.consumer)
            .field("interval", &self.interval)
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}
