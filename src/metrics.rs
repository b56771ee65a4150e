//! Host loop metrics (§4.7, §4.5 step 5, §5 "Backpressure").
//!
//! Per-node execution counters live on [`crate::executor::Executor`] itself
//! (it owns them exclusively, §3). This module is the *host*-level
//! complement: the router's in-flight gauge and backpressure-wait
//! histogram, aggregated process-wide rather than per node.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide host loop counters (§4.7's metrics list). Cheap to update
/// from any dispatch task: every field is a single atomic, no locks.
#[derive(Default)]
pub struct HostMetrics {
    current_in_flight: AtomicU64,
    max_concurrent_observed: AtomicU64,
    max_in_flight_reached_count: AtomicU64,
    events_total: AtomicU64,
    events_waited: AtomicU64,
    total_backpressure_wait_ms: AtomicU64,
}

/// Point-in-time read of [`HostMetrics`], safe to log or expose on a
/// readiness/diagnostics surface.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostMetricsSnapshot {
    pub current_in_flight: u64,
    pub max_concurrent_observed: u64,
    pub max_in_flight_reached_count: u64,
    pub events_total: u64,
    pub total_backpressure_wait_ms: u64,
    pub avg_backpressure_wait_ms: f64,
    pub backpressure_percentage: f64,
}

impl HostMetrics {
    /// Records a slot acquisition: `waited` is how long the caller blocked
    /// on the router semaphore before getting one (§4.7 step 4).
    pub fn record_acquired(&self, max_in_flight: usize, waited_ms: u64) {
        let current = self.current_in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_concurrent_observed.fetch_max(current, Ordering::AcqRel);
        if current as usize >= max_in_flight {
            self.max_in_flight_reached_count.fetch_add(1, Ordering::AcqRel);
        }
        self.events_total.fetch_add(1, Ordering::AcqRel);
        if waited_ms > 0 {
            self.events_waited.fetch_add(1, Ordering::AcqRel);
            self.total_backpressure_wait_ms.fetch_add(waited_ms, Ordering::AcqRel);
        }
    }

    /// Releases one in-flight slot (dispatch completed).
    pub fn record_released(&self) {
        self.current_in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> HostMetricsSnapshot {
        let events_total = self.events_total.load(Ordering::Acquire);
        let events_waited = self.events_waited.load(Ordering::Acquire);
        let total_wait = self.total_backpressure_wait_ms.load(Ordering::Acquire);
        HostMetricsSnapshot {
            current_in_flight: self.current_in_flight.load(Ordering::Acquire),
            max_concurrent_observed: self.max_concurrent_observed.load(Ordering::Acquire),
            max_in_flight_reached_count: self.max_in_flight_reached_count.load(Ordering::Acquire),
            events_total,
            total_backpressure_wait_ms: total_wait,
            avg_backpressure_wait_ms: if events_waited == 0 { 0.0 } else { total_wait as f64 / events_waited as f64 },
            backpressure_percentage: if events_total == 0 {
                0.0
            } else {
                events_waited as f64 / events_total as f64 * 100.0
            },
        }
    }
}
