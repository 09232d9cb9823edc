//! Metric collector for scheduler operations.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics with methods named
//! after scheduler events. Every method is a no-op until `init_metrics()` ran.

use super::prometheus::{
    ACTIVE_WORKERS, ATTEMPT_DURATION, LANES, PENDING_TASKS, RETRIES_TOTAL, TASKS_TOTAL,
};

/// Records keyed-queue operational metrics.
///
/// # Example
///
/// ```ignore
/// use keyed_queue::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_outcome("succeeded", "none");
/// collector.record_attempt("succeeded", 0.012);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a task reaching a terminal state.
    ///
    /// # Arguments
    ///
    /// * `outcome` - "succeeded", "terminal", "panicked", "exhausted" or "discarded"
    /// * `category` - Error category of the final error, "none" on success
    pub fn record_outcome(&self, outcome: &str, category: &str) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&[outcome, category]).inc();
        }

        tracing::trace!(outcome = outcome, category = category, "Recorded task outcome");
    }

    /// Record the duration of one attempt.
    pub fn record_attempt(&self, outcome: &str, duration_secs: f64) {
        if let Some(attempt_duration) = ATTEMPT_DURATION.get() {
            attempt_duration
                .with_label_values(&[outcome])
                .observe(duration_secs);
        }
    }

    /// Record a scheduled retry.
    pub fn record_retry(&self) {
        if let Some(retries) = RETRIES_TOTAL.get() {
            retries.inc();
        }
    }

    /// Update the pending task and lane gauges.
    pub fn update_queue_depth(&self, pending: usize, lanes: usize) {
        if let Some(pending_tasks) = PENDING_TASKS.get() {
            pending_tasks.set(pending as i64);
        }

        if let Some(lane_gauge) = LANES.get() {
            lane_gauge.set(lanes as i64);
        }

        tracing::trace!(pending = pending, lanes = lanes, "Updated queue depth metric");
    }

    /// Increment the count of busy workers by 1.
    pub fn inc_active_workers(&self) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.inc();
        }
    }

    /// Decrement the count of busy workers by 1.
    pub fn dec_active_workers(&self) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.dec();
        }
    }
}
