//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by keyed-queue and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all keyed-queue metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Tasks that reached a terminal state, labeled by outcome and error category.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Duration of single task attempts in seconds, labeled by outcome.
pub static ATTEMPT_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Total retries scheduled.
pub static RETRIES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Tasks waiting in lanes across all keys.
pub static PENDING_TASKS: OnceLock<IntGauge> = OnceLock::new();

/// Number of lanes (distinct queue keys) created.
pub static LANES: OnceLock<IntGauge> = OnceLock::new();

/// Number of workers currently executing a task.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Schedulers
/// record nothing until it has run.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let tasks_total = CounterVec::new(
        Opts::new(
            "keyed_queue_tasks_total",
            "Tasks that reached a terminal state",
        ),
        &["outcome", "category"],
    )?;

    let attempt_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "keyed_queue_attempt_duration_seconds",
            "Duration of single task attempts in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.025, 0.1, 0.5, 1.0, 5.0, 30.0]),
        &["outcome"],
    )?;

    let retries_total = Counter::new("keyed_queue_retries_total", "Total retries scheduled")?;

    let pending_tasks = IntGauge::new(
        "keyed_queue_pending_tasks",
        "Tasks waiting in lanes across all keys",
    )?;

    let lanes = IntGauge::new("keyed_queue_lanes", "Number of lanes created")?;

    let active_workers = Gauge::new(
        "keyed_queue_active_workers",
        "Number of workers currently executing a task",
    )?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(attempt_duration.clone()))?;
    registry.register(Box::new(retries_total.clone()))?;
    registry.register(Box::new(pending_tasks.clone()))?;
    registry.register(Box::new(lanes.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = ATTEMPT_DURATION.set(attempt_duration);
    let _ = RETRIES_TOTAL.set(retries_total);
    let _ = PENDING_TASKS.set(pending_tasks);
    let _ = LANES.set(lanes);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
