//! Metrics module for Prometheus-based monitoring.
//!
//! Task outcomes, retries, attempt durations, queue depth and worker
//! utilisation of every scheduler in the process.
//!
//! # Example
//!
//! ```ignore
//! use keyed_queue::metrics::{init_metrics, export_metrics};
//!
//! // Initialize metrics on startup
//! init_metrics().expect("Failed to initialize metrics");
//!
//! // ... run schedulers ...
//!
//! // Export metrics for Prometheus scraping
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, ATTEMPT_DURATION, LANES, PENDING_TASKS, REGISTRY, RETRIES_TOTAL, TASKS_TOTAL,
};
