//! keyed-queue: an embedded asynchronous keyed task queue.
//!
//! Tasks pushed under the same queue key run strictly one after another in
//! push order, tasks under different keys run concurrently. Failed tasks are
//! retried with capped exponential backoff unless their error is terminal.

pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod scheduler;

pub use config::{SchedulerConfig, DEFAULT_ASYNC_RETRIES, DEFAULT_QUEUE};
pub use error::{ConfigError, ErrorClass, SchedulerError, TaskError};
pub use scheduler::{
    QueueHandle, ResourceScope, RetryMode, Scheduler, ShutdownPolicy, ShutdownReport, Task,
    TaskContext, TaskResult,
};
