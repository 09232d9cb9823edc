//! Keyed, ordered, retrying task execution.
//!
//! Tasks pushed under the same queue key run one after another in push order;
//! tasks under different keys run concurrently on a fixed pool of workers.
//!
//! - **KeyRouter**: one FIFO lane per key plus the list of lanes ready to run
//! - **WorkerPool**: workers that claim a lane and drain it in order
//! - **RetryPolicy**: capped exponential backoff, terminal errors dropped
//! - **Scheduler**: push API, queue and resource handles, shutdown
//!
//! # Architecture
//!
//! ```text
//!    push_task("users", ..)     push_task("orders", ..)
//!              │                          │
//!       ┌──────▼──────────────────────────▼──────┐
//!       │               KeyRouter                │
//!       │  users: [t1, t2, t3]   orders: [t4]    │
//!       │  ready: users → orders                 │
//!       └──────┬──────────────────────────┬──────┘
//!              │ claim                    │ claim
//!         ┌────▼────┐                ┌────▼────┐
//!         │ Worker 1│                │ Worker 2│
//!         └────┬────┘                └─────────┘
//!              │ transient error
//!              ▼
//!       park lane ── backoff timer ──▶ unpark
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use keyed_queue::config::SchedulerConfig;
//! use keyed_queue::error::TaskError;
//! use keyed_queue::scheduler::{Scheduler, ShutdownPolicy};
//!
//! let scheduler = Scheduler::start(SchedulerConfig::new(4))?;
//!
//! scheduler.push_task("users", "users_insert", |_ctx| async {
//!     insert_user().await.map_err(|e| TaskError::Network(e.to_string()))
//! })?;
//!
//! let users = scheduler.scope("users");
//! users.push("update", "", "", |_ctx| async { Ok(()) })?;
//!
//! let report = scheduler.shutdown(ShutdownPolicy::Drain).await?;
//! println!("succeeded: {}", report.stats.succeeded);
//! ```
//!
//! # Guarantees
//!
//! - **Per-key order**: a task starts only after the previous task on its key
//!   succeeded or was dropped, retries included
//! - **No blocked workers**: backoff parks the lane, not the worker
//! - **Panic containment**: a panicking body drops only its own task
//! - **Graceful shutdown**: workers finish the current task before stopping

pub mod facade;
pub mod retry;
pub mod router;
pub mod task;
pub mod worker_pool;

// Re-export main types for convenience
pub use facade::{QueueHandle, ResourceScope, Scheduler, ShutdownPolicy, ShutdownReport};
pub use retry::{Decision, DropReason, RetryPolicy};
pub use router::KeyRouter;
pub use task::{RetryMode, Task, TaskContext, TaskFn, TaskFuture, TaskResult, TaskState};
pub use worker_pool::PoolStats;
