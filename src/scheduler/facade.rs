//! Public entry point of the scheduler.
//!
//! [`Scheduler`] owns the key router, the worker pool and the governing
//! cancellation token. Callers push work through it directly, through a
//! [`QueueHandle`] bound to one key, or through a [`ResourceScope`] that
//! derives keys and task names from a resource name.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::metrics::MetricsCollector;

use super::retry::RetryPolicy;
use super::router::KeyRouter;
use super::task::{RetryMode, Task, TaskContext, TaskResult};
use super::worker_pool::{PoolShared, PoolStats, SharedPoolStats, WorkerPool};

/// What `shutdown` does with work that has not finished yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPolicy {
    /// Let every pending and parked task reach a terminal state first.
    #[default]
    Drain,
    /// Stop workers after their current task and discard the rest.
    Discard,
}

/// Summary returned by [`Scheduler::shutdown`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub policy: ShutdownPolicy,
    /// Tasks removed from their lanes without running to completion.
    pub discarded: u64,
    pub elapsed_ms: u64,
    pub stats: PoolStats,
}

struct Inner {
    config: SchedulerConfig,
    shared: Arc<PoolShared>,
    num_workers: usize,
    pool: Mutex<Option<WorkerPool>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    scopes: Mutex<HashMap<String, ResourceScope>>,
    shut_down: AtomicBool,
}

/// Keyed, ordered, retrying task scheduler.
///
/// Cloning is cheap; clones share the same lanes and workers.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.inner.num_workers)
            .field("lanes", &self.lane_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a scheduler governed by `token` and spawns its workers.
    ///
    /// Cancelling `token` stops the workers between tasks, rejects further
    /// pushes and discards whatever is still pending.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Config` for an invalid configuration and
    /// `SchedulerError::NoRuntime` when called outside a tokio runtime.
    pub fn new(config: SchedulerConfig, token: CancellationToken) -> Result<Self, SchedulerError> {
        config.validate()?;
        tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;

        // Dropping the last handle cancels this token, never the caller's.
        let token = token.child_token();
        let num_workers = config.effective_workers();
        let shared = Arc::new(PoolShared {
            router: Arc::new(KeyRouter::new()),
            policy: RetryPolicy::from_config(&config),
            token,
            task_timeout: config.task_timeout,
            lane_batch: config.lane_batch,
            stats: Arc::new(SharedPoolStats::new()),
            metrics: MetricsCollector::new(),
        });

        let pool = WorkerPool::start(Arc::clone(&shared), num_workers);

        let watcher = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                shared.token.cancelled().await;
                shared.router.close();
                let discarded = shared.discard_pending();
                if discarded > 0 {
                    warn!(discarded = discarded, "Scheduler cancelled with pending tasks");
                }
            })
        };

        info!(
            workers = num_workers,
            retries = config.retries,
            default_queue = %config.default_queue,
            "Scheduler started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                shared,
                num_workers,
                pool: Mutex::new(Some(pool)),
                watcher: Mutex::new(Some(watcher)),
                scopes: Mutex::new(HashMap::new()),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Creates a scheduler with a fresh cancellation token.
    pub fn start(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        Self::new(config, CancellationToken::new())
    }

    /// Enqueues `body` on the lane for `queue_key`.
    ///
    /// An empty key routes to the default queue. An empty name becomes
    /// `"{default_queue}_task"`. The outcome of the task is never reported
    /// back to the caller.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Closed` after shutdown or cancellation.
    pub fn push_task<F, Fut>(&self, queue_key: &str, task_name: &str, body: F) -> Result<(), SchedulerError>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let default_queue = &self.inner.config.default_queue;
        let key = if queue_key.is_empty() {
            default_queue.as_str()
        } else {
            queue_key
        };
        let name = if task_name.is_empty() {
            format!("{}_task", default_queue)
        } else {
            task_name.to_string()
        };

        self.submit(Task::new(key, name, body))
    }

    /// Enqueues an already built task as is.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Closed` after shutdown or cancellation.
    pub fn submit(&self, task: Task) -> Result<(), SchedulerError> {
        let shared = &self.inner.shared;
        let key = task.queue_key.clone();
        let name = task.name.clone();

        let result = if shared.token.is_cancelled() {
            Err(SchedulerError::Closed)
        } else {
            shared.router.push(task)
        };

        match &result {
            Ok(()) => {
                debug!(queue_key = %key, task = %name, "Task pushed");
                shared
                    .metrics
                    .update_queue_depth(shared.router.total_pending(), shared.router.lane_count());
            }
            Err(e) => warn!(queue_key = %key, task = %name, error = %e, "Rejected task push"),
        }
        result
    }

    /// Returns a handle that pushes every task onto `key`.
    pub fn queue(&self, key: &str) -> QueueHandle {
        let key = if key.is_empty() {
            self.inner.config.default_queue.clone()
        } else {
            key.to_string()
        };
        QueueHandle {
            scheduler: self.clone(),
            key,
            resource: None,
        }
    }

    /// Returns the submission scope for `resource`, creating it on first use.
    pub fn scope(&self, resource: &str) -> ResourceScope {
        self.inner
            .scopes
            .lock()
            .entry(resource.to_string())
            .or_insert_with(|| ResourceScope {
                scheduler: Arc::downgrade(&self.inner),
                resource: resource.to_string(),
            })
            .clone()
    }

    /// Stops accepting tasks and winds the scheduler down.
    ///
    /// With [`ShutdownPolicy::Drain`] this waits up to the configured
    /// shutdown timeout for outstanding work; whatever is left after that is
    /// discarded. With [`ShutdownPolicy::Discard`] workers stop after their
    /// current task and pending tasks are discarded immediately.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::AlreadyShutDown` on a second call and
    /// `SchedulerError::ShutdownTimeout` when draining did not finish in time.
    pub async fn shutdown(&self, policy: ShutdownPolicy) -> Result<ShutdownReport, SchedulerError> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyShutDown);
        }

        let started = Instant::now();
        let shared = &self.inner.shared;
        shared.router.close();

        info!(
            policy = ?policy,
            pending = shared.router.total_pending(),
            "Scheduler shutting down"
        );

        let mut timed_out = false;
        if policy == ShutdownPolicy::Drain && !shared.token.is_cancelled() {
            let limit = self.inner.config.shutdown_timeout;
            if tokio::time::timeout(limit, shared.router.wait_idle())
                .await
                .is_err()
            {
                warn!(
                    timeout_ms = limit.as_millis() as u64,
                    outstanding = shared.router.outstanding(),
                    "Drain timed out, discarding remaining tasks"
                );
                timed_out = true;
            }
        }

        shared.token.cancel();

        let watcher = self.inner.watcher.lock().take();
        if let Some(watcher) = watcher {
            let _ = watcher.await;
        }

        let pool = self.inner.pool.lock().take();
        if let Some(mut pool) = pool {
            pool.join().await;
        }

        // A retry parked just before the token fired may outlive the watcher's drain.
        shared.discard_pending();

        let stats = self.stats();
        let report = ShutdownReport {
            policy,
            discarded: stats.discarded,
            elapsed_ms: started.elapsed().as_millis() as u64,
            stats,
        };

        info!(
            succeeded = report.stats.succeeded,
            dropped = report.stats.dropped(),
            discarded = report.discarded,
            elapsed_ms = report.elapsed_ms,
            "Scheduler stopped"
        );

        if timed_out {
            return Err(SchedulerError::ShutdownTimeout(
                self.inner.config.shutdown_timeout,
            ));
        }
        Ok(report)
    }

    /// Returns whether new pushes are rejected.
    pub fn is_closed(&self) -> bool {
        self.inner.shared.token.is_cancelled() || self.inner.shared.router.is_closed()
    }

    /// Returns current worker pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.inner.shared.stats.to_pool_stats(self.inner.num_workers)
    }

    /// Number of lanes created so far.
    pub fn lane_count(&self) -> usize {
        self.inner.shared.router.lane_count()
    }

    /// Pending tasks on `key`, including one parked for a retry.
    pub fn pending(&self, key: &str) -> usize {
        self.inner.shared.router.pending(key)
    }

    /// Waits until no task is pending or running.
    pub async fn wait_idle(&self) {
        self.inner.shared.router.wait_idle().await;
    }

    /// The token governing this scheduler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.shared.token.clone()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }
}

/// Pushes tasks onto one fixed queue key.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    scheduler: Scheduler,
    key: String,
    resource: Option<String>,
}

impl QueueHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Enqueues `operation` on this handle's key.
    ///
    /// An empty `task_name` becomes `"{resource}_{operation}"`, or
    /// `"{default_queue}_{operation}"` for a handle without a resource.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Closed` after shutdown or cancellation.
    pub fn push<F, Fut>(
        &self,
        operation: &str,
        task_name: &str,
        body: F,
    ) -> Result<(), SchedulerError>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let prefix = self
            .resource
            .as_deref()
            .unwrap_or(&self.scheduler.inner.config.default_queue);
        let name = if task_name.is_empty() {
            format!("{}_{}", prefix, operation)
        } else {
            task_name.to_string()
        };

        let mut task = Task::new(self.key.clone(), name, body);
        if let Some(resource) = &self.resource {
            task = task.with_resource(resource.clone());
        }
        self.scheduler.submit(task)
    }
}

/// Submission scope for one resource, such as a collection.
///
/// Keys default to the resource name and task names to
/// `"{resource}_{operation}"`. The scope does not keep its scheduler alive.
#[derive(Debug, Clone)]
pub struct ResourceScope {
    scheduler: Weak<Inner>,
    resource: String,
}

impl ResourceScope {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    fn scheduler(&self) -> Result<Scheduler, SchedulerError> {
        self.scheduler
            .upgrade()
            .map(|inner| Scheduler { inner })
            .ok_or(SchedulerError::Closed)
    }

    fn submit<F, Fut>(
        &self,
        operation: &str,
        queue_key: &str,
        task_name: &str,
        mode: RetryMode,
        body: F,
    ) -> Result<(), SchedulerError>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let key = if queue_key.is_empty() {
            self.resource.as_str()
        } else {
            queue_key
        };
        let name = if task_name.is_empty() {
            format!("{}_{}", self.resource, operation)
        } else {
            task_name.to_string()
        };

        let task = Task::new(key, name, body)
            .with_resource(self.resource.clone())
            .with_retry_mode(mode);
        self.scheduler()?.submit(task)
    }

    /// Enqueues a single `operation` with classified retries.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Closed` after shutdown or cancellation.
    pub fn push<F, Fut>(
        &self,
        operation: &str,
        queue_key: &str,
        task_name: &str,
        body: F,
    ) -> Result<(), SchedulerError>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.submit(operation, queue_key, task_name, RetryMode::Classified, body)
    }

    /// Enqueues a multi-step body on the resource's own lane.
    ///
    /// Every error except a panic is retried until the budget runs out.
    pub fn with_task<F, Fut>(&self, task_name: &str, body: F) -> Result<(), SchedulerError>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.submit("task", "", task_name, RetryMode::AnyError, body)
    }

    /// Like [`with_task`](Self::with_task), for a body that runs a transaction.
    pub fn with_transaction<F, Fut>(&self, task_name: &str, body: F) -> Result<(), SchedulerError>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.submit("transaction", "", task_name, RetryMode::AnyError, body)
    }

    /// Returns a handle bound to `key` whose tasks carry this resource.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Closed` once the scheduler is gone.
    pub fn queue(&self, key: &str) -> Result<QueueHandle, SchedulerError> {
        let key = if key.is_empty() { &self.resource } else { key };
        Ok(QueueHandle {
            scheduler: self.scheduler()?,
            key: key.to_string(),
            resource: Some(self.resource.clone()),
        })
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::SeqCst) {
            self.shared.token.cancel();
        }
    }
}
