//! Worker pool that drains lanes from the key router.
//!
//! Each worker is an independent tokio task. It claims one ready lane at a
//! time and runs that lane's tasks in order until the lane is empty, a task is
//! parked for a retry, or the per-claim batch budget is spent.
//!
//! # Features
//!
//! - Per-key exclusivity through the router's claim
//! - Retry backoff without holding a worker (the lane is parked and a timer
//!   un-parks it)
//! - Panics caught at the invocation boundary and turned into terminal drops
//! - Optional per-attempt timeout
//! - Graceful stop through the scheduler's cancellation token
//! - Pool statistics tracking

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::TaskError;
use crate::metrics::MetricsCollector;

use super::router::KeyRouter;
use super::retry::{Decision, DropReason, RetryPolicy};
use super::task::{Task, TaskResult, TaskState};

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently executing a task.
    pub active_workers: usize,
    /// Tasks that completed successfully.
    pub succeeded: u64,
    /// Tasks dropped because of a terminal error.
    pub dropped_terminal: u64,
    /// Tasks dropped because their body panicked.
    pub dropped_panicked: u64,
    /// Tasks dropped after the retry budget ran out.
    pub dropped_exhausted: u64,
    /// Tasks discarded by shutdown before they could finish.
    pub discarded: u64,
    /// Retries scheduled.
    pub retries: u64,
    /// Body invocations, first runs and retries together.
    pub attempts: u64,
    /// Average duration of one attempt.
    pub average_attempt_duration: Duration,
}

impl PoolStats {
    /// Tasks that left their lane without succeeding.
    pub fn dropped(&self) -> u64 {
        self.dropped_terminal + self.dropped_panicked + self.dropped_exhausted + self.discarded
    }

    /// Tasks that reached a terminal state.
    pub fn total_finished(&self) -> u64 {
        self.succeeded + self.dropped()
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_finished();
        if total == 0 {
            return 0.0;
        }
        (self.succeeded as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
#[derive(Debug, Default)]
pub(crate) struct SharedPoolStats {
    succeeded: AtomicU64,
    dropped_terminal: AtomicU64,
    dropped_panicked: AtomicU64,
    dropped_exhausted: AtomicU64,
    discarded: AtomicU64,
    retries: AtomicU64,
    attempts: AtomicU64,
    total_duration_us: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn record_attempt(&self, duration: Duration) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.total_duration_us
            .fetch_add(duration.as_micros() as u64, Ordering::SeqCst);
    }

    fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::SeqCst);
    }

    fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_drop(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::Terminal => &self.dropped_terminal,
            DropReason::Panicked => &self.dropped_panicked,
            DropReason::Exhausted => &self.dropped_exhausted,
            DropReason::Discarded => &self.discarded,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let attempts = self.attempts.load(Ordering::SeqCst);
        let total_duration_us = self.total_duration_us.load(Ordering::SeqCst);

        let average_attempt_duration = if attempts > 0 {
            Duration::from_micros(total_duration_us / attempts)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            succeeded: self.succeeded.load(Ordering::SeqCst),
            dropped_terminal: self.dropped_terminal.load(Ordering::SeqCst),
            dropped_panicked: self.dropped_panicked.load(Ordering::SeqCst),
            dropped_exhausted: self.dropped_exhausted.load(Ordering::SeqCst),
            discarded: self.discarded.load(Ordering::SeqCst),
            retries: self.retries.load(Ordering::SeqCst),
            attempts,
            average_attempt_duration,
        }
    }
}

/// Everything a worker needs, shared by the whole pool.
pub(crate) struct PoolShared {
    pub(crate) router: Arc<KeyRouter>,
    pub(crate) policy: RetryPolicy,
    pub(crate) token: CancellationToken,
    pub(crate) task_timeout: Option<Duration>,
    pub(crate) lane_batch: usize,
    pub(crate) stats: Arc<SharedPoolStats>,
    pub(crate) metrics: MetricsCollector,
}

impl PoolShared {
    /// Removes every pending task from the router and records it as discarded.
    ///
    /// Tasks held by workers are not touched. Returns how many were removed.
    pub(crate) fn discard_pending(&self) -> usize {
        let drained = self.router.drain_all();
        for task in &drained {
            self.record_discard(task);
        }

        self.metrics
            .update_queue_depth(self.router.total_pending(), self.router.lane_count());
        drained.len()
    }

    fn record_discard(&self, task: &Task) {
        warn!(
            queue_key = %task.queue_key,
            task = %task.name,
            task_id = %task.id,
            resource = task.resource.as_deref().unwrap_or("-"),
            attempt = task.attempt,
            age_ms = task.age().num_milliseconds(),
            "Task discarded, scheduler stopping"
        );
        self.stats.record_drop(DropReason::Discarded);
        self.metrics.record_outcome("discarded", "none");
    }
}

/// Fixed set of workers draining the router.
pub(crate) struct WorkerPool {
    worker_handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `num_workers` workers on the current tokio runtime.
    pub(crate) fn start(shared: Arc<PoolShared>, num_workers: usize) -> Self {
        let worker_handles = (0..num_workers)
            .map(|i| {
                let worker = Worker::new(format!("worker-{}", i), Arc::clone(&shared));
                tokio::spawn(worker.run())
            })
            .collect();

        info!(num_workers = num_workers, "Worker pool started");

        Self { worker_handles }
    }

    /// Waits for every worker to exit.
    ///
    /// Workers exit once the cancellation token fires and their current task
    /// has finished.
    pub(crate) async fn join(&mut self) {
        for handle in self.worker_handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked during shutdown");
            }
        }
    }
}

/// What the lane loop does after a task attempt.
enum LaneStep {
    /// The task finished; keep draining the lane.
    Continue,
    /// The task was parked for a retry; the claim is already released.
    Parked,
}

/// A single worker that drains lanes one at a time.
struct Worker {
    id: String,
    shared: Arc<PoolShared>,
}

impl Worker {
    fn new(id: String, shared: Arc<PoolShared>) -> Self {
        Self { id, shared }
    }

    /// Main worker loop.
    ///
    /// Claims ready lanes until the cancellation token fires. Cancellation is
    /// only observed between tasks.
    async fn run(self) {
        debug!(worker_id = %self.id, "Worker started");
        let router = &self.shared.router;
        let token = &self.shared.token;

        loop {
            if token.is_cancelled() {
                break;
            }

            let key = {
                let notified = router.work_available();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match router.claim() {
                    Some(key) => key,
                    None => {
                        tokio::select! {
                            _ = &mut notified => continue,
                            _ = token.cancelled() => break,
                        }
                    }
                }
            };

            self.run_lane(&key).await;
        }

        debug!(worker_id = %self.id, "Worker stopped");
    }

    /// Runs tasks from a claimed lane and releases the claim on return.
    async fn run_lane(&self, key: &str) {
        let router = &self.shared.router;
        let mut ran = 0usize;

        loop {
            if self.shared.token.is_cancelled() || ran >= self.shared.lane_batch {
                router.yield_lane(key);
                return;
            }

            let Some(task) = router.next_task(key) else {
                return;
            };
            ran += 1;

            match self.process_task(task).await {
                LaneStep::Continue => {}
                LaneStep::Parked => return,
            }
        }
    }

    /// Runs one attempt of a task and applies the retry policy to the result.
    async fn process_task(&self, mut task: Task) -> LaneStep {
        let shared = &self.shared;
        task.state = TaskState::Running;

        debug!(
            worker_id = %self.id,
            queue_key = %task.queue_key,
            task = %task.name,
            task_id = %task.id,
            attempt = task.attempt,
            "Running task"
        );

        shared.stats.increment_active();
        shared.metrics.inc_active_workers();
        let start_time = Instant::now();

        let result = self.execute(&task).await;
        let duration = start_time.elapsed();

        shared.stats.decrement_active();
        shared.metrics.dec_active_workers();
        shared.stats.record_attempt(duration);

        let step = match result {
            Ok(()) => {
                task.state = TaskState::Succeeded;
                shared.stats.record_success();
                shared.metrics.record_attempt("succeeded", duration.as_secs_f64());
                shared.metrics.record_outcome("succeeded", "none");
                debug!(
                    worker_id = %self.id,
                    queue_key = %task.queue_key,
                    task = %task.name,
                    attempt = task.attempt,
                    duration_ms = duration.as_millis() as u64,
                    "Task succeeded"
                );
                shared.router.finish();
                LaneStep::Continue
            }
            Err(error) => {
                shared.metrics.record_attempt("failed", duration.as_secs_f64());
                match shared.policy.decide(&task, &error) {
                    Decision::Retry { .. } if shared.token.is_cancelled() => {
                        // The router was already drained; parking would strand the task.
                        task.state = TaskState::Dropped;
                        shared.record_discard(&task);
                        shared.router.finish();
                        LaneStep::Continue
                    }
                    Decision::Retry { attempt, delay } => {
                        warn!(
                            worker_id = %self.id,
                            queue_key = %task.queue_key,
                            task = %task.name,
                            task_id = %task.id,
                            attempt = attempt,
                            max_retries = shared.policy.max_retries(),
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Task failed, retrying"
                        );
                        task.increment_attempt();
                        shared.stats.record_retry();
                        shared.metrics.record_retry();
                        let key = task.queue_key.clone();
                        shared.router.park(task);
                        self.schedule_unpark(key, delay);
                        LaneStep::Parked
                    }
                    Decision::Drop(reason) => {
                        task.state = TaskState::Dropped;
                        log_drop(&task, reason, &error);
                        shared.stats.record_drop(reason);
                        shared
                            .metrics
                            .record_outcome(&reason.to_string(), error.category());
                        shared.router.finish();
                        LaneStep::Continue
                    }
                }
            }
        };

        shared
            .metrics
            .update_queue_depth(shared.router.total_pending(), shared.router.lane_count());
        step
    }

    /// Invokes the body, converting panics and timeouts into task errors.
    async fn execute(&self, task: &Task) -> TaskResult {
        let cancel = self.shared.token.child_token();

        let future = match std::panic::catch_unwind(AssertUnwindSafe(|| task.invoke(cancel))) {
            Ok(future) => future,
            Err(payload) => return Err(TaskError::Panicked(panic_message(payload))),
        };
        let guarded = AssertUnwindSafe(future).catch_unwind();

        let outcome = match self.shared.task_timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(TaskError::Timeout(format!(
                        "attempt exceeded {:?}",
                        limit
                    )))
                }
            },
            None => guarded.await,
        };

        outcome.unwrap_or_else(|payload| Err(TaskError::Panicked(panic_message(payload))))
    }

    /// Makes a parked lane ready again after `delay`.
    fn schedule_unpark(&self, key: String, delay: Duration) {
        if delay.is_zero() {
            unpark_or_discard(&self.shared, &key);
            return;
        }

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                // Covers a retry parked after the cancellation watcher ran.
                _ = shared.token.cancelled() => {
                    shared.discard_pending();
                }
                _ = tokio::time::sleep(delay) => unpark_or_discard(&shared, &key),
            }
        });
    }
}

fn unpark_or_discard(shared: &PoolShared, key: &str) {
    shared.router.unpark(key);
    if shared.token.is_cancelled() {
        shared.discard_pending();
    }
}

/// Logs a dropped task with enough context to diagnose it later.
fn log_drop(task: &Task, reason: DropReason, error: &TaskError) {
    let resource = task.resource.as_deref().unwrap_or("-");
    match reason {
        DropReason::Panicked => error!(
            queue_key = %task.queue_key,
            task = %task.name,
            task_id = %task.id,
            resource = resource,
            attempt = task.attempt,
            age_ms = task.age().num_milliseconds(),
            panic = true,
            error = %error,
            "Task panicked, dropping"
        ),
        DropReason::Exhausted => error!(
            queue_key = %task.queue_key,
            task = %task.name,
            task_id = %task.id,
            resource = resource,
            attempts = task.attempt + 1,
            age_ms = task.age().num_milliseconds(),
            category = error.category(),
            error = %error,
            "Task failed after exhausting retries, dropping"
        ),
        _ => error!(
            queue_key = %task.queue_key,
            task = %task.name,
            task_id = %task.id,
            resource = resource,
            attempt = task.attempt,
            reason = %reason,
            age_ms = task.age().num_milliseconds(),
            category = error.category(),
            error = %error,
            "Task failed with terminal error, dropping"
        ),
    }
}

/// Extracts a readable message from a panic payload.
fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn shared(router: Arc<KeyRouter>, retries: u32, token: CancellationToken) -> Arc<PoolShared> {
        Arc::new(PoolShared {
            router,
            policy: RetryPolicy::new(retries, Duration::from_millis(1), Duration::from_millis(5), 2.0),
            token,
            task_timeout: Some(Duration::from_millis(200)),
            lane_batch: 8,
            stats: Arc::new(SharedPoolStats::new()),
            metrics: MetricsCollector::new(),
        })
    }

    fn explode(message: &str) -> TaskResult {
        panic!("{}", message)
    }

    #[test]
    fn test_pool_stats_default() {
        let stats = PoolStats::default();

        assert_eq!(stats.num_workers, 0);
        assert_eq!(stats.succeeded, 0);
        assert_eq!(stats.dropped(), 0);
        assert_eq!(stats.total_finished(), 0);
        assert_eq!(stats.average_attempt_duration, Duration::ZERO);
        assert!((stats.success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 4,
            succeeded: 80,
            dropped_terminal: 10,
            dropped_exhausted: 5,
            dropped_panicked: 3,
            discarded: 2,
            ..Default::default()
        };

        assert_eq!(stats.dropped(), 20);
        assert_eq!(stats.total_finished(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record_attempt(Duration::from_millis(10));
        stats.record_attempt(Duration::from_millis(20));
        stats.record_success();
        stats.record_retry();
        stats.record_drop(DropReason::Terminal);
        stats.record_drop(DropReason::Discarded);

        let pool_stats = stats.to_pool_stats(2);
        assert_eq!(pool_stats.num_workers, 2);
        assert_eq!(pool_stats.attempts, 2);
        assert_eq!(pool_stats.succeeded, 1);
        assert_eq!(pool_stats.retries, 1);
        assert_eq!(pool_stats.dropped_terminal, 1);
        assert_eq!(pool_stats.discarded, 1);
        assert_eq!(pool_stats.average_attempt_duration, Duration::from_millis(15));
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(42u8)), "non-string panic payload");
    }

    #[tokio::test]
    async fn test_execute_catches_panics_and_timeouts() {
        let router = Arc::new(KeyRouter::new());
        let worker = Worker::new(
            "worker-test".into(),
            shared(router, 0, CancellationToken::new()),
        );

        let panicking = Task::new("k", "panics", |_ctx| async { explode("kaboom") });
        let err = worker.execute(&panicking).await.unwrap_err();
        assert!(matches!(err, TaskError::Panicked(ref msg) if msg.contains("kaboom")));

        let eager = Task::new("k", "eager", |_ctx| -> futures::future::Ready<TaskResult> {
            panic!("before the future")
        });
        let err = worker.execute(&eager).await.unwrap_err();
        assert!(matches!(err, TaskError::Panicked(_)));

        let slow = Task::new("k", "slow", |_ctx| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        let err = worker.execute(&slow).await.unwrap_err();
        assert!(matches!(err, TaskError::Timeout(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_runs_and_stops() {
        let router = Arc::new(KeyRouter::new());
        let token = CancellationToken::new();
        let shared = shared(Arc::clone(&router), 2, token.clone());
        let mut pool = WorkerPool::start(Arc::clone(&shared), 2);

        let calls = Arc::new(AtomicU32::new(0));
        for i in 0..5 {
            let calls = Arc::clone(&calls);
            router
                .push(Task::new(format!("key-{}", i % 2), "count", move |_ctx| {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }))
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), router.wait_idle())
            .await
            .expect("all tasks finish");

        token.cancel();
        pool.join().await;

        let stats = shared.stats.to_pool_stats(2);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(stats.succeeded, 5);
        assert_eq!(stats.num_workers, 2);
        assert!(pool.worker_handles.is_empty());
    }

    #[tokio::test]
    async fn test_failure_after_cancel_is_discarded_not_parked() {
        let router = Arc::new(KeyRouter::new());
        let token = CancellationToken::new();
        let shared = shared(Arc::clone(&router), 3, token.clone());
        let mut pool = WorkerPool::start(Arc::clone(&shared), 1);

        let started = Arc::new(tokio::sync::Notify::new());
        let signal = Arc::clone(&started);
        router
            .push(Task::new("k", "flaky", move |_ctx| {
                let signal = Arc::clone(&signal);
                async move {
                    signal.notify_one();
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Err(TaskError::Network("connection reset".into()))
                }
            }))
            .unwrap();

        started.notified().await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(2), router.wait_idle())
            .await
            .expect("cancelled retry must not hold the router busy");
        pool.join().await;

        let stats = shared.stats.to_pool_stats(1);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.retries, 0);
        assert_eq!(router.pending("k"), 0);
    }

    #[tokio::test]
    async fn test_parked_retry_discarded_when_token_fires() {
        let router = Arc::new(KeyRouter::new());
        let token = CancellationToken::new();
        let shared = shared(Arc::clone(&router), 3, token.clone());
        let worker = Worker::new("worker-test".into(), Arc::clone(&shared));

        router
            .push(Task::new("k", "parked", |_ctx| async { Ok(()) }))
            .unwrap();
        let key = router.claim().unwrap();
        let task = router.next_task(&key).unwrap();
        router.park(task);
        worker.schedule_unpark(key, Duration::from_secs(30));
        assert_eq!(router.outstanding(), 1);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), router.wait_idle())
            .await
            .expect("parked task is discarded on cancellation");

        assert_eq!(shared.stats.to_pool_stats(1).discarded, 1);
        assert_eq!(router.pending("k"), 0);
    }
}
