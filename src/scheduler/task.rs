//! Task definitions for the scheduler.
//!
//! - `Task`: a named unit of work bound to a queue key
//! - `TaskContext`: what a body receives on every attempt
//! - `TaskState`: lifecycle of a task inside its lane
//! - `RetryMode`: whether failures are classified before retrying

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::error::TaskError;

/// Result of one attempt of a task body.
pub type TaskResult = Result<(), TaskError>;

/// Boxed future produced by a task body.
pub type TaskFuture = BoxFuture<'static, TaskResult>;

/// Type-erased task body. It is `Fn` because a task may run more than once.
pub type TaskFn = Arc<dyn Fn(TaskContext) -> TaskFuture + Send + Sync>;

/// How failures of a task are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RetryMode {
    /// Terminal errors drop the task, transient errors are retried.
    #[default]
    Classified,
    /// Every error except a panic is retried until the budget runs out.
    AnyError,
}

/// Lifecycle state of a task.
///
/// `Pending → Running → {Succeeded, Retrying → Running, Dropped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Waiting in its lane.
    Pending,
    /// A worker is executing the body.
    Running,
    /// Failed transiently; waiting out the backoff at the head of its lane.
    Retrying,
    /// Completed successfully.
    Succeeded,
    /// Discarded after a terminal error, a panic, an exhausted budget or shutdown.
    Dropped,
}

impl TaskState {
    /// Returns whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Dropped)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Running => write!(f, "running"),
            TaskState::Retrying => write!(f, "retrying"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::Dropped => write!(f, "dropped"),
        }
    }
}

/// Per-attempt context handed to a task body.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Key of the lane the task belongs to.
    pub queue_key: String,
    /// Name of the task.
    pub task_name: String,
    /// Zero for the first run, incremented on every retry.
    pub attempt: u32,
    cancel: CancellationToken,
}

impl TaskContext {
    /// Returns whether the scheduler's governing token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the scheduler is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Token a body can pass down to its own operations.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// A unit of work owned by exactly one lane.
pub struct Task {
    /// Unique identifier, for logs only.
    pub id: Uuid,
    /// Partition key. Tasks sharing a key run one after another.
    pub queue_key: String,
    /// Human-readable name. Not used for ordering or uniqueness.
    pub name: String,
    /// Resource scope that submitted the task, if any.
    pub resource: Option<String>,
    /// Number of retries performed so far.
    pub attempt: u32,
    /// When the task was pushed.
    pub created_at: DateTime<Utc>,
    /// Failure handling mode.
    pub retry_mode: RetryMode,
    /// Current lifecycle state.
    pub state: TaskState,
    body: TaskFn,
}

impl Task {
    /// Creates a pending task from an async closure.
    pub fn new<F, Fut>(queue_key: impl Into<String>, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let body: TaskFn = Arc::new(move |ctx| body(ctx).boxed());
        Self::from_fn(queue_key, name, body)
    }

    /// Creates a pending task from an already type-erased body.
    pub fn from_fn(queue_key: impl Into<String>, name: impl Into<String>, body: TaskFn) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue_key: queue_key.into(),
            name: name.into(),
            resource: None,
            attempt: 0,
            created_at: Utc::now(),
            retry_mode: RetryMode::default(),
            state: TaskState::Pending,
            body,
        }
    }

    /// Tags the task with the resource scope that submitted it.
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_retry_mode(mut self, mode: RetryMode) -> Self {
        self.retry_mode = mode;
        self
    }

    /// Builds the future for the current attempt.
    ///
    /// Calling the body may itself panic; callers guard this with
    /// `catch_unwind`.
    pub(crate) fn invoke(&self, cancel: CancellationToken) -> TaskFuture {
        let ctx = TaskContext {
            queue_key: self.queue_key.clone(),
            task_name: self.name.clone(),
            attempt: self.attempt,
            cancel,
        };
        (self.body)(ctx)
    }

    /// Records one more retry.
    pub(crate) fn increment_attempt(&mut self) {
        self.attempt += 1;
    }

    /// Returns how long ago the task was pushed.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("queue_key", &self.queue_key)
            .field("name", &self.name)
            .field("resource", &self.resource)
            .field("attempt", &self.attempt)
            .field("retry_mode", &self.retry_mode)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_task_new() {
        let task = Task::new("users", "users_insert", |_ctx| async { Ok(()) });

        assert!(!task.id.is_nil());
        assert_eq!(task.queue_key, "users");
        assert_eq!(task.name, "users_insert");
        assert_eq!(task.attempt, 0);
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.retry_mode, RetryMode::Classified);
        assert!(task.resource.is_none());
    }

    #[test]
    fn test_task_builder() {
        let task = Task::new("", "t", |_ctx| async { Ok(()) })
            .with_resource("orders")
            .with_retry_mode(RetryMode::AnyError);

        assert_eq!(task.queue_key, "");
        assert_eq!(task.resource.as_deref(), Some("orders"));
        assert_eq!(task.retry_mode, RetryMode::AnyError);
    }

    #[test]
    fn test_task_age() {
        let mut task = Task::new("k", "aged", |_ctx| async { Ok(()) });
        assert!(task.age() >= chrono::Duration::zero());

        task.created_at = Utc::now() - chrono::Duration::seconds(5);
        assert!(task.age().num_milliseconds() >= 5_000);
    }

    #[tokio::test]
    async fn test_invoke_passes_context() {
        let seen = Arc::new(AtomicU32::new(u32::MAX));
        let seen_clone = Arc::clone(&seen);

        let mut task = Task::new("k", "name", move |ctx: TaskContext| {
            let seen = Arc::clone(&seen_clone);
            async move {
                assert_eq!(ctx.queue_key, "k");
                assert_eq!(ctx.task_name, "name");
                seen.store(ctx.attempt, Ordering::SeqCst);
                Ok(())
            }
        });

        task.increment_attempt();
        task.increment_attempt();
        task.invoke(CancellationToken::new())
            .await
            .expect("body succeeds");

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_context_sees_cancellation() {
        let token = CancellationToken::new();
        let task = Task::new("k", "wait", |ctx: TaskContext| async move {
            ctx.cancelled().await;
            Err(TaskError::Timeout("cancelled".into()))
        });

        let fut = task.invoke(token.clone());
        token.cancel();
        assert!(fut.await.is_err());
    }

    #[test]
    fn test_task_state_display() {
        assert_eq!(TaskState::Pending.to_string(), "pending");
        assert_eq!(TaskState::Running.to_string(), "running");
        assert_eq!(TaskState::Retrying.to_string(), "retrying");
        assert_eq!(TaskState::Succeeded.to_string(), "succeeded");
        assert_eq!(TaskState::Dropped.to_string(), "dropped");

        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Dropped.is_terminal());
        assert!(!TaskState::Retrying.is_terminal());
    }

    #[test]
    fn test_task_debug_omits_body() {
        let task = Task::new("k", "debug", |_ctx| async { Ok(()) });
        let rendered = format!("{:?}", task);
        assert!(rendered.contains("debug"));
        assert!(rendered.contains(".."));
    }
}
