//! Retry policy and failure classification.
//!
//! After a body returns an error the policy decides between retrying the task
//! (after a capped exponential delay) and dropping it for good.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;
use crate::error::{ErrorClass, TaskError};

use super::task::{RetryMode, Task};

/// Why a task left its lane without succeeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropReason {
    /// The error is classified terminal.
    Terminal,
    /// The body panicked.
    Panicked,
    /// The retry budget is used up.
    Exhausted,
    /// The scheduler shut down before the task could finish.
    Discarded,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Terminal => write!(f, "terminal"),
            DropReason::Panicked => write!(f, "panicked"),
            DropReason::Exhausted => write!(f, "exhausted"),
            DropReason::Discarded => write!(f, "discarded"),
        }
    }
}

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Run the task again as retry number `attempt` after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Discard the task.
    Drop(DropReason),
}

/// Bounded retry with capped exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            multiplier: multiplier.max(1.0),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(
            config.retries,
            config.base_delay,
            config.max_delay,
            config.backoff_multiplier,
        )
    }

    /// Retries allowed after the first failure.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before retry number `attempt` (1-based).
    ///
    /// Non-decreasing in `attempt` and never above the configured cap.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() || attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let nanos = self.base_delay.as_nanos() as f64 * self.multiplier.powi(exponent);
        let capped = nanos.min(self.max_delay.as_nanos() as f64);
        Duration::from_nanos(capped.round() as u64)
    }

    /// Decides what happens to `task` after it failed with `error`.
    pub fn decide(&self, task: &Task, error: &TaskError) -> Decision {
        match (error.class(), task.retry_mode) {
            (ErrorClass::Panic, _) => return Decision::Drop(DropReason::Panicked),
            (ErrorClass::Terminal, RetryMode::Classified) => {
                return Decision::Drop(DropReason::Terminal)
            }
            _ => {}
        }

        if task.attempt >= self.max_retries {
            return Decision::Drop(DropReason::Exhausted);
        }

        let attempt = task.attempt + 1;
        Decision::Retry {
            attempt,
            delay: self.delay_for(attempt),
        }
    }
}
