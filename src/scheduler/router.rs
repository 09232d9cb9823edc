//! Key router: one FIFO lane per queue key.
//!
//! Lanes are created lazily on the first push for a key and kept for the life
//! of the router. A lane is handed to at most one worker at a time through
//! [`KeyRouter::claim`]; the claim lasts until the worker releases it by
//! emptying the lane, yielding it, or parking it for a retry.
//!
//! # Lane states
//!
//! ```text
//!            push                   claim
//!   idle ──────────▶ queued (ready) ──────▶ active
//!     ▲                   ▲                  │ │ │
//!     │    next_task=None │ yield_lane       │ │ │ park
//!     └───────────────────┼──────────────────┘ │ ▼
//!                         └────── unpark ──── parked
//! ```
//!
//! The ready list is FIFO and a key sits in it at most once, so every lane
//! with pending work is eventually claimed.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::error::SchedulerError;

use super::task::{Task, TaskState};

/// Pending tasks of one queue key.
#[derive(Debug, Default)]
struct Lane {
    pending: VecDeque<Task>,
    /// A worker currently owns this lane.
    active: bool,
    /// The key sits in the ready list.
    queued: bool,
    /// The head task is waiting out a retry delay.
    parked: bool,
}

impl Lane {
    fn is_ready(&self) -> bool {
        !self.active && !self.parked && !self.pending.is_empty()
    }
}

#[derive(Debug, Default)]
struct RouterState {
    lanes: HashMap<String, Lane>,
    ready: VecDeque<String>,
    closed: bool,
    /// Tasks sitting in lanes.
    pending: usize,
    /// Tasks taken by a worker and not yet finished or parked.
    in_flight: usize,
}

impl RouterState {
    /// Puts `key` at the back of the ready list if its lane can run.
    /// Returns whether a worker should be woken.
    fn mark_ready(&mut self, key: &str) -> bool {
        let Some(lane) = self.lanes.get_mut(key) else {
            return false;
        };
        if lane.is_ready() && !lane.queued {
            lane.queued = true;
            self.ready.push_back(key.to_string());
            return true;
        }
        false
    }

    fn outstanding(&self) -> usize {
        self.pending + self.in_flight
    }
}

/// Maps queue keys to lanes and tracks which lanes are ready to run.
#[derive(Debug, Default)]
pub struct KeyRouter {
    state: Mutex<RouterState>,
    work: Notify,
    idle: Notify,
}

impl KeyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `task` to the lane of its queue key, creating the lane if needed.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Closed` once [`close`](Self::close) was called.
    pub fn push(&self, mut task: Task) -> Result<(), SchedulerError> {
        let wake = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(SchedulerError::Closed);
            }

            let key = task.queue_key.clone();
            task.state = TaskState::Pending;
            state.lanes.entry(key.clone()).or_default().pending.push_back(task);
            state.pending += 1;
            state.mark_ready(&key)
        };

        if wake {
            self.work.notify_one();
        }
        Ok(())
    }

    /// Claims the next ready lane, returning its key.
    ///
    /// The caller owns the lane until it releases it through
    /// [`next_task`](Self::next_task), [`yield_lane`](Self::yield_lane) or
    /// [`park`](Self::park).
    pub fn claim(&self) -> Option<String> {
        let (claimed, more) = {
            let mut state = self.state.lock();
            let mut claimed = None;
            while let Some(key) = state.ready.pop_front() {
                let Some(lane) = state.lanes.get_mut(&key) else {
                    continue;
                };
                lane.queued = false;
                if lane.is_ready() {
                    lane.active = true;
                    claimed = Some(key);
                    break;
                }
            }
            (claimed, !state.ready.is_empty())
        };

        // Pass the wakeup on so other idle workers pick up remaining lanes.
        if claimed.is_some() && more {
            self.work.notify_one();
        }
        claimed
    }

    /// Pops the head task of a claimed lane.
    ///
    /// When the lane is empty the claim is released in the same critical
    /// section, so a concurrent push either lands before the check or finds
    /// the lane idle and schedules it.
    pub fn next_task(&self, key: &str) -> Option<Task> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let lane = state.lanes.get_mut(key)?;
        match lane.pending.pop_front() {
            Some(task) => {
                state.pending -= 1;
                state.in_flight += 1;
                Some(task)
            }
            None => {
                lane.active = false;
                None
            }
        }
    }

    /// Marks a task taken with [`next_task`](Self::next_task) as finished.
    pub fn finish(&self) {
        let idle = {
            let mut state = self.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            state.outstanding() == 0
        };
        if idle {
            self.idle.notify_waiters();
        }
    }

    /// Releases a claimed lane that still has work, sending it to the back of
    /// the ready list.
    pub fn yield_lane(&self, key: &str) {
        let wake = {
            let mut state = self.state.lock();
            let Some(lane) = state.lanes.get_mut(key) else {
                return;
            };
            lane.active = false;
            state.mark_ready(key)
        };
        if wake {
            self.work.notify_one();
        }
    }

    /// Puts a failed task back at the head of its lane and releases the claim.
    ///
    /// The lane stays out of the ready list until [`unpark`](Self::unpark),
    /// so later tasks on the same key keep waiting behind the retry.
    pub fn park(&self, mut task: Task) {
        let mut state = self.state.lock();
        let key = task.queue_key.clone();
        task.state = TaskState::Retrying;
        state.in_flight = state.in_flight.saturating_sub(1);
        state.pending += 1;
        let lane = state.lanes.entry(key).or_default();
        lane.pending.push_front(task);
        lane.active = false;
        lane.parked = true;
    }

    /// Makes a parked lane eligible again once its retry delay elapsed.
    pub fn unpark(&self, key: &str) {
        let wake = {
            let mut state = self.state.lock();
            let Some(lane) = state.lanes.get_mut(key) else {
                return;
            };
            lane.parked = false;
            state.mark_ready(key)
        };
        if wake {
            self.work.notify_one();
        }
    }

    /// Stops accepting pushes. Returns false if the router was already closed.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock();
        !std::mem::replace(&mut state.closed, true)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Removes every pending task from every lane.
    ///
    /// Lanes themselves are kept; tasks currently held by workers are not
    /// affected.
    pub fn drain_all(&self) -> Vec<Task> {
        let (drained, idle) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.ready.clear();
            let mut drained = Vec::with_capacity(state.pending);
            for lane in state.lanes.values_mut() {
                lane.queued = false;
                lane.parked = false;
                drained.extend(lane.pending.drain(..));
            }
            state.pending = 0;
            (drained, state.outstanding() == 0)
        };
        if idle {
            self.idle.notify_waiters();
        }
        drained
    }

    /// Number of lanes ever created.
    pub fn lane_count(&self) -> usize {
        self.state.lock().lanes.len()
    }

    /// Pending tasks for `key`, including a parked retry.
    pub fn pending(&self, key: &str) -> usize {
        self.state
            .lock()
            .lanes
            .get(key)
            .map_or(0, |lane| lane.pending.len())
    }

    /// Pending tasks across all lanes.
    pub fn total_pending(&self) -> usize {
        self.state.lock().pending
    }

    /// Tasks pushed but not yet succeeded or dropped.
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding()
    }

    /// Future resolved when a lane may have become ready.
    ///
    /// Workers `enable` it before calling [`claim`](Self::claim) so a push
    /// between the check and the wait is not missed.
    pub fn work_available(&self) -> Notified<'_> {
        self.work.notified()
    }

    /// Waits until no task is pending or in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn task(key: &str, name: &str) -> Task {
        Task::new(key, name, |_ctx| async { Ok(()) })
    }

    #[test]
    fn test_push_creates_lane_lazily() {
        let router = KeyRouter::new();
        assert_eq!(router.lane_count(), 0);

        router.push(task("users", "a")).unwrap();
        router.push(task("users", "b")).unwrap();
        router.push(task("orders", "c")).unwrap();

        assert_eq!(router.lane_count(), 2);
        assert_eq!(router.pending("users"), 2);
        assert_eq!(router.pending("orders"), 1);
        assert_eq!(router.pending("missing"), 0);
        assert_eq!(router.total_pending(), 3);
    }

    #[test]
    fn test_empty_key_is_its_own_lane() {
        let router = KeyRouter::new();
        router.push(task("", "a")).unwrap();
        router.push(task("x", "b")).unwrap();

        assert_eq!(router.lane_count(), 2);
        assert_eq!(router.pending(""), 1);
    }

    #[test]
    fn test_fifo_within_lane() {
        let router = KeyRouter::new();
        for name in ["first", "second", "third"] {
            router.push(task("k", name)).unwrap();
        }

        let key = router.claim().expect("lane is ready");
        let names: Vec<String> = std::iter::from_fn(|| router.next_task(&key))
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let router = KeyRouter::new();
        router.push(task("k", "a")).unwrap();
        router.push(task("k", "b")).unwrap();

        assert_eq!(router.claim().as_deref(), Some("k"));
        // Pushing more work while claimed must not hand the lane out twice.
        router.push(task("k", "c")).unwrap();
        assert!(router.claim().is_none());
    }

    #[test]
    fn test_release_on_empty_then_reschedule() {
        let router = KeyRouter::new();
        router.push(task("k", "a")).unwrap();

        let key = router.claim().unwrap();
        assert!(router.next_task(&key).is_some());
        router.finish();
        assert!(router.next_task(&key).is_none());

        router.push(task("k", "b")).unwrap();
        assert_eq!(router.claim().as_deref(), Some("k"));
    }

    #[test]
    fn test_ready_list_is_fifo_across_keys() {
        let router = KeyRouter::new();
        router.push(task("a", "1")).unwrap();
        router.push(task("b", "1")).unwrap();
        router.push(task("c", "1")).unwrap();

        assert_eq!(router.claim().as_deref(), Some("a"));
        assert_eq!(router.claim().as_deref(), Some("b"));
        assert_eq!(router.claim().as_deref(), Some("c"));
        assert!(router.claim().is_none());
    }

    #[test]
    fn test_yield_sends_lane_to_back() {
        let router = KeyRouter::new();
        router.push(task("hot", "1")).unwrap();
        router.push(task("hot", "2")).unwrap();
        router.push(task("cold", "1")).unwrap();

        let key = router.claim().unwrap();
        assert_eq!(key, "hot");
        router.next_task(&key).unwrap();
        router.finish();
        router.yield_lane(&key);

        assert_eq!(router.claim().as_deref(), Some("cold"));
        assert_eq!(router.claim().as_deref(), Some("hot"));
    }

    #[test]
    fn test_park_blocks_lane_until_unpark() {
        let router = KeyRouter::new();
        router.push(task("k", "a")).unwrap();
        router.push(task("k", "b")).unwrap();

        let key = router.claim().unwrap();
        let failed = router.next_task(&key).unwrap();
        router.park(failed);

        assert!(router.claim().is_none());
        assert_eq!(router.pending("k"), 2);
        assert_eq!(router.outstanding(), 2);

        router.unpark("k");
        let key = router.claim().unwrap();
        let head = router.next_task(&key).unwrap();
        assert_eq!(head.name, "a");
        assert_eq!(head.state, TaskState::Retrying);
    }

    #[test]
    fn test_close_rejects_push() {
        let router = KeyRouter::new();
        assert!(router.close());
        assert!(!router.close());
        assert!(router.is_closed());
        assert!(matches!(
            router.push(task("k", "late")),
            Err(SchedulerError::Closed)
        ));
    }

    #[test]
    fn test_drain_all_keeps_lanes() {
        let router = KeyRouter::new();
        router.push(task("a", "1")).unwrap();
        router.push(task("a", "2")).unwrap();
        router.push(task("b", "1")).unwrap();

        let drained = router.drain_all();
        assert_eq!(drained.len(), 3);
        assert_eq!(router.lane_count(), 2);
        assert_eq!(router.total_pending(), 0);
        assert!(router.claim().is_none());
    }

    #[tokio::test]
    async fn test_wait_idle() {
        let router = std::sync::Arc::new(KeyRouter::new());
        router.push(task("k", "a")).unwrap();

        let worker = {
            let router = std::sync::Arc::clone(&router);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let key = router.claim().unwrap();
                router.next_task(&key).unwrap();
                router.finish();
                assert!(router.next_task(&key).is_none());
            })
        };

        tokio::time::timeout(Duration::from_secs(2), router.wait_idle())
            .await
            .expect("router becomes idle");
        worker.await.unwrap();
    }
}
