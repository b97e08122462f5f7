//! A single cancelable callback scheduled at an absolute deadline.
//!
//! Rescheduling coalesces: an earlier deadline replaces the pending one, a
//! later deadline is ignored while one is pending. Stale fires are detected
//! with a generation counter, so canceling never races the underlying
//! runner.

use core::time::Duration;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::clock::TimeTicks;
use crate::manager::QueueTaskRunner;

/// Runs one callback at a requested deadline, coalescing redundant
/// reschedules. Used for policy re-evaluation and idle period re-arming.
pub struct DeadlineTaskRunner {
    inner: Arc<DeadlineInner>,
}

struct DeadlineInner {
    task_runner: QueueTaskRunner,
    callback: Box<dyn Fn() + Send + Sync>,
    state: Mutex<DeadlineState>,
}

struct DeadlineState {
    deadline: Option<TimeTicks>,
    generation: u64,
}

impl DeadlineTaskRunner {
    #[must_use]
    pub fn new(task_runner: QueueTaskRunner, callback: Box<dyn Fn() + Send + Sync>) -> Self {
        Self {
            inner: Arc::new(DeadlineInner {
                task_runner,
                callback,
                state: Mutex::new(DeadlineState {
                    deadline: None,
                    generation: 0,
                }),
            }),
        }
    }

    /// Requests the callback to fire at `now + delay`. If a fire is already
    /// pending at or before that time, this is a no-op; otherwise the
    /// pending fire is replaced.
    pub fn set_deadline(&self, now: TimeTicks, delay: Duration) {
        let deadline = now + delay;
        let generation = {
            let mut state = self.inner.lock_state();
            if let Some(pending) = state.deadline
                && pending <= deadline
            {
                return;
            }
            state.deadline = Some(deadline);
            state.generation += 1;
            state.generation
        };
        let inner = Arc::clone(&self.inner);
        self.inner
            .task_runner
            .post_delayed(Box::new(move || inner.fire(generation)), delay);
    }

    /// Invalidates any pending fire.
    pub fn cancel(&self) {
        let mut state = self.inner.lock_state();
        state.deadline = None;
        state.generation += 1;
    }

    /// Whether a fire is currently pending.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.inner.lock_state().deadline.is_some()
    }
}

impl DeadlineInner {
    fn fire(&self, generation: u64) {
        {
            let mut state = self.lock_state();
            if state.generation != generation {
                return;
            }
            state.deadline = None;
        }
        (self.callback)();
    }

    fn lock_state(&self) -> MutexGuard<'_, DeadlineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::manager::TaskQueueManager;
    use crate::runner::MainTaskRunner;
    use crate::task::{Priority, QueueId, QueueSpec};
    use crate::testing::{ManualTaskRunner, TestClock};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        clock: Arc<TestClock>,
        runner: Arc<ManualTaskRunner>,
        fires: Arc<AtomicUsize>,
        deadline_runner: DeadlineTaskRunner,
    }

    fn make_harness() -> Harness {
        let clock = Arc::new(TestClock::new());
        let runner = Arc::new(ManualTaskRunner::new(Arc::clone(&clock)));
        let manager = TaskQueueManager::new(
            &[QueueSpec::new("control", Priority::Control)],
            Arc::clone(&runner) as Arc<dyn MainTaskRunner>,
            Arc::clone(&clock) as Arc<dyn crate::Clock>,
        );
        let fires = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fires);
        let deadline_runner = DeadlineTaskRunner::new(
            manager.queue_task_runner(QueueId::new(0)),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        Harness {
            clock,
            runner,
            fires,
            deadline_runner,
        }
    }

    #[test]
    fn fires_once_at_the_deadline() {
        let harness = make_harness();
        let now = harness.clock.now();
        harness
            .deadline_runner
            .set_deadline(now, Duration::from_millis(10));
        assert!(harness.deadline_runner.is_armed());
        harness.runner.run_until(now + Duration::from_millis(20));
        assert_eq!(harness.fires.load(Ordering::SeqCst), 1);
        assert!(!harness.deadline_runner.is_armed());
    }

    #[test]
    fn later_deadline_coalesces_into_pending_one() {
        let harness = make_harness();
        let now = harness.clock.now();
        harness
            .deadline_runner
            .set_deadline(now, Duration::from_millis(10));
        harness
            .deadline_runner
            .set_deadline(now, Duration::from_millis(50));
        harness.runner.run_until(now + Duration::from_millis(100));
        assert_eq!(harness.fires.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn earlier_deadline_replaces_pending_one() {
        let harness = make_harness();
        let now = harness.clock.now();
        harness
            .deadline_runner
            .set_deadline(now, Duration::from_millis(50));
        harness
            .deadline_runner
            .set_deadline(now, Duration::from_millis(10));
        harness.runner.run_until(now + Duration::from_millis(10));
        assert_eq!(harness.fires.load(Ordering::SeqCst), 1);
        // The superseded 50ms post is stale and must not fire again.
        harness.runner.run_until(now + Duration::from_millis(100));
        assert_eq!(harness.fires.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_prevents_the_fire() {
        let harness = make_harness();
        let now = harness.clock.now();
        harness
            .deadline_runner
            .set_deadline(now, Duration::from_millis(10));
        harness.deadline_runner.cancel();
        harness.runner.run_until(now + Duration::from_millis(100));
        assert_eq!(harness.fires.load(Ordering::SeqCst), 0);
    }
}
