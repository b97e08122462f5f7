//! Deterministic test doubles: a manually advanced clock and an ordered
//! task runner that advances the clock to each task's due time.
//!
//! These live in the library (not behind `cfg(test)`) because downstream
//! crates' tests drive the scheduler with them.

use core::time::Duration;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::clock::{Clock, TimeTicks};
use crate::runner::MainTaskRunner;
use crate::task::TaskClosure;

/// A clock that only moves when told to.
pub struct TestClock {
    now: Mutex<TimeTicks>,
}

impl TestClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            now: Mutex::new(TimeTicks::ZERO),
        }
    }

    /// Starts the clock at `start` instead of the origin.
    #[must_use]
    pub fn starting_at(start: TimeTicks) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += delta;
    }

    /// Moves the clock to `time`. Never moves it backwards.
    pub fn set_now(&self, time: TimeTicks) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        if time > *now {
            *now = time;
        }
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> TimeTicks {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ScheduledTask {
    due: TimeTicks,
    sequence: u64,
    closure: TaskClosure,
}

/// A [`MainTaskRunner`] that stores posted closures and runs them in
/// `(due, post-order)` order, advancing the shared [`TestClock`] to each
/// task's due time as it runs.
pub struct ManualTaskRunner {
    clock: Arc<TestClock>,
    state: Mutex<RunnerState>,
}

struct RunnerState {
    tasks: Vec<ScheduledTask>,
    next_sequence: u64,
}

impl ManualTaskRunner {
    #[must_use]
    pub fn new(clock: Arc<TestClock>) -> Self {
        Self {
            clock,
            state: Mutex::new(RunnerState {
                tasks: Vec::new(),
                next_sequence: 0,
            }),
        }
    }

    #[must_use]
    pub fn pending_task_count(&self) -> usize {
        self.lock_state().tasks.len()
    }

    /// Runs every stored task, including ones each task posts, advancing
    /// the clock as needed. Do not use while self-rearming work (such as
    /// long idle periods) is active; use [`ManualTaskRunner::run_until`].
    pub fn run_until_idle(&self) {
        while let Some(task) = self.take_next(None) {
            task();
        }
    }

    /// Runs tasks due at or before `deadline`, then leaves the clock at
    /// `deadline`.
    pub fn run_until(&self, deadline: TimeTicks) {
        while let Some(task) = self.take_next(Some(deadline)) {
            task();
        }
        self.clock.set_now(deadline);
    }

    /// Runs tasks due within the next `duration`.
    pub fn run_for(&self, duration: Duration) {
        let deadline = self.clock.now() + duration;
        self.run_until(deadline);
    }

    fn take_next(&self, deadline: Option<TimeTicks>) -> Option<TaskClosure> {
        let mut state = self.lock_state();
        let best = state
            .tasks
            .iter()
            .enumerate()
            .min_by_key(|(_, task)| (task.due, task.sequence))
            .map(|(index, _)| index)?;
        if let Some(limit) = deadline
            && state.tasks[best].due > limit
        {
            return None;
        }
        let task = state.tasks.swap_remove(best);
        drop(state);
        self.clock.set_now(task.due);
        Some(task.closure)
    }

    fn lock_state(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MainTaskRunner for ManualTaskRunner {
    fn post(&self, task: TaskClosure) {
        self.post_delayed(task, Duration::ZERO);
    }

    fn post_delayed(&self, task: TaskClosure, delay: Duration) {
        let due = self.clock.now() + delay;
        let mut state = self.lock_state();
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.tasks.push(ScheduledTask {
            due,
            sequence,
            closure: task,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_in_due_then_post_order() {
        let clock = Arc::new(TestClock::new());
        let runner = ManualTaskRunner::new(Arc::clone(&clock));
        let log = Arc::new(Mutex::new(Vec::new()));

        let push = |label: &'static str| {
            let log = Arc::clone(&log);
            Box::new(move || log.lock().unwrap_or_else(PoisonError::into_inner).push(label))
        };
        runner.post_delayed(push("late"), Duration::from_millis(20));
        runner.post(push("first"));
        runner.post(push("second"));
        runner.run_until_idle();

        let order = log.lock().unwrap_or_else(PoisonError::into_inner).clone();
        assert_eq!(order, vec!["first", "second", "late"]);
        assert_eq!(clock.now(), TimeTicks::ZERO + Duration::from_millis(20));
    }

    #[test]
    fn run_until_leaves_future_tasks_pending() {
        let clock = Arc::new(TestClock::new());
        let runner = ManualTaskRunner::new(Arc::clone(&clock));
        runner.post_delayed(Box::new(|| {}), Duration::from_millis(50));
        runner.run_until(TimeTicks::ZERO + Duration::from_millis(10));
        assert_eq!(runner.pending_task_count(), 1);
        assert_eq!(clock.now(), TimeTicks::ZERO + Duration::from_millis(10));
        runner.run_until(TimeTicks::ZERO + Duration::from_millis(50));
        assert_eq!(runner.pending_task_count(), 0);
    }
}
