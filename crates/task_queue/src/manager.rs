//! The task queue manager: owns the queue set, drains it onto the
//! underlying main-thread runner, and notifies task observers around every
//! task it runs.
//!
//! Posting is multi-producer; selection and execution are single-consumer
//! on the thread the manager was constructed on. The drain is coalesced
//! through a single atomic flag, so any number of posts schedule at most
//! one pending `do_work`.

use core::time::Duration;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use log::{debug, trace};
use tracing::trace_span;

use crate::clock::{Clock, TimeTicks};
use crate::queue::QueueInner;
use crate::runner::MainTaskRunner;
use crate::selector::QueueSelector;
use crate::task::{Priority, QueueId, QueueSpec, TaskClosure};

/// Observes every task the manager runs. Callbacks fire on the main thread
/// with no manager locks held.
pub trait TaskObserver: Send {
    fn will_process_task(&mut self, queue: QueueId, start_time: TimeTicks);
    fn did_process_task(&mut self, queue: QueueId, end_time: TimeTicks);
}

/// Cheap cloneable handle to the queue set. All handles share one manager.
#[derive(Clone)]
pub struct TaskQueueManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    queues: Vec<Arc<QueueInner>>,
    selector: Mutex<QueueSelector>,
    runner: Arc<dyn MainTaskRunner>,
    clock: Arc<dyn Clock>,
    do_work_scheduled: AtomicBool,
    is_shutdown: AtomicBool,
    work_batch_size: AtomicUsize,
    observers: Mutex<Vec<Box<dyn TaskObserver>>>,
    // Due times of delayed posts that have not fired yet, so the idle
    // helper can size long idle periods around the next wakeup.
    delayed_wakeups: Mutex<BTreeMap<TimeTicks, usize>>,
    main_thread: ThreadId,
}

impl TaskQueueManager {
    /// Creates the fixed queue set. Queues are never added or removed
    /// after this; ids are indices in `specs` order. Must be called on the
    /// thread that will run tasks.
    #[must_use]
    pub fn new(
        specs: &[QueueSpec],
        runner: Arc<dyn MainTaskRunner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let queues = specs
            .iter()
            .map(|spec| Arc::new(QueueInner::new(spec.name, spec.priority, spec.enabled)))
            .collect();
        Self {
            inner: Arc::new(ManagerInner {
                queues,
                selector: Mutex::new(QueueSelector::new()),
                runner,
                clock,
                do_work_scheduled: AtomicBool::new(false),
                is_shutdown: AtomicBool::new(false),
                work_batch_size: AtomicUsize::new(1),
                observers: Mutex::new(Vec::new()),
                delayed_wakeups: Mutex::new(BTreeMap::new()),
                main_thread: thread::current().id(),
            }),
        }
    }

    /// Appends `task` to the queue. Posting to a disabled queue
    /// accumulates silently until the queue is re-enabled.
    pub fn post_task(&self, queue: QueueId, task: TaskClosure) {
        ManagerInner::post_task(&self.inner, queue, task);
    }

    /// Like [`TaskQueueManager::post_task`], but the task only becomes
    /// eligible after `delay`.
    pub fn post_delayed_task(&self, queue: QueueId, task: TaskClosure, delay: Duration) {
        ManagerInner::post_delayed_task(&self.inner, queue, task, delay);
    }

    /// A posting handle bound to one queue, for handing to callers that
    /// should not see the rest of the manager.
    #[must_use]
    pub fn queue_task_runner(&self, queue: QueueId) -> QueueTaskRunner {
        self.inner.check_queue(queue);
        QueueTaskRunner {
            inner: Arc::clone(&self.inner),
            queue,
        }
    }

    /// Sets a queue's priority, re-enabling it if it was disabled.
    /// Reserved to the policy layer.
    pub fn set_queue_priority(&self, queue: QueueId, priority: Priority) {
        self.inner.check_main_thread();
        self.inner.check_queue(queue);
        let target = &self.inner.queues[queue.index()];
        target.set_priority(priority);
        let was_disabled = !target.is_enabled();
        target.set_enabled(true);
        if was_disabled && target.has_tasks() {
            ManagerInner::schedule_do_work(&self.inner);
        }
    }

    /// Removes a queue from selection entirely; pending and future posts
    /// accumulate until re-enabled.
    pub fn disable_queue(&self, queue: QueueId) {
        self.inner.check_main_thread();
        self.inner.check_queue(queue);
        self.inner.queues[queue.index()].set_enabled(false);
    }

    #[must_use]
    pub fn is_queue_enabled(&self, queue: QueueId) -> bool {
        self.inner.check_queue(queue);
        self.inner.queues[queue.index()].is_enabled()
    }

    #[must_use]
    pub fn is_queue_empty(&self, queue: QueueId) -> bool {
        self.inner.check_queue(queue);
        !self.inner.queues[queue.index()].has_tasks()
    }

    #[must_use]
    pub fn queue_priority(&self, queue: QueueId) -> Priority {
        self.inner.check_queue(queue);
        self.inner.queues[queue.index()].priority()
    }

    /// Registers an observer notified around every executed task.
    pub fn add_task_observer(&self, observer: Box<dyn TaskObserver>) {
        self.inner.lock_observers().push(observer);
    }

    /// Number of tasks the pump runs per `do_work` before re-posting
    /// itself.
    pub fn set_work_batch_size(&self, batch_size: usize) {
        self.inner
            .work_batch_size
            .store(batch_size.max(1), Ordering::Release);
    }

    /// Due time of the earliest delayed post that has not fired yet.
    #[must_use]
    pub fn next_delayed_task_time(&self) -> Option<TimeTicks> {
        self.inner
            .lock_delayed_wakeups()
            .keys()
            .next()
            .copied()
    }

    #[must_use]
    pub fn now(&self) -> TimeTicks {
        self.inner.clock.now()
    }

    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.inner.clock)
    }

    /// Drains every queue synchronously and turns all further posts and
    /// pending drains into no-ops. Posted closures are dropped, never run.
    pub fn shutdown(&self) {
        self.inner.check_main_thread();
        if self.inner.is_shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for queue in &self.inner.queues {
            queue.clear();
        }
        self.inner.lock_delayed_wakeups().clear();
        debug!("task queue manager shut down");
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown.load(Ordering::Acquire)
    }
}

impl ManagerInner {
    fn check_queue(&self, queue: QueueId) {
        debug_assert!(
            queue.index() < self.queues.len(),
            "queue id {} out of range",
            queue.index()
        );
    }

    fn check_main_thread(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.main_thread,
            "main-thread-only method called off-thread"
        );
    }

    fn post_task(inner: &Arc<Self>, queue: QueueId, task: TaskClosure) {
        inner.check_queue(queue);
        if inner.is_shutdown.load(Ordering::Acquire) {
            trace!("dropping task posted after shutdown");
            return;
        }
        let target = &inner.queues[queue.index()];
        target.push(task);
        if target.is_enabled() {
            Self::schedule_do_work(inner);
        }
    }

    fn post_delayed_task(inner: &Arc<Self>, queue: QueueId, task: TaskClosure, delay: Duration) {
        inner.check_queue(queue);
        if inner.is_shutdown.load(Ordering::Acquire) {
            trace!("dropping delayed task posted after shutdown");
            return;
        }
        let due = inner.clock.now() + delay;
        *inner.lock_delayed_wakeups().entry(due).or_insert(0) += 1;
        let handle = Arc::clone(inner);
        inner.runner.post_delayed(
            Box::new(move || {
                handle.remove_delayed_wakeup(due);
                Self::post_task(&handle, queue, task);
            }),
            delay,
        );
    }

    fn remove_delayed_wakeup(&self, due: TimeTicks) {
        let mut wakeups = self.lock_delayed_wakeups();
        if let Some(count) = wakeups.get_mut(&due) {
            *count -= 1;
            if *count == 0 {
                wakeups.remove(&due);
            }
        }
    }

    fn schedule_do_work(inner: &Arc<Self>) {
        if inner.is_shutdown.load(Ordering::Acquire) {
            return;
        }
        if !inner.do_work_scheduled.swap(true, Ordering::AcqRel) {
            let handle = Arc::clone(inner);
            inner.runner.post(Box::new(move || Self::do_work(&handle)));
        }
    }

    fn do_work(inner: &Arc<Self>) {
        inner.check_main_thread();
        if inner.is_shutdown.load(Ordering::Acquire) {
            return;
        }
        inner.do_work_scheduled.store(false, Ordering::Release);
        let batch_size = inner.work_batch_size.load(Ordering::Acquire);
        for _ in 0..batch_size {
            let selected = {
                let mut selector = inner
                    .selector
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                selector.select(&inner.queues)
            };
            let Some(index) = selected else {
                return;
            };
            // Only the main thread pops, so the task selected above is
            // still there.
            let Some(task) = inner.queues[index].pop() else {
                continue;
            };
            let queue = QueueId::new(index);
            inner.notify_will_process(queue);
            {
                let span = trace_span!("task", queue = inner.queues[index].name());
                let _entered = span.enter();
                task();
            }
            inner.notify_did_process(queue);
            if inner.is_shutdown.load(Ordering::Acquire) {
                return;
            }
        }
        if inner.has_runnable_work() {
            Self::schedule_do_work(inner);
        }
    }

    fn has_runnable_work(&self) -> bool {
        self.queues
            .iter()
            .any(|queue| queue.is_enabled() && queue.has_tasks())
    }

    fn notify_will_process(&self, queue: QueueId) {
        let start = self.clock.now();
        for observer in self.lock_observers().iter_mut() {
            observer.will_process_task(queue, start);
        }
    }

    fn notify_did_process(&self, queue: QueueId) {
        let end = self.clock.now();
        for observer in self.lock_observers().iter_mut() {
            observer.did_process_task(queue, end);
        }
    }

    fn lock_observers(&self) -> MutexGuard<'_, Vec<Box<dyn TaskObserver>>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_delayed_wakeups(&self) -> MutexGuard<'_, BTreeMap<TimeTicks, usize>> {
        self.delayed_wakeups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Posting handle bound to one queue. Cloneable and usable from any
/// thread.
#[derive(Clone)]
pub struct QueueTaskRunner {
    inner: Arc<ManagerInner>,
    queue: QueueId,
}

impl QueueTaskRunner {
    pub fn post(&self, task: TaskClosure) {
        ManagerInner::post_task(&self.inner, self.queue, task);
    }

    pub fn post_delayed(&self, task: TaskClosure, delay: Duration) {
        ManagerInner::post_delayed_task(&self.inner, self.queue, task, delay);
    }

    #[must_use]
    pub fn queue_id(&self) -> QueueId {
        self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ManualTaskRunner, TestClock};

    fn record(log: &Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> TaskClosure {
        let log = Arc::clone(log);
        Box::new(move || {
            log.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(label);
        })
    }

    fn logged(log: &Arc<Mutex<Vec<&'static str>>>) -> Vec<&'static str> {
        log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    struct Harness {
        runner: Arc<ManualTaskRunner>,
        manager: TaskQueueManager,
        high: QueueId,
        normal: QueueId,
    }

    fn make_harness() -> Harness {
        let clock = Arc::new(TestClock::new());
        let runner = Arc::new(ManualTaskRunner::new(Arc::clone(&clock)));
        let manager = TaskQueueManager::new(
            &[
                QueueSpec::new("high", Priority::High),
                QueueSpec::new("normal", Priority::Normal),
            ],
            Arc::clone(&runner) as Arc<dyn MainTaskRunner>,
            clock,
        );
        Harness {
            runner,
            manager,
            high: QueueId::new(0),
            normal: QueueId::new(1),
        }
    }

    #[test]
    fn higher_priority_tasks_run_first() {
        let harness = make_harness();
        let log = Arc::new(Mutex::new(Vec::new()));
        harness.manager.post_task(harness.normal, record(&log, "normal"));
        harness.manager.post_task(harness.high, record(&log, "high"));
        harness.runner.run_until_idle();
        assert_eq!(logged(&log), vec!["high", "normal"]);
    }

    #[test]
    fn disabled_queue_accumulates_until_reenabled() {
        let harness = make_harness();
        let log = Arc::new(Mutex::new(Vec::new()));
        harness.manager.disable_queue(harness.normal);
        harness.manager.post_task(harness.normal, record(&log, "queued"));
        harness.runner.run_until_idle();
        assert!(logged(&log).is_empty());

        harness.manager.set_queue_priority(harness.normal, Priority::Normal);
        harness.runner.run_until_idle();
        assert_eq!(logged(&log), vec!["queued"]);
    }

    #[test]
    fn delayed_task_fires_at_due_time() {
        let harness = make_harness();
        let log = Arc::new(Mutex::new(Vec::new()));
        harness.manager.post_delayed_task(
            harness.normal,
            record(&log, "delayed"),
            Duration::from_millis(30),
        );
        assert_eq!(
            harness.manager.next_delayed_task_time(),
            Some(TimeTicks::ZERO + Duration::from_millis(30))
        );
        harness.runner.run_until(TimeTicks::ZERO + Duration::from_millis(10));
        assert!(logged(&log).is_empty());
        harness.runner.run_until(TimeTicks::ZERO + Duration::from_millis(30));
        assert_eq!(logged(&log), vec!["delayed"]);
        assert_eq!(harness.manager.next_delayed_task_time(), None);
    }

    #[test]
    fn tasks_posted_from_tasks_run_in_the_same_drain() {
        let harness = make_harness();
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = harness.manager.clone();
        let normal = harness.normal;
        let inner_log = Arc::clone(&log);
        harness.manager.post_task(
            harness.normal,
            Box::new(move || {
                inner_log
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push("outer");
                manager.post_task(normal, record(&inner_log, "inner"));
            }),
        );
        harness.runner.run_until_idle();
        assert_eq!(logged(&log), vec!["outer", "inner"]);
    }

    #[test]
    fn shutdown_drops_pending_work() {
        let harness = make_harness();
        let log = Arc::new(Mutex::new(Vec::new()));
        harness.manager.post_task(harness.normal, record(&log, "dropped"));
        harness.manager.shutdown();
        harness.runner.run_until_idle();
        assert!(logged(&log).is_empty());
        assert!(harness.manager.is_shutdown());
    }

    #[test]
    fn observers_see_every_task() {
        struct Counter {
            log: Arc<Mutex<Vec<&'static str>>>,
        }
        impl TaskObserver for Counter {
            fn will_process_task(&mut self, _queue: QueueId, _start_time: TimeTicks) {
                self.log
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push("will");
            }
            fn did_process_task(&mut self, _queue: QueueId, _end_time: TimeTicks) {
                self.log
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push("did");
            }
        }

        let harness = make_harness();
        let log = Arc::new(Mutex::new(Vec::new()));
        harness
            .manager
            .add_task_observer(Box::new(Counter { log: Arc::clone(&log) }));
        harness.manager.post_task(harness.high, record(&log, "task"));
        harness.runner.run_until_idle();
        assert_eq!(logged(&log), vec!["will", "task", "did"]);
    }
}
