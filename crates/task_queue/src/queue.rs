//! A single task queue: a FIFO of pending closures plus the priority and
//! enabled flags the policy layer mutates.
//!
//! Posting is allowed from any thread; popping happens only on the main
//! thread. The deque is the only state needing a lock; priority and
//! enabled are atomics read by the selector.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::task::{Priority, TaskClosure};

pub(crate) struct QueueInner {
    name: &'static str,
    tasks: Mutex<VecDeque<TaskClosure>>,
    priority: AtomicU8,
    enabled: AtomicBool,
}

impl QueueInner {
    pub(crate) fn new(name: &'static str, priority: Priority, enabled: bool) -> Self {
        Self {
            name,
            tasks: Mutex::new(VecDeque::new()),
            priority: AtomicU8::new(priority as u8),
            enabled: AtomicBool::new(enabled),
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn push(&self, task: TaskClosure) {
        self.lock_tasks().push_back(task);
    }

    pub(crate) fn pop(&self) -> Option<TaskClosure> {
        self.lock_tasks().pop_front()
    }

    pub(crate) fn clear(&self) {
        self.lock_tasks().clear();
    }

    pub(crate) fn has_tasks(&self) -> bool {
        !self.lock_tasks().is_empty()
    }

    pub(crate) fn priority(&self) -> Priority {
        Priority::from_index(self.priority.load(Ordering::Acquire))
    }

    pub(crate) fn set_priority(&self, priority: Priority) {
        self.priority.store(priority as u8, Ordering::Release);
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    fn lock_tasks(&self) -> MutexGuard<'_, VecDeque<TaskClosure>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
