//! Queue selection: strict priority across levels, round-robin within a
//! level so equal-priority queues cannot starve each other.

use std::sync::Arc;

use crate::queue::QueueInner;
use crate::task::Priority;

/// Main-thread-only selection state: one rotating cursor per priority
/// level.
pub(crate) struct QueueSelector {
    cursors: [usize; Priority::ALL.len()],
}

impl QueueSelector {
    pub(crate) fn new() -> Self {
        Self {
            cursors: [0; Priority::ALL.len()],
        }
    }

    /// Picks the next queue to run from: the highest enabled priority with
    /// at least one pending task. Returns `None` when every runnable queue
    /// is empty.
    pub(crate) fn select(&mut self, queues: &[Arc<QueueInner>]) -> Option<usize> {
        let count = queues.len();
        for priority in Priority::ALL {
            let cursor = &mut self.cursors[priority as usize];
            for offset in 0..count {
                let index = (*cursor + offset) % count;
                let queue = &queues[index];
                if queue.is_enabled() && queue.priority() == priority && queue.has_tasks() {
                    *cursor = (index + 1) % count;
                    return Some(index);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_queues(priorities: &[Priority]) -> Vec<Arc<QueueInner>> {
        priorities
            .iter()
            .map(|&priority| Arc::new(QueueInner::new("test", priority, true)))
            .collect()
    }

    fn fill(queues: &[Arc<QueueInner>], index: usize, count: usize) {
        for _ in 0..count {
            queues[index].push(Box::new(|| {}));
        }
    }

    #[test]
    fn higher_priority_queue_wins() {
        let queues = make_queues(&[Priority::Normal, Priority::High]);
        fill(&queues, 0, 1);
        fill(&queues, 1, 1);
        let mut selector = QueueSelector::new();
        assert_eq!(selector.select(&queues), Some(1));
    }

    #[test]
    fn control_beats_everything() {
        let queues = make_queues(&[Priority::High, Priority::Control, Priority::Normal]);
        fill(&queues, 0, 1);
        fill(&queues, 1, 1);
        fill(&queues, 2, 1);
        let mut selector = QueueSelector::new();
        assert_eq!(selector.select(&queues), Some(1));
    }

    #[test]
    fn round_robin_within_a_priority_level() {
        let queues = make_queues(&[Priority::Normal, Priority::Normal, Priority::Normal]);
        fill(&queues, 0, 2);
        fill(&queues, 1, 2);
        fill(&queues, 2, 2);
        let mut selector = QueueSelector::new();
        let mut order = Vec::new();
        for _ in 0..6 {
            let selected = selector.select(&queues);
            if let Some(index) = selected {
                queues[index].pop();
                order.push(index);
            }
        }
        assert_eq!(order, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn disabled_queue_is_never_selected() {
        let queues = make_queues(&[Priority::High, Priority::Normal]);
        fill(&queues, 0, 1);
        fill(&queues, 1, 1);
        queues[0].set_enabled(false);
        let mut selector = QueueSelector::new();
        assert_eq!(selector.select(&queues), Some(1));
    }

    #[test]
    fn empty_queues_yield_nothing() {
        let queues = make_queues(&[Priority::Control, Priority::Normal]);
        let mut selector = QueueSelector::new();
        assert_eq!(selector.select(&queues), None);
    }

    #[test]
    fn starved_level_runs_once_higher_level_drains() {
        let queues = make_queues(&[Priority::High, Priority::BestEffort]);
        fill(&queues, 0, 1);
        fill(&queues, 1, 1);
        let mut selector = QueueSelector::new();
        assert_eq!(selector.select(&queues), Some(0));
        queues[0].pop();
        assert_eq!(selector.select(&queues), Some(1));
    }
}
