//! The priority-escalation regimes the scheduler can be in.

/// Current escalation regime governing relative queue priorities. Policies
/// are re-derived from the input signals on every evaluation, never
/// mutated incrementally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// All user-visible queues run at normal priority.
    Normal,
    /// Compositor work is urgent; loading work is demoted to best effort.
    CompositorPriority,
    /// A touch start awaits a response: compositor work is urgent and
    /// loading work is disabled outright for the escalation window.
    TouchstartPriority,
}

impl Policy {
    /// Whether this policy indicates high-priority work in the near
    /// future.
    #[must_use]
    pub const fn is_escalated(self) -> bool {
        !matches!(self, Self::Normal)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::CompositorPriority => "compositor",
            Self::TouchstartPriority => "touchstart",
        }
    }
}
