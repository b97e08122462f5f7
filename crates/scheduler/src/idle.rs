//! Idle period bookkeeping.
//!
//! Idle tasks only run inside a bounded idle period: a short one between a
//! frame commit and the estimated next frame, or a long self-rearming one
//! while frames are not expected. The idle queue is enabled exactly for
//! the span of a period; ending a period disables it synchronously.

use task_queue::TimeTicks;

/// Which kind of idle period, if any, is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdlePeriodState {
    NotInIdlePeriod,
    /// Between a frame commit and the estimated start of the next frame.
    InShortIdlePeriod,
    /// Frames are not expected soon; bounded by the next delayed-task
    /// wakeup.
    InLongIdlePeriod,
    /// A long idle period running at the maximum length, with no wakeup
    /// before the deadline.
    InLongIdlePeriodWithMaxDeadline,
}

impl IdlePeriodState {
    #[must_use]
    pub const fn is_in_idle_period(self) -> bool {
        !matches!(self, Self::NotInIdlePeriod)
    }

    /// Whether an idle task may deliberately overrun its deadline. Only
    /// safe when nothing is scheduled before the period's maximum length.
    #[must_use]
    pub const fn can_exceed_deadline(self) -> bool {
        matches!(self, Self::InLongIdlePeriodWithMaxDeadline)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotInIdlePeriod => "not_in_idle_period",
            Self::InShortIdlePeriod => "in_short_idle_period",
            Self::InLongIdlePeriod => "in_long_idle_period",
            Self::InLongIdlePeriodWithMaxDeadline => "in_long_idle_period_with_max_deadline",
        }
    }
}

/// Mutable idle period state, guarded by the scheduler.
#[derive(Debug)]
pub(crate) struct IdleState {
    pub(crate) period_state: IdlePeriodState,
    pub(crate) deadline: TimeTicks,
}

impl IdleState {
    pub(crate) fn new() -> Self {
        Self {
            period_state: IdlePeriodState::NotInIdlePeriod,
            deadline: TimeTicks::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_max_deadline_state_may_overrun() {
        assert!(IdlePeriodState::InLongIdlePeriodWithMaxDeadline.can_exceed_deadline());
        assert!(!IdlePeriodState::InLongIdlePeriod.can_exceed_deadline());
        assert!(!IdlePeriodState::InShortIdlePeriod.can_exceed_deadline());
        assert!(!IdlePeriodState::NotInIdlePeriod.can_exceed_deadline());
    }
}
