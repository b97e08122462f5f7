//! Runtime configuration for the renderer scheduler.
//!
//! Defaults mirror the tuning the scheduler shipped with; every knob can
//! also be loaded from `SCHEDULER_*` environment variables for
//! experiments.

use core::time::Duration;
use std::env;

/// Tuning knobs for policy escalation, idle periods and the queueing time
/// estimator.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// How long queue priorities stay escalated after an input event.
    pub input_escalation_duration: Duration,
    /// How long a hidden renderer may keep running idle tasks before its
    /// idle period self-terminates.
    pub end_idle_when_hidden_delay: Duration,
    /// Upper bound on a single long idle period.
    pub max_idle_period: Duration,
    /// Long idle periods shorter than this are not worth entering; entry
    /// retries at the next delayed-task wakeup instead.
    pub min_long_idle_period: Duration,
    /// Width of the expected-queueing-time reporting window.
    pub eqt_window_duration: Duration,
    /// Steps per EQT window; the sliding window advances one step at a
    /// time.
    pub eqt_steps_per_window: usize,
    /// Tasks the pump runs per drain before re-posting itself.
    pub work_batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            input_escalation_duration: Duration::from_millis(100),
            end_idle_when_hidden_delay: Duration::from_secs(10),
            max_idle_period: Duration::from_millis(50),
            min_long_idle_period: Duration::from_millis(1),
            eqt_window_duration: Duration::from_secs(1),
            eqt_steps_per_window: 20,
            work_batch_size: 1,
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults above.
    ///
    /// Recognized variables, all optional:
    /// - `SCHEDULER_INPUT_ESCALATION_MS`
    /// - `SCHEDULER_END_IDLE_WHEN_HIDDEN_MS`
    /// - `SCHEDULER_MAX_IDLE_PERIOD_MS`
    /// - `SCHEDULER_EQT_WINDOW_MS`
    /// - `SCHEDULER_EQT_STEPS_PER_WINDOW`
    /// - `SCHEDULER_WORK_BATCH_SIZE`
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            input_escalation_duration: env_millis(
                "SCHEDULER_INPUT_ESCALATION_MS",
                defaults.input_escalation_duration,
            ),
            end_idle_when_hidden_delay: env_millis(
                "SCHEDULER_END_IDLE_WHEN_HIDDEN_MS",
                defaults.end_idle_when_hidden_delay,
            ),
            max_idle_period: env_millis("SCHEDULER_MAX_IDLE_PERIOD_MS", defaults.max_idle_period),
            min_long_idle_period: defaults.min_long_idle_period,
            eqt_window_duration: env_millis("SCHEDULER_EQT_WINDOW_MS", defaults.eqt_window_duration),
            eqt_steps_per_window: env_usize(
                "SCHEDULER_EQT_STEPS_PER_WINDOW",
                defaults.eqt_steps_per_window,
            ),
            work_batch_size: env_usize("SCHEDULER_WORK_BATCH_SIZE", defaults.work_batch_size),
        }
    }
}

fn env_millis(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|&value| value > 0)
        .unwrap_or(default)
}
