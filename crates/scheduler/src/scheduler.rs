//! The renderer main-thread scheduler.
//!
//! Owns the queue set, decides per-queue priorities from input and frame
//! signals, runs the idle period protocol, and feeds every executed task
//! into the queueing time estimator.
//!
//! Threading: everything except [`RendererScheduler::did_receive_input_event`],
//! [`RendererScheduler::did_animate_for_input`] and plain task posting is
//! main-thread-only. Input signals are folded into one mutex-guarded
//! bundle and crossed onto the main thread by posting an urgent policy
//! update to the control queue. Lock order is signals, then main-thread
//! state, then idle state; no lock is held while a task closure runs.

use core::time::Duration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;

use log::{debug, trace, warn};
use tracing::trace_span;

use task_queue::{
    Clock, DeadlineTaskRunner, MainTaskRunner, Priority, QueueId, QueueSpec, QueueTaskRunner,
    TaskObserver, TaskQueueManager, TimeTicks,
};

use crate::config::SchedulerConfig;
use crate::idle::{IdlePeriodState, IdleState};
use crate::input::{InputEvent, InputStreamState, compute_new_input_stream_state};
use crate::policy::Policy;
use crate::queueing_time::{QueueingTimeClient, QueueingTimeEstimator, SplitBucket};

/// The fixed queue set, created once at construction.
#[derive(Debug, Clone, Copy)]
struct SchedulerQueues {
    control: QueueId,
    default: QueueId,
    compositor: QueueId,
    loading: QueueId,
    timer: QueueId,
    idle: QueueId,
}

const QUEUE_SPECS: [QueueSpec; 6] = [
    QueueSpec::new("control", Priority::Control),
    QueueSpec::new("default", Priority::Normal),
    QueueSpec::new("compositor", Priority::Normal),
    QueueSpec::new("loading", Priority::Normal),
    QueueSpec::new("timer", Priority::Normal),
    QueueSpec::disabled("idle", Priority::BestEffort),
];

/// Input-side state shared with the compositor thread.
struct IncomingSignals {
    input_stream_state: InputStreamState,
    last_input_type: InputEvent,
    last_input_receipt_time: TimeTicks,
    /// When the main thread last demonstrably processed input; `None`
    /// while an input event is still queued up.
    last_input_process_time: Option<TimeTicks>,
}

/// State only the main thread touches.
struct MainThreadState {
    current_policy: Policy,
    policy_expiration_time: Option<TimeTicks>,
    estimated_next_frame_begin: TimeTicks,
    renderer_hidden: bool,
    renderer_backgrounded: bool,
    timer_queue_suspend_count: u32,
    policy_change_count: u64,
}

/// Point-in-time view of the scheduler, for logging and diagnostics.
#[derive(Debug, Clone)]
pub struct SchedulerSnapshot {
    pub policy: Policy,
    pub idle_period_state: IdlePeriodState,
    pub input_stream_state: InputStreamState,
    pub renderer_hidden: bool,
    pub estimated_next_frame_begin: TimeTicks,
}

pub(crate) struct SchedulerInner {
    manager: TaskQueueManager,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    queues: SchedulerQueues,
    signals: Mutex<IncomingSignals>,
    main: Mutex<MainThreadState>,
    idle: Mutex<IdleState>,
    /// True while an urgent policy update is already queued on the control
    /// queue, so input bursts coalesce into one update.
    policy_may_need_update: AtomicBool,
    update_policy_deadline: DeadlineTaskRunner,
    long_idle_deadline: DeadlineTaskRunner,
    hidden_idle_deadline: DeadlineTaskRunner,
    metrics: Arc<Mutex<QueueingTimeEstimator>>,
    was_shutdown: AtomicBool,
}

/// The renderer main-thread scheduler. Cloning yields another handle to
/// the same scheduler; the input-signal methods may be called from the
/// compositor thread.
#[derive(Clone)]
pub struct RendererScheduler {
    inner: Arc<SchedulerInner>,
}

impl RendererScheduler {
    /// Builds the scheduler on the current thread, which becomes the main
    /// thread. `telemetry` receives the windowed queueing time reports.
    #[must_use]
    pub fn new(
        runner: Arc<dyn MainTaskRunner>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
        telemetry: Box<dyn QueueingTimeClient>,
    ) -> Self {
        let manager = TaskQueueManager::new(&QUEUE_SPECS, runner, Arc::clone(&clock));
        manager.set_work_batch_size(config.work_batch_size);
        let queues = SchedulerQueues {
            control: QueueId::new(0),
            default: QueueId::new(1),
            compositor: QueueId::new(2),
            loading: QueueId::new(3),
            timer: QueueId::new(4),
            idle: QueueId::new(5),
        };
        let control_runner = manager.queue_task_runner(queues.control);
        let metrics = Arc::new(Mutex::new(QueueingTimeEstimator::new(
            telemetry,
            config.eqt_window_duration,
            config.eqt_steps_per_window,
        )));

        let inner = Arc::new_cyclic(|weak: &Weak<SchedulerInner>| {
            // The persistent callbacks below outlive individual posts, so
            // they hold weak handles and fall silent once the scheduler is
            // gone; one-shot posts hold strong handles and are dropped by
            // the shutdown drain.
            let update_policy = deadline_callback(weak, &control_runner, |inner| {
                SchedulerInner::update_policy(&inner);
            });
            let rearm_long_idle = deadline_callback(weak, &control_runner, |inner| {
                SchedulerInner::enable_long_idle_period(&inner);
            });
            let end_hidden_idle = deadline_callback(weak, &control_runner, |inner| {
                SchedulerInner::end_idle_period(&inner);
            });
            SchedulerInner {
                manager: manager.clone(),
                clock: Arc::clone(&clock),
                config: config.clone(),
                queues,
                signals: Mutex::new(IncomingSignals {
                    input_stream_state: InputStreamState::Inactive,
                    last_input_type: InputEvent::Undefined,
                    last_input_receipt_time: TimeTicks::ZERO,
                    last_input_process_time: None,
                }),
                main: Mutex::new(MainThreadState {
                    current_policy: Policy::Normal,
                    policy_expiration_time: None,
                    estimated_next_frame_begin: TimeTicks::ZERO,
                    renderer_hidden: false,
                    renderer_backgrounded: false,
                    timer_queue_suspend_count: 0,
                    policy_change_count: 0,
                }),
                idle: Mutex::new(IdleState::new()),
                policy_may_need_update: AtomicBool::new(false),
                update_policy_deadline: update_policy,
                long_idle_deadline: rearm_long_idle,
                hidden_idle_deadline: end_hidden_idle,
                metrics: Arc::clone(&metrics),
                was_shutdown: AtomicBool::new(false),
            }
        });

        inner.manager.add_task_observer(Box::new(MetricsObserver {
            metrics,
            queues,
        }));
        Self { inner }
    }

    /// Shuts the scheduler down: cancels armed deadlines and drains every
    /// queue synchronously. Required before drop.
    pub fn shutdown(&self) {
        if self.inner.was_shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.update_policy_deadline.cancel();
        self.inner.long_idle_deadline.cancel();
        self.inner.hidden_idle_deadline.cancel();
        self.inner.manager.shutdown();
        debug!("renderer scheduler shut down");
    }

    // --- Task runners handed to callers -------------------------------

    #[must_use]
    pub fn default_task_runner(&self) -> QueueTaskRunner {
        self.inner.manager.queue_task_runner(self.inner.queues.default)
    }

    #[must_use]
    pub fn compositor_task_runner(&self) -> QueueTaskRunner {
        self.inner
            .manager
            .queue_task_runner(self.inner.queues.compositor)
    }

    #[must_use]
    pub fn loading_task_runner(&self) -> QueueTaskRunner {
        self.inner.manager.queue_task_runner(self.inner.queues.loading)
    }

    #[must_use]
    pub fn timer_task_runner(&self) -> QueueTaskRunner {
        self.inner.manager.queue_task_runner(self.inner.queues.timer)
    }

    #[must_use]
    pub fn idle_task_runner(&self) -> IdleTaskRunner {
        IdleTaskRunner {
            inner: Arc::clone(&self.inner),
        }
    }

    // --- Frame lifecycle signals --------------------------------------

    /// A new frame is starting: any idle period ends now, before the
    /// frame's tasks run.
    pub fn will_begin_frame(&self, frame_time: TimeTicks, interval: Duration) {
        if self.inner.is_shutdown() {
            return;
        }
        SchedulerInner::end_idle_period(&self.inner);
        self.inner.lock_main().estimated_next_frame_begin = frame_time + interval;
        SchedulerInner::did_process_input_event(&self.inner, Some(frame_time));
    }

    /// The frame was committed; the remainder of the frame interval is an
    /// idle opportunity.
    pub fn did_commit_frame_to_compositor(&self) {
        if self.inner.is_shutdown() {
            return;
        }
        let now = self.inner.clock.now();
        let estimated_next_frame_begin = self.inner.lock_main().estimated_next_frame_begin;
        if now < estimated_next_frame_begin {
            SchedulerInner::start_idle_period(
                &self.inner,
                IdlePeriodState::InShortIdlePeriod,
                estimated_next_frame_begin,
            );
        }
    }

    /// No frames are expected soon: switch to long, self-rearming idle
    /// periods.
    pub fn begin_frame_not_expected_soon(&self) {
        if self.inner.is_shutdown() {
            return;
        }
        SchedulerInner::did_process_input_event(&self.inner, None);
        SchedulerInner::enable_long_idle_period(&self.inner);
    }

    /// Ends any active idle period immediately.
    pub fn end_idle_period(&self) {
        SchedulerInner::end_idle_period(&self.inner);
    }

    // --- Visibility ---------------------------------------------------

    /// A hidden renderer gets a long idle period that self-terminates
    /// after a grace delay, so background tabs do not run idle work
    /// forever.
    pub fn on_renderer_hidden(&self) {
        if self.inner.is_shutdown() {
            return;
        }
        {
            let mut main = self.inner.lock_main();
            if main.renderer_hidden {
                return;
            }
            main.renderer_hidden = true;
        }
        SchedulerInner::enable_long_idle_period(&self.inner);
        let now = self.inner.clock.now();
        self.inner.hidden_idle_deadline.cancel();
        self.inner
            .hidden_idle_deadline
            .set_deadline(now, self.inner.config.end_idle_when_hidden_delay);
        trace!("renderer hidden: {:?}", self.snapshot());
    }

    /// A visible renderer is not idle: cancel the hidden-idle grace timer
    /// and end the idle period.
    pub fn on_renderer_visible(&self) {
        if self.inner.is_shutdown() {
            return;
        }
        {
            let mut main = self.inner.lock_main();
            if !main.renderer_hidden {
                return;
            }
            main.renderer_hidden = false;
        }
        self.inner.hidden_idle_deadline.cancel();
        SchedulerInner::end_idle_period(&self.inner);
        trace!("renderer visible: {:?}", self.snapshot());
    }

    /// Marks the renderer backgrounded for queueing time accounting.
    pub fn set_renderer_backgrounded(&self, backgrounded: bool) {
        if self.inner.is_shutdown() {
            return;
        }
        self.inner.lock_main().renderer_backgrounded = backgrounded;
        let now = self.inner.clock.now();
        self.inner
            .lock_metrics()
            .on_renderer_state_changed(backgrounded, now);
    }

    // --- Input signals (callable from the compositor thread) ----------

    /// Reports an input event received on the compositor thread. Filters
    /// out events that do not signal an interactive burst.
    pub fn did_receive_input_event(&self, event: InputEvent) {
        if !event.is_scheduling_signal() {
            return;
        }
        SchedulerInner::update_for_input_event(&self.inner, event);
    }

    /// The compositor animated in response to input without delivering a
    /// concrete event to the main thread.
    pub fn did_animate_for_input(&self) {
        SchedulerInner::update_for_input_event(&self.inner, InputEvent::Undefined);
    }

    /// Flags the task currently running on the main thread as containing
    /// a nested run loop; the estimator excludes it.
    pub fn on_begin_nested_run_loop(&self) {
        self.inner.lock_metrics().on_begin_nested_run_loop();
    }

    // --- Advisory queries ---------------------------------------------

    /// Whether high-priority work is expected shortly; long-running
    /// callers can use this to schedule around it.
    #[must_use]
    pub fn is_high_priority_work_anticipated(&self) -> bool {
        if self.inner.is_shutdown() {
            return false;
        }
        SchedulerInner::maybe_update_policy(&self.inner);
        self.inner.lock_main().current_policy.is_escalated()
    }

    /// Whether a long-running task should yield now. Control-queue work
    /// never forces a yield; it runs between tasks, not instead of them.
    #[must_use]
    pub fn should_yield_for_high_priority_work(&self) -> bool {
        if self.inner.is_shutdown() {
            return false;
        }
        SchedulerInner::maybe_update_policy(&self.inner);
        let policy = self.inner.lock_main().current_policy;
        match policy {
            Policy::Normal => false,
            Policy::CompositorPriority => {
                !self.inner.manager.is_queue_empty(self.inner.queues.compositor)
            }
            Policy::TouchstartPriority => true,
        }
    }

    /// Whether the active idle period permits deliberately overrunning
    /// its deadline.
    #[must_use]
    pub fn can_exceed_idle_deadline_if_required(&self) -> bool {
        self.inner.lock_idle().period_state.can_exceed_deadline()
    }

    /// Synchronous expected-queueing-time estimate, usable mid-task.
    #[must_use]
    pub fn estimate_queueing_time(&self) -> Duration {
        let now = self.inner.clock.now();
        self.inner
            .lock_metrics()
            .estimate_queueing_time_including_current_task(now)
    }

    // --- Timer suspension ---------------------------------------------

    /// Suspends the timer queue; calls nest.
    pub fn suspend_timer_queue(&self) {
        self.inner.lock_main().timer_queue_suspend_count += 1;
        SchedulerInner::force_update_policy(&self.inner);
        debug_assert!(!self.inner.manager.is_queue_enabled(self.inner.queues.timer));
    }

    /// Resumes the timer queue once the suspension count reaches zero.
    pub fn resume_timer_queue(&self) {
        {
            let mut main = self.inner.lock_main();
            debug_assert!(main.timer_queue_suspend_count > 0);
            main.timer_queue_suspend_count = main.timer_queue_suspend_count.saturating_sub(1);
        }
        SchedulerInner::force_update_policy(&self.inner);
    }

    // --- Introspection ------------------------------------------------

    #[must_use]
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let input_stream_state = self.inner.lock_signals().input_stream_state;
        let (policy, renderer_hidden, estimated_next_frame_begin) = {
            let main = self.inner.lock_main();
            (
                main.current_policy,
                main.renderer_hidden,
                main.estimated_next_frame_begin,
            )
        };
        let idle_period_state = self.inner.lock_idle().period_state;
        SchedulerSnapshot {
            policy,
            idle_period_state,
            input_stream_state,
            renderer_hidden,
            estimated_next_frame_begin,
        }
    }

    #[must_use]
    pub fn current_policy_for_testing(&self) -> Policy {
        self.inner.lock_main().current_policy
    }

    #[must_use]
    pub fn policy_change_count_for_testing(&self) -> u64 {
        self.inner.lock_main().policy_change_count
    }

    #[must_use]
    pub fn input_stream_state_for_testing(&self) -> InputStreamState {
        self.inner.lock_signals().input_stream_state
    }

    #[must_use]
    pub fn idle_period_state_for_testing(&self) -> IdlePeriodState {
        self.inner.lock_idle().period_state
    }

    #[must_use]
    pub fn current_idle_task_deadline_for_testing(&self) -> TimeTicks {
        self.inner.lock_idle().deadline
    }

    #[must_use]
    pub fn manager_for_testing(&self) -> &TaskQueueManager {
        &self.inner.manager
    }

    /// Re-evaluates the policy now, applying queue changes only if the
    /// derived policy differs from the current one.
    pub fn update_policy(&self) {
        SchedulerInner::update_policy(&self.inner);
    }

    /// Re-evaluates the policy immediately on the calling thread.
    pub fn force_update_policy(&self) {
        SchedulerInner::force_update_policy(&self.inner);
    }

    /// Re-evaluates the policy if an urgent update was requested.
    pub fn update_policy_if_needed(&self) {
        SchedulerInner::maybe_update_policy(&self.inner);
    }
}

impl SchedulerInner {
    fn is_shutdown(&self) -> bool {
        self.was_shutdown.load(Ordering::Acquire)
    }

    // --- Input → policy -----------------------------------------------

    fn update_for_input_event(inner: &Arc<Self>, event: InputEvent) {
        let mut signals = inner.lock_signals();
        let new_state = compute_new_input_stream_state(
            signals.input_stream_state,
            event,
            signals.last_input_type,
        );
        if signals.input_stream_state != new_state {
            signals.input_stream_state = new_state;
            Self::ensure_urgent_policy_update_posted(inner);
        }
        signals.last_input_receipt_time = inner.clock.now();
        // An input event is now queued up; the timestamp comes back when
        // the compositor commits or goes quiescent.
        signals.last_input_process_time = None;
        signals.last_input_type = event;
    }

    fn ensure_urgent_policy_update_posted(inner: &Arc<Self>) {
        if !inner.policy_may_need_update.swap(true, Ordering::AcqRel) {
            let handle = Arc::clone(inner);
            inner.manager.post_task(
                inner.queues.control,
                Box::new(move || Self::update_policy(&handle)),
            );
        }
    }

    /// Marks main-thread input processing at `begin_frame_time` (or now).
    /// Input that arrived after the given frame time is still pending.
    fn did_process_input_event(inner: &Arc<Self>, begin_frame_time: Option<TimeTicks>) {
        {
            let mut signals = inner.lock_signals();
            if signals.input_stream_state == InputStreamState::Inactive {
                return;
            }
            if let Some(frame_time) = begin_frame_time
                && frame_time < signals.last_input_receipt_time
            {
                return;
            }
            signals.last_input_process_time = Some(inner.clock.now());
        }
        Self::update_policy(inner);
    }

    fn maybe_update_policy(inner: &Arc<Self>) {
        if inner.policy_may_need_update.load(Ordering::Acquire) {
            Self::update_policy(inner);
        }
    }

    fn update_policy(inner: &Arc<Self>) {
        Self::update_policy_impl(inner, false);
    }

    fn force_update_policy(inner: &Arc<Self>) {
        Self::update_policy_impl(inner, true);
    }

    fn update_policy_impl(inner: &Arc<Self>, force: bool) {
        if inner.is_shutdown() {
            return;
        }
        let mut signals = inner.lock_signals();
        let now = inner.clock.now();
        inner.policy_may_need_update.store(false, Ordering::Release);

        let (new_policy, new_policy_duration) = Self::compute_new_policy(inner, &mut signals, now);
        let mut main = inner.lock_main();
        if new_policy_duration > Duration::ZERO {
            main.policy_expiration_time = Some(now + new_policy_duration);
            inner.update_policy_deadline.set_deadline(now, new_policy_duration);
        } else {
            main.policy_expiration_time = None;
        }

        if !force && new_policy == main.current_policy {
            return;
        }

        match new_policy {
            Policy::CompositorPriority => {
                inner
                    .manager
                    .set_queue_priority(inner.queues.compositor, Priority::High);
                inner
                    .manager
                    .set_queue_priority(inner.queues.loading, Priority::BestEffort);
            }
            Policy::TouchstartPriority => {
                inner
                    .manager
                    .set_queue_priority(inner.queues.compositor, Priority::High);
                inner.manager.disable_queue(inner.queues.loading);
            }
            Policy::Normal => {
                inner
                    .manager
                    .set_queue_priority(inner.queues.compositor, Priority::Normal);
                inner
                    .manager
                    .set_queue_priority(inner.queues.loading, Priority::Normal);
            }
        }
        if main.timer_queue_suspend_count != 0 {
            inner.manager.disable_queue(inner.queues.timer);
        } else {
            inner
                .manager
                .set_queue_priority(inner.queues.timer, Priority::Normal);
        }
        debug_assert!(inner.manager.is_queue_enabled(inner.queues.compositor));

        main.current_policy = new_policy;
        main.policy_change_count += 1;
        trace!(
            "policy changed to {} (input stream {:?})",
            new_policy.as_str(),
            signals.input_stream_state
        );
    }

    /// Derives the policy from the input stream. Resets the stream to
    /// inactive once the escalation window has fully elapsed, so the next
    /// input event posts a fresh urgent update.
    fn compute_new_policy(
        inner: &Arc<Self>,
        signals: &mut IncomingSignals,
        now: TimeTicks,
    ) -> (Policy, Duration) {
        if signals.input_stream_state == InputStreamState::Inactive {
            return (Policy::Normal, Duration::ZERO);
        }
        let input_priority_policy =
            if signals.input_stream_state == InputStreamState::ActiveAwaitingTouchstartResponse {
                Policy::TouchstartPriority
            } else {
                Policy::CompositorPriority
            };
        let time_left = Self::time_left_in_input_escalated_policy(inner, signals, now);
        if time_left > Duration::ZERO {
            (input_priority_policy, time_left)
        } else {
            signals.input_stream_state = InputStreamState::Inactive;
            (Policy::Normal, Duration::ZERO)
        }
    }

    fn time_left_in_input_escalated_policy(
        inner: &Arc<Self>,
        signals: &IncomingSignals,
        now: TimeTicks,
    ) -> Duration {
        debug_assert!(signals.input_stream_state != InputStreamState::Inactive);
        let escalation = inner.config.input_escalation_duration;
        match signals.last_input_process_time {
            // The input event is still pending on the main thread; stay
            // escalated for the full window and check again later.
            None if !inner.manager.is_queue_empty(inner.queues.compositor) => escalation,
            None => (signals.last_input_receipt_time + escalation).duration_since(now),
            Some(process_time) => {
                let baseline = process_time.max(signals.last_input_receipt_time);
                (baseline + escalation).duration_since(now)
            }
        }
    }

    // --- Idle periods -------------------------------------------------

    fn start_idle_period(inner: &Arc<Self>, state: IdlePeriodState, deadline: TimeTicks) {
        debug_assert!(state.is_in_idle_period());
        {
            let mut idle = inner.lock_idle();
            idle.period_state = state;
            idle.deadline = deadline;
        }
        inner
            .manager
            .set_queue_priority(inner.queues.idle, Priority::BestEffort);
        trace!("idle period started ({}) until {:?}", state.as_str(), deadline);
    }

    fn end_idle_period(inner: &Arc<Self>) {
        inner.long_idle_deadline.cancel();
        {
            let mut idle = inner.lock_idle();
            if !idle.period_state.is_in_idle_period() {
                return;
            }
            idle.period_state = IdlePeriodState::NotInIdlePeriod;
        }
        // Disabled synchronously: idle tasks must never run outside a
        // period, even mid-selection.
        inner.manager.disable_queue(inner.queues.idle);
        trace!("idle period ended");
    }

    /// Enters (or re-arms) long idle mode. Under touchstart priority idle
    /// work is forbidden; entry retries when the escalation expires.
    fn enable_long_idle_period(inner: &Arc<Self>) {
        if inner.is_shutdown() {
            return;
        }
        Self::maybe_update_policy(inner);
        let now = inner.clock.now();

        let touchstart_expiration = {
            let main = inner.lock_main();
            if main.current_policy == Policy::TouchstartPriority {
                Some(main.policy_expiration_time)
            } else {
                None
            }
        };
        if let Some(expiration) = touchstart_expiration {
            Self::end_idle_period(inner);
            let retry = expiration
                .map_or(inner.config.input_escalation_duration, |time| {
                    time.duration_since(now)
                })
                .max(inner.config.min_long_idle_period);
            inner.long_idle_deadline.set_deadline(now, retry);
            return;
        }

        let max_period = inner.config.max_idle_period;
        let duration = match inner.manager.next_delayed_task_time() {
            Some(wakeup) => max_period.min(wakeup.duration_since(now)),
            None => max_period,
        };
        if duration >= inner.config.min_long_idle_period {
            let state = if duration == max_period {
                IdlePeriodState::InLongIdlePeriodWithMaxDeadline
            } else {
                IdlePeriodState::InLongIdlePeriod
            };
            Self::start_idle_period(inner, state, now + duration);
            // Re-arm at the deadline; ending the period cancels this.
            inner.long_idle_deadline.set_deadline(now, duration);
        } else {
            // A wakeup is imminent; retry once it has passed.
            Self::end_idle_period(inner);
            inner
                .long_idle_deadline
                .set_deadline(now, duration.max(inner.config.min_long_idle_period));
        }
    }

    fn run_idle_task(inner: &Arc<Self>, task: Box<dyn FnOnce(TimeTicks) + Send>) {
        let deadline = inner.lock_idle().deadline;
        let span = trace_span!("idle_task");
        {
            let _entered = span.enter();
            task(deadline);
        }
        let now = inner.clock.now();
        if now > deadline {
            // Latent bug in the idle task, not in the scheduler; the next
            // selection decision already sees the queue state.
            warn!(
                "idle task overran its deadline by {:?}",
                now.duration_since(deadline)
            );
        }
    }

    // --- Lock helpers (order: signals, main, idle) --------------------

    fn lock_signals(&self) -> MutexGuard<'_, IncomingSignals> {
        self.signals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_main(&self) -> MutexGuard<'_, MainThreadState> {
        self.main.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_idle(&self) -> MutexGuard<'_, IdleState> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_metrics(&self) -> MutexGuard<'_, QueueingTimeEstimator> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        // The scheduler must be shut down explicitly so queued closures
        // holding handles to it have been drained.
        if !thread::panicking() {
            debug_assert!(
                self.was_shutdown.load(Ordering::Acquire),
                "renderer scheduler dropped without shutdown"
            );
        }
    }
}

/// Builds a deadline runner firing on the control queue, holding the
/// scheduler weakly.
fn deadline_callback(
    weak: &Weak<SchedulerInner>,
    control_runner: &QueueTaskRunner,
    callback: fn(Arc<SchedulerInner>),
) -> DeadlineTaskRunner {
    let weak = weak.clone();
    DeadlineTaskRunner::new(
        control_runner.clone(),
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                callback(inner);
            }
        }),
    )
}

/// Posting handle for idle tasks. Idle tasks receive the period deadline
/// they must finish by.
#[derive(Clone)]
pub struct IdleTaskRunner {
    inner: Arc<SchedulerInner>,
}

impl IdleTaskRunner {
    pub fn post_idle_task<F>(&self, task: F)
    where
        F: FnOnce(TimeTicks) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.inner.manager.post_task(
            self.inner.queues.idle,
            Box::new(move || SchedulerInner::run_idle_task(&inner, Box::new(task))),
        );
    }
}

/// Feeds task boundaries into the queueing time estimator, mapping queues
/// to split buckets.
struct MetricsObserver {
    metrics: Arc<Mutex<QueueingTimeEstimator>>,
    queues: SchedulerQueues,
}

impl MetricsObserver {
    fn bucket_for(&self, queue: QueueId) -> SplitBucket {
        if queue == self.queues.default {
            SplitBucket::Default
        } else if queue == self.queues.loading {
            SplitBucket::DefaultLoading
        } else if queue == self.queues.compositor {
            SplitBucket::Compositor
        } else if queue == self.queues.timer {
            SplitBucket::FrameThrottleable
        } else {
            SplitBucket::Other
        }
    }
}

impl TaskObserver for MetricsObserver {
    fn will_process_task(&mut self, queue: QueueId, start_time: TimeTicks) {
        let bucket = self.bucket_for(queue);
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on_top_level_task_started(start_time, bucket);
    }

    fn did_process_task(&mut self, _queue: QueueId, end_time: TimeTicks) {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on_top_level_task_completed(end_time);
    }
}
