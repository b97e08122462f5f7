//! Expected queueing time (EQT) estimation.
//!
//! EQT answers: if a task were posted at a uniformly random moment, how
//! long would it wait before running? Time is divided into fixed steps
//! (`window_duration / steps_per_window`); each observed task spreads its
//! instantaneous-queueing-delay sawtooth over the steps it overlaps, and a
//! window's EQT is the mean of its steps. The sliding window reports on
//! every completed step; every `steps_per_window`-th completed step also
//! closes a disjoint window, which additionally reports a per-queue-class
//! breakdown whose sum equals the aggregate exactly.
//!
//! Advancement is lazy: nothing drives the windows except the timestamps
//! observed at task boundaries.

use core::mem;
use core::time::Duration;
use std::collections::VecDeque;

use task_queue::TimeTicks;

/// A single task longer than this is treated as a measurement artifact
/// (e.g. the machine slept mid-task) and contributes nothing.
const INVALID_TASK_CEILING: Duration = Duration::from_secs(30);

/// Write-only sink for windowed EQT reports.
pub trait QueueingTimeClient: Send {
    /// One report per completed step: the EQT of the window ending at that
    /// step. `is_disjoint_window` is true on the reports that close a
    /// non-overlapping window.
    fn on_queueing_time_for_window_estimated(
        &mut self,
        queueing_time: Duration,
        is_disjoint_window: bool,
    );

    /// Per-queue-class breakdown, reported once per disjoint window for
    /// every class (zeros included).
    fn on_report_split_expected_queueing_time(
        &mut self,
        label: &'static str,
        queueing_time: Duration,
    );
}

/// Queue classes the split EQT is broken down by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum SplitBucket {
    Default = 0,
    DefaultLoading = 1,
    FrameLoading = 2,
    FrameThrottleable = 3,
    FramePausable = 4,
    Unthrottled = 5,
    Compositor = 6,
    /// Everything else, including control and idle work.
    Other = 7,
}

const BUCKET_COUNT: usize = 8;

impl SplitBucket {
    pub const ALL: [Self; BUCKET_COUNT] = [
        Self::Default,
        Self::DefaultLoading,
        Self::FrameLoading,
        Self::FrameThrottleable,
        Self::FramePausable,
        Self::Unthrottled,
        Self::Compositor,
        Self::Other,
    ];

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::DefaultLoading => "default-loading",
            Self::FrameLoading => "frame-loading",
            Self::FrameThrottleable => "frame-throttleable",
            Self::FramePausable => "frame-pausable",
            Self::Unthrottled => "unthrottled",
            Self::Compositor => "compositor",
            Self::Other => "other",
        }
    }
}

/// Per-step accumulation, in microseconds, one slot per bucket.
type StepBuckets = [f64; BUCKET_COUNT];

struct TaskSpan {
    start: TimeTicks,
    end: TimeTicks,
    bucket: SplitBucket,
}

/// EQT contribution of a task to one step: the probability that a random
/// instant of the step falls inside the task, times the expected remaining
/// wait at such an instant. This reproduces the area under the sawtooth of
/// instantaneous queueing delay.
fn expected_queueing_time_from_task(
    span: &TaskSpan,
    step_start: TimeTicks,
    step_end: TimeTicks,
) -> f64 {
    let overlap_start = span.start.max(step_start);
    let overlap_end = span.end.min(step_end);
    if overlap_end <= overlap_start {
        return 0.0;
    }
    let overlap = duration_micros(overlap_end.duration_since(overlap_start));
    let step_span = duration_micros(step_end.duration_since(step_start));
    let probability = overlap / step_span;
    let wait_at_overlap_start = duration_micros(span.end.duration_since(overlap_start));
    let wait_at_overlap_end = duration_micros(span.end.duration_since(overlap_end));
    probability * (wait_at_overlap_start + wait_at_overlap_end) / 2.0
}

fn duration_micros(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1_000_000.0
}

fn micros_to_duration(micros: f64) -> Duration {
    Duration::from_micros(micros.round() as u64)
}

#[derive(Clone)]
struct State {
    step_duration: Duration,
    steps_per_window: usize,
    step_start_time: Option<TimeTicks>,
    current_task: Option<(TimeTicks, SplitBucket)>,
    in_nested_run_loop: bool,
    current_step: StepBuckets,
    /// Newest-last EQTs of the most recent surviving steps, at most
    /// `steps_per_window` of them.
    recent_steps: VecDeque<StepBuckets>,
    /// Surviving steps completed so far; drives the disjoint cadence.
    steps_completed: u64,
    backgrounded: bool,
    /// Backgrounded spans not yet strictly before the step cursor; an open
    /// span has no end.
    backgrounded_intervals: Vec<(TimeTicks, Option<TimeTicks>)>,
}

impl State {
    fn new(window_duration: Duration, steps_per_window: usize) -> Self {
        let steps = steps_per_window.max(1);
        Self {
            step_duration: window_duration / steps as u32,
            steps_per_window: steps,
            step_start_time: None,
            current_task: None,
            in_nested_run_loop: false,
            current_step: [0.0; BUCKET_COUNT],
            recent_steps: VecDeque::new(),
            steps_completed: 0,
            backgrounded: false,
            backgrounded_intervals: Vec::new(),
        }
    }

    fn on_task_started(
        &mut self,
        client: &mut dyn QueueingTimeClient,
        start: TimeTicks,
        bucket: SplitBucket,
    ) {
        if self.step_start_time.is_none() {
            self.step_start_time = Some(start);
        }
        self.advance_time(client, start, None);
        self.current_task = Some((start, bucket));
    }

    fn on_task_completed(&mut self, client: &mut dyn QueueingTimeClient, end: TimeTicks) {
        let Some((start, bucket)) = self.current_task.take() else {
            debug_assert!(false, "task completed without a matching start");
            return;
        };
        if self.in_nested_run_loop {
            // Nested loops can run arbitrarily long without hurting
            // responsiveness; the whole interval becomes invisible and the
            // step grid restarts at the end.
            self.in_nested_run_loop = false;
            self.reset_grid(end);
            return;
        }
        if end.duration_since(start) > INVALID_TASK_CEILING {
            // Likely a suspend/resume artifact. Drop the task but let wall
            // time roll the windows forward normally.
            self.advance_time(client, end, None);
            return;
        }
        let span = TaskSpan { start, end, bucket };
        self.advance_time(client, end, Some(&span));
    }

    fn on_renderer_state_changed(&mut self, backgrounded: bool, now: TimeTicks) {
        if self.backgrounded == backgrounded {
            return;
        }
        self.backgrounded = backgrounded;
        if backgrounded {
            self.backgrounded_intervals.push((now, None));
        } else if let Some(open) = self.backgrounded_intervals.last_mut() {
            open.1 = Some(now);
        }
    }

    /// Rolls the step cursor forward to `now`, apportioning `task` (if
    /// present) to every step it overlaps and reporting each completed
    /// step.
    fn advance_time(
        &mut self,
        client: &mut dyn QueueingTimeClient,
        now: TimeTicks,
        task: Option<&TaskSpan>,
    ) {
        let Some(mut step_start) = self.step_start_time else {
            return;
        };
        while now >= step_start + self.step_duration {
            let step_end = step_start + self.step_duration;
            if let Some(span) = task {
                self.current_step[span.bucket as usize] +=
                    expected_queueing_time_from_task(span, step_start, step_end);
            }
            self.finish_step(client, step_start, step_end);
            step_start = step_end;
            self.step_start_time = Some(step_start);
        }
        if let Some(span) = task {
            // Remainder of the task inside the unfinished step.
            self.current_step[span.bucket as usize] +=
                expected_queueing_time_from_task(span, step_start, step_start + self.step_duration);
        }
    }

    fn finish_step(
        &mut self,
        client: &mut dyn QueueingTimeClient,
        step_start: TimeTicks,
        step_end: TimeTicks,
    ) {
        let step_values = mem::replace(&mut self.current_step, [0.0; BUCKET_COUNT]);
        let excluded = self.overlaps_backgrounding(step_start, step_end);
        self.backgrounded_intervals
            .retain(|(_, end)| end.is_none_or(|interval_end| interval_end > step_end));
        if excluded {
            // A step touched by backgrounding drops out of the sequence
            // entirely; windows slide over the surviving steps.
            return;
        }
        self.recent_steps.push_back(step_values);
        if self.recent_steps.len() > self.steps_per_window {
            self.recent_steps.pop_front();
        }
        self.steps_completed += 1;
        let is_disjoint = self.steps_completed % self.steps_per_window as u64 == 0;

        let bucket_durations = self.window_bucket_durations();
        let total: Duration = bucket_durations.iter().sum();
        client.on_queueing_time_for_window_estimated(total, is_disjoint);
        if is_disjoint {
            for (bucket, duration) in SplitBucket::ALL.iter().zip(bucket_durations) {
                client.on_report_split_expected_queueing_time(bucket.label(), duration);
            }
        }
    }

    /// Window EQT per bucket: mean over `steps_per_window` steps (missing
    /// steps count as zero). The aggregate is always derived from these,
    /// which makes the split-sum invariant hold by construction.
    fn window_bucket_durations(&self) -> [Duration; BUCKET_COUNT] {
        let mut sums = [0.0; BUCKET_COUNT];
        for step in &self.recent_steps {
            for (sum, value) in sums.iter_mut().zip(step) {
                *sum += value;
            }
        }
        sums.map(|sum| micros_to_duration(sum / self.steps_per_window as f64))
    }

    fn window_total_micros(&self) -> f64 {
        let sum: f64 = self.recent_steps.iter().flatten().sum();
        sum / self.steps_per_window as f64
    }

    fn overlaps_backgrounding(&self, step_start: TimeTicks, step_end: TimeTicks) -> bool {
        self.backgrounded_intervals.iter().any(|(start, end)| {
            *start < step_end && end.is_none_or(|interval_end| interval_end > step_start)
        })
    }

    fn reset_grid(&mut self, start: TimeTicks) {
        self.step_start_time = Some(start);
        self.current_step = [0.0; BUCKET_COUNT];
        self.recent_steps.clear();
        self.steps_completed = 0;
    }
}

/// Sink that discards reports, used for virtual advances.
struct NullClient;

impl QueueingTimeClient for NullClient {
    fn on_queueing_time_for_window_estimated(&mut self, _queueing_time: Duration, _: bool) {}
    fn on_report_split_expected_queueing_time(&mut self, _label: &'static str, _: Duration) {}
}

/// Sliding-window expected-queueing-time estimator fed by task boundaries.
pub struct QueueingTimeEstimator {
    client: Box<dyn QueueingTimeClient>,
    state: State,
}

impl QueueingTimeEstimator {
    #[must_use]
    pub fn new(
        client: Box<dyn QueueingTimeClient>,
        window_duration: Duration,
        steps_per_window: usize,
    ) -> Self {
        Self {
            client,
            state: State::new(window_duration, steps_per_window),
        }
    }

    /// Records the start of a top-level task on the main thread.
    pub fn on_top_level_task_started(&mut self, start: TimeTicks, bucket: SplitBucket) {
        self.state
            .on_task_started(self.client.as_mut(), start, bucket);
    }

    /// Records the end of the task opened by the last
    /// [`QueueingTimeEstimator::on_top_level_task_started`].
    pub fn on_top_level_task_completed(&mut self, end: TimeTicks) {
        self.state.on_task_completed(self.client.as_mut(), end);
    }

    /// Flags the current task as containing a nested run loop; it will be
    /// excluded from accumulation entirely.
    pub fn on_begin_nested_run_loop(&mut self) {
        self.state.in_nested_run_loop = true;
    }

    /// Marks the renderer backgrounded or foregrounded. Steps overlapping
    /// a backgrounded span are never reported.
    pub fn on_renderer_state_changed(&mut self, backgrounded: bool, now: TimeTicks) {
        self.state.on_renderer_state_changed(backgrounded, now);
    }

    /// Synchronous estimate usable mid-task: the in-flight task is treated
    /// as if it completed at `now`, and the result is the larger of the
    /// latest full window and the partial window including that task. With
    /// no task open, returns the most recently completed window's value.
    #[must_use]
    pub fn estimate_queueing_time_including_current_task(&self, now: TimeTicks) -> Duration {
        let mut temporary = self.state.clone();
        if temporary.current_task.is_none() {
            return micros_to_duration(temporary.window_total_micros());
        }
        let mut null_client = NullClient;
        temporary.on_task_completed(&mut null_client, now);

        let full_window = temporary.window_total_micros();
        let newest_full_steps: f64 = temporary
            .recent_steps
            .iter()
            .rev()
            .take(temporary.steps_per_window - 1)
            .flatten()
            .sum();
        let unfinished_step: f64 = temporary.current_step.iter().sum();
        let partial_window =
            (newest_full_steps + unfinished_step) / temporary.steps_per_window as f64;

        micros_to_duration(full_window.max(partial_window))
    }
}
