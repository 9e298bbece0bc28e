//! Drives one [`Profiler`] through recording windows and periodic reports.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::health::HealthMetrics;
use crate::lock::{LockGuard, ProfilerLock};
use crate::metric::{Metric, MetricScope, MetricType, Trigger};
use crate::profilers::{Profiler, ProfilerKind};
use crate::queue::MessageQueue;
use crate::scheduler::{ProfilerScheduler, RecordFn, ReportFn, SchedulerConfig, DEFAULT_RETRY_INTERVAL};

/// Recording and reporting limits of one profile reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReporterSettings {
    /// Recording time per report after which recording pauses.
    pub max_profile_duration: Duration,
    /// Length of one recording window.
    pub max_span_duration: Duration,
    /// API-triggered recordings per report.
    pub max_span_count: u32,
    /// Period of timer-driven recordings.
    pub span_interval: Duration,
    pub report_interval: Duration,
}

impl ReporterSettings {
    pub fn cpu() -> Self {
        Self {
            max_profile_duration: Duration::from_secs(10),
            max_span_duration: Duration::from_secs(2),
            max_span_count: 30,
            span_interval: Duration::from_secs(16),
            report_interval: Duration::from_secs(120),
        }
    }

    pub fn allocation() -> Self {
        Self {
            max_profile_duration: Duration::from_secs(20),
            max_span_duration: Duration::from_secs(4),
            max_span_count: 30,
            span_interval: Duration::from_secs(16),
            report_interval: Duration::from_secs(120),
        }
    }

    pub fn async_calls() -> Self {
        Self::allocation()
    }

    fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            record_interval: self.span_interval,
            record_duration: self.max_span_duration,
            report_interval: self.report_interval,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// Shared collaborators of every reporter.
#[derive(Clone)]
pub struct ReporterContext {
    pub scope: MetricScope,
    pub queue: Arc<MessageQueue>,
    pub lock: Arc<ProfilerLock>,
    pub auto_profiling: bool,
    pub health: Option<Arc<HealthMetrics>>,
}

struct State {
    started: bool,
    profile_start: Instant,
    profile_duration: Duration,
    span_count: u32,
    span_trigger: Trigger,
    active: Option<RecordingSpan>,
}

struct Inner {
    kind: ProfilerKind,
    settings: ReporterSettings,
    ctx: ReporterContext,
    profiler: Mutex<Box<dyn Profiler>>,
    state: Mutex<State>,
}

/// Owns a profiler, its scheduler and the accumulated profile.
pub struct ProfileReporter {
    inner: Arc<Inner>,
    scheduler: ProfilerScheduler,
}

impl ProfileReporter {
    pub fn new(profiler: Box<dyn Profiler>, settings: ReporterSettings, ctx: ReporterContext) -> Self {
        let inner = Arc::new(Inner {
            kind: profiler.kind(),
            settings,
            ctx,
            profiler: Mutex::new(profiler),
            state: Mutex::new(State {
                started: false,
                profile_start: Instant::now(),
                profile_duration: Duration::ZERO,
                span_count: 0,
                span_trigger: Trigger::Timer,
                active: None,
            }),
        });

        // Timers only hold weak references; the reporter owns the scheduler.
        let weak = Arc::downgrade(&inner);
        let record_fn: RecordFn = Arc::new(move |_duration: Duration, guard: LockGuard| {
            match weak.upgrade() {
                Some(inner) => Inner::record(&inner, guard, false, true).map(|_| ()),
                None => Ok(()),
            }
        });

        let weak = Arc::downgrade(&inner);
        let report_fn: ReportFn = Arc::new(move |guard: LockGuard| {
            if let Some(inner) = weak.upgrade() {
                inner.report(false);
            }
            guard.release();
            Ok(())
        });

        let scheduler = ProfilerScheduler::new(
            settings.scheduler_config(),
            Arc::clone(&inner.ctx.lock),
            Some(record_fn),
            report_fn,
        );

        Self { inner, scheduler }
    }

    pub fn kind(&self) -> ProfilerKind {
        self.inner.kind
    }

    pub fn settings(&self) -> &ReporterSettings {
        &self.inner.settings
    }

    pub fn is_started(&self) -> bool {
        self.inner.state.lock().started
    }

    /// Starts reporting. With auto profiling the record and report timers
    /// run; otherwise recording only happens through [`Self::profile`].
    /// Returns false when the profiler is unavailable.
    pub fn start(&self) -> bool {
        if !self.inner.profiler.lock().available() {
            debug!(profiler = %self.inner.kind, "profiler not available");
            return false;
        }

        {
            let mut state = self.inner.state.lock();
            if state.started {
                return true;
            }
            state.started = true;
        }

        self.inner.reset();

        if self.inner.ctx.auto_profiling {
            self.scheduler.start();
        }

        info!(profiler = %self.inner.kind, "profile reporter started");
        true
    }

    /// Stops the timers and closes an open recording window.
    pub fn stop(&self) {
        let active = {
            let mut state = self.inner.state.lock();
            if !state.started {
                return;
            }
            state.started = false;
            state.active.take()
        };

        self.scheduler.stop();

        if let Some(span) = active {
            span.stop();
        }

        info!(profiler = %self.inner.kind, "profile reporter stopped");
    }

    /// Discards the collected profile and restarts the report clock.
    pub fn reset(&self) {
        self.inner.reset();
    }

    /// Opens a recording window if limits and the shared lock allow it.
    ///
    /// `api_call` marks the next report as API triggered and counts against
    /// the span budget. `with_timeout` closes the window automatically after
    /// `max_span_duration`.
    pub fn profile(&self, api_call: bool, with_timeout: bool) -> Option<RecordingSpan> {
        if !self.inner.admit(api_call) {
            return None;
        }

        let Some(guard) = self.inner.ctx.lock.try_acquire() else {
            debug!(profiler = %self.inner.kind, "profiler lock held, skipping recording");
            return None;
        };

        match Inner::record(&self.inner, guard, api_call, with_timeout) {
            Ok(span) => span,
            Err(e) => {
                error!(profiler = %self.inner.kind, error = %e, "failed to start recording");
                None
            }
        }
    }

    /// Builds and enqueues the collected profile, then resets.
    ///
    /// With `with_interval` nothing is reported until a full report interval
    /// has passed since the last reset, and a profile older than two
    /// intervals is discarded instead.
    pub fn report(&self, with_interval: bool) {
        self.inner.report(with_interval);
    }

    /// Accumulated recording time since the last reset.
    pub fn profile_duration(&self) -> Duration {
        self.inner.state.lock().profile_duration
    }

    pub fn span_count(&self) -> u32 {
        self.inner.state.lock().span_count
    }
}

impl Drop for ProfileReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn admit(&self, api_call: bool) -> bool {
        let state = self.state.lock();
        if !state.started {
            return false;
        }

        if state.profile_duration > self.settings.max_profile_duration {
            debug!(profiler = %self.kind, "max profiling duration reached");
            return false;
        }

        if api_call && state.span_count > self.settings.max_span_count {
            debug!(profiler = %self.kind, "max recording count reached");
            return false;
        }

        true
    }

    /// Starts the profiler under an already acquired `guard`. Refusals and
    /// failures release the guard by dropping it.
    fn record(
        inner: &Arc<Self>,
        guard: LockGuard,
        api_call: bool,
        with_timeout: bool,
    ) -> Result<Option<RecordingSpan>> {
        if !inner.admit(api_call) {
            return Ok(None);
        }

        inner
            .profiler
            .lock()
            .start_profiler()
            .with_context(|| format!("starting {} profiler", inner.kind))?;

        let span = RecordingSpan {
            shared: Arc::new(SpanShared {
                reporter: Arc::downgrade(inner),
                guard: Mutex::new(Some(guard)),
                started_at: Instant::now(),
                stopped: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        };

        {
            let mut state = inner.state.lock();
            state.span_count += 1;
            if api_call {
                state.span_trigger = Trigger::Api;
            }
            state.active = Some(span.clone());
        }

        if let Some(health) = &inner.ctx.health {
            health.recordings.with_label_values(&[inner.kind.as_str()]).inc();
        }

        if with_timeout {
            span.spawn_timeout(inner.settings.max_span_duration);
        }

        debug!(profiler = %inner.kind, api_call, "recording started");

        Ok(Some(span))
    }

    fn reset(&self) {
        self.profiler.lock().reset();

        let mut state = self.state.lock();
        state.profile_start = Instant::now();
        state.profile_duration = Duration::ZERO;
        state.span_count = 0;
        state.span_trigger = Trigger::Timer;
    }

    fn report(&self, with_interval: bool) {
        let (duration, trigger) = {
            let state = self.state.lock();
            if !state.started {
                return;
            }

            if with_interval {
                let age = state.profile_start.elapsed();
                if age < self.settings.report_interval {
                    return;
                }

                if age > self.settings.report_interval * 2 {
                    drop(state);
                    debug!(profiler = %self.kind, "profile too old, discarding");
                    self.reset();
                    return;
                }
            }

            if state.profile_duration.is_zero() {
                return;
            }

            (state.profile_duration, state.span_trigger)
        };

        let data = self.profiler.lock().build_profile(duration);

        for d in data {
            let mut metric = Metric::new(&self.ctx.scope, MetricType::Profile, d.category, d.name, d.unit);
            metric.create_measurement(trigger, d.profile.measurement, d.unit_interval, Some(d.profile));
            self.ctx.queue.add("metric", metric.to_json());
        }

        if let Some(health) = &self.ctx.health {
            health.profiles_reported.with_label_values(&[self.kind.as_str()]).inc();
        }

        info!(profiler = %self.kind, duration = ?duration, "reported profile");

        self.reset();
    }

    fn finish_span(&self, elapsed: Duration) {
        {
            let mut state = self.state.lock();
            state.profile_duration += elapsed;
            state.active = None;
        }

        if let Err(e) = self.profiler.lock().stop_profiler() {
            warn!(profiler = %self.kind, error = %e, "failed to stop profiler");
        }
    }
}

struct SpanShared {
    reporter: Weak<Inner>,
    guard: Mutex<Option<LockGuard>>,
    started_at: Instant,
    stopped: AtomicBool,
    cancel: CancellationToken,
}

/// Handle to an open recording window.
///
/// Stopping is idempotent: the first call commits the elapsed time and the
/// collected data, then releases the profiler lock.
#[derive(Clone)]
pub struct RecordingSpan {
    shared: Arc<SpanShared>,
}

impl RecordingSpan {
    pub fn stop(&self) {
        let shared = &self.shared;
        if shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        shared.cancel.cancel();

        if let Some(reporter) = shared.reporter.upgrade() {
            reporter.finish_span(shared.started_at.elapsed());
            debug!(profiler = %reporter.kind, "recording stopped");
        }

        if let Some(guard) = shared.guard.lock().take() {
            guard.release();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    fn spawn_timeout(&self, after: Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no runtime for recording timeout, span must be stopped explicitly");
            return;
        };

        let span = self.clone();
        let cancel = self.shared.cancel.clone();
        handle.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(after) => span.stop(),
            }
        });
    }
}
