pub mod remote;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::ApiClient;
use crate::config::Config;
use crate::health::HealthMetrics;
use crate::lock::ProfilerLock;
use crate::profilers::allocation::AllocationProfiler;
use crate::profilers::causality::{AsyncProfiler, AsyncSampler, BacktraceCapture, StackCapture};
use crate::profilers::cpu::CpuProfiler;
use crate::profilers::native::NativeSampler;
use crate::profilers::{Profiler, ProfilerKind};
use crate::queue::MessageQueue;
use crate::reporters::{
    ErrorReporter, ProcessReporter, ProcessStats, ProcfsStats, ProfileReporter, RecordingSpan,
    ReporterContext, ReporterSettings, SpanReporter,
};

use self::remote::{ConfigLoader, RemoteConfig};

/// Span name used when the caller gives none.
const DEFAULT_SPAN_NAME: &str = "Default";

/// Host integrations the agent samples through.
#[derive(Clone)]
pub struct Collaborators {
    pub native: Arc<dyn NativeSampler>,
    pub process_stats: Arc<dyn ProcessStats>,
    pub stack_capture: Arc<dyn StackCapture>,
}

impl Collaborators {
    /// procfs statistics and std backtraces around the given native sampler.
    pub fn new(native: Arc<dyn NativeSampler>) -> Self {
        Self {
            native,
            process_stats: Arc::new(ProcfsStats),
            stack_capture: Arc::new(BacktraceCapture),
        }
    }
}

#[derive(Default)]
struct State {
    started: bool,
    destroyed: bool,
    remote: RemoteConfig,
    is_profiling: bool,
    manual_span: Option<(ProfilerKind, RecordingSpan)>,
}

struct Inner {
    cfg: Config,
    health: Arc<HealthMetrics>,
    client: ApiClient,
    queue: Arc<MessageQueue>,
    async_sampler: Arc<AsyncSampler>,
    profile_reporters: Vec<ProfileReporter>,
    span_reporter: SpanReporter,
    process_reporter: Option<ProcessReporter>,
    error_reporter: Option<ErrorReporter>,
    loader: ConfigLoader,
    state: Mutex<State>,
    cancel: CancellationToken,
}

/// Agent orchestrates the reporters, the remote switches and message upload.
pub struct Agent {
    inner: Arc<Inner>,
}

impl Agent {
    /// Creates an agent sampling through `native`, with procfs process
    /// statistics and std backtraces for causality stacks.
    pub fn new(cfg: Config, native: Arc<dyn NativeSampler>) -> Result<Self> {
        Self::with_collaborators(cfg, Collaborators::new(native))
    }

    pub fn with_collaborators(cfg: Config, parts: Collaborators) -> Result<Self> {
        cfg.validate().context("validating config")?;

        let health = Arc::new(HealthMetrics::new().context("creating health metrics")?);
        let client = ApiClient::new(&cfg).context("creating collector client")?;
        let queue = Arc::new(MessageQueue::new(cfg.queue_config()).with_health(Arc::clone(&health)));

        let ctx = ReporterContext {
            scope: cfg.metric_scope(),
            queue: Arc::clone(&queue),
            lock: ProfilerLock::new(),
            auto_profiling: cfg.auto_profiling,
            health: Some(Arc::clone(&health)),
        };

        let async_sampler = Arc::new(
            AsyncSampler::new(Arc::clone(&parts.stack_capture)).with_health(Arc::clone(&health)),
        );

        let include_agent_frames = cfg.include_agent_frames;
        let candidates: [(bool, Box<dyn Profiler>, ReporterSettings); 3] = [
            (
                cfg.cpu.enabled,
                Box::new(CpuProfiler::new(Arc::clone(&parts.native), include_agent_frames)),
                cfg.cpu.resolve(ReporterSettings::cpu()),
            ),
            (
                cfg.allocation.enabled,
                Box::new(AllocationProfiler::new(
                    Arc::clone(&parts.native),
                    include_agent_frames,
                )),
                cfg.allocation.resolve(ReporterSettings::allocation()),
            ),
            (
                cfg.async_calls.enabled,
                Box::new(AsyncProfiler::new(Arc::clone(&async_sampler), include_agent_frames)),
                cfg.async_calls.resolve(ReporterSettings::async_calls()),
            ),
        ];

        let profile_reporters = candidates
            .into_iter()
            .filter(|(enabled, _, _)| *enabled)
            .map(|(_, profiler, settings)| ProfileReporter::new(profiler, settings, ctx.clone()))
            .collect();

        let span_reporter = SpanReporter::new(ctx.clone(), cfg.metrics_interval);
        let process_reporter = cfg.process_metrics.then(|| {
            ProcessReporter::new(ctx.clone(), cfg.metrics_interval, Arc::clone(&parts.process_stats))
        });
        let error_reporter = cfg.error_profile.then(|| {
            ErrorReporter::new(ctx.clone(), cfg.metrics_interval, Arc::clone(&parts.stack_capture))
        });

        let loader = ConfigLoader::new(cfg.remote_config.clone(), cfg.auto_profiling)
            .with_health(Arc::clone(&health));

        Ok(Self {
            inner: Arc::new(Inner {
                cfg,
                health,
                client,
                queue,
                async_sampler,
                profile_reporters,
                span_reporter,
                process_reporter,
                error_reporter,
                loader,
                state: Mutex::new(State::default()),
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Starts the background tasks. Reporters stay off until the collector
    /// enables the agent or [`Agent::enable`] is called.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                warn!("destroyed agent cannot be started");
                return Ok(());
            }
            if state.started {
                return Ok(());
            }
            state.started = true;
        }

        if let Some(addr) = &self.inner.cfg.health.addr {
            self.inner
                .health
                .start(addr)
                .await
                .context("starting health metrics server")?;
        }

        self.inner.queue.reset();

        if self.inner.cfg.auto_profiling {
            self.spawn_config_loader();
            self.spawn_flusher();
        }
        self.spawn_expirer();

        info!(
            app_name = %self.inner.cfg.app_name,
            run_id = %self.inner.client.run_id(),
            auto_profiling = self.inner.cfg.auto_profiling,
            "agent started",
        );

        Ok(())
    }

    /// Stops every reporter and background task. The agent cannot be
    /// restarted afterwards.
    pub fn destroy(&self) {
        {
            let mut state = self.inner.state.lock();
            if !state.started {
                debug!("agent has not been started");
                return;
            }
            if state.destroyed {
                return;
            }
            state.destroyed = true;
        }

        self.inner.cancel.cancel();
        self.inner.stop_all();
        self.inner.health.stop();

        info!("agent destroyed");
    }

    /// Switches the agent on locally, starting every reporter.
    pub fn enable(&self) {
        let mut state = self.inner.state.lock();
        if !state.remote.agent_enabled {
            state.remote.agent_enabled = true;
            drop(state);
            self.inner.start_all();
        }
    }

    pub fn disable(&self) {
        let mut state = self.inner.state.lock();
        if state.remote.agent_enabled {
            state.remote.agent_enabled = false;
            drop(state);
            self.inner.stop_all();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.state.lock().remote.agent_enabled
    }

    /// Times an application span and, when profiling is active, records a
    /// profile of a random running profiler over it.
    pub fn profile(&self, name: Option<&str>) -> ProfileSpan {
        let name = name.unwrap_or(DEFAULT_SPAN_NAME).to_string();

        let remote = {
            let mut state = self.inner.state.lock();
            if !state.started || state.destroyed || state.is_profiling {
                return ProfileSpan::noop(name);
            }
            state.is_profiling = true;
            state.remote
        };

        let mut recording = None;
        if remote.profiling_active() {
            let running: Vec<&ProfileReporter> = self
                .inner
                .profile_reporters
                .iter()
                .filter(|r| r.is_started())
                .collect();

            if !running.is_empty() {
                let pick = rand::thread_rng().gen_range(0..running.len());
                recording = running[pick].profile(true, true);
            }
        }

        ProfileSpan {
            agent: Some(Arc::clone(&self.inner)),
            recording,
            name,
            started_at: Instant::now(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Starts a manual recording of `kind`. Only with auto profiling off and
    /// while no other manual recording runs.
    pub fn start_profiler(&self, kind: ProfilerKind) {
        let mut state = self.inner.state.lock();
        if !state.started || self.inner.cfg.auto_profiling || state.manual_span.is_some() {
            return;
        }

        let Some(reporter) = self.inner.reporter(kind) else {
            debug!(profiler = %kind, "profiler disabled");
            return;
        };

        state.is_profiling = true;
        reporter.start();
        match reporter.profile(true, false) {
            Some(span) => state.manual_span = Some((kind, span)),
            None => state.is_profiling = false,
        }
    }

    /// Ends the manual recording of `kind`, reports it and uploads.
    pub async fn stop_profiler(&self, kind: ProfilerKind) -> Result<()> {
        let span = {
            let mut state = self.inner.state.lock();
            if !state.started || self.inner.cfg.auto_profiling {
                return Ok(());
            }

            match state.manual_span.take() {
                Some((active, span)) if active == kind => {
                    state.is_profiling = false;
                    span
                }
                other => {
                    state.manual_span = other;
                    return Ok(());
                }
            }
        };

        span.stop();
        if let Some(reporter) = self.inner.reporter(kind) {
            reporter.report(false);
            reporter.stop();
        }

        self.inner.queue.flush(&self.inner.client).await
    }

    /// Manual-mode reporting: reports profiles due, refreshes the remote
    /// switches and uploads. A no-op with auto profiling.
    pub async fn report(&self) -> Result<()> {
        if self.inner.cfg.auto_profiling {
            return Ok(());
        }

        for reporter in &self.inner.profile_reporters {
            reporter.report(true);
        }

        if let Err(e) = self.inner.load_remote_config().await {
            error!(error = %e, "refreshing remote config failed");
        }

        self.inner.queue.flush(&self.inner.client).await
    }

    /// Receiver of async lifecycle events for hook providers.
    pub fn async_sampler(&self) -> Arc<AsyncSampler> {
        Arc::clone(&self.inner.async_sampler)
    }

    /// Counts an application error into the error profile.
    pub fn record_error(&self, frames: &[String], message: Option<&str>) {
        if let Some(reporter) = &self.inner.error_reporter {
            reporter.record_error(frames, message);
        }
    }

    pub fn health(&self) -> Arc<HealthMetrics> {
        Arc::clone(&self.inner.health)
    }

    pub fn queue(&self) -> Arc<MessageQueue> {
        Arc::clone(&self.inner.queue)
    }

    /// Fetches and applies the remote switches once.
    pub async fn load_remote_config(&self) -> Result<()> {
        self.inner.load_remote_config().await
    }

    /// Uploads queued messages now.
    pub async fn flush(&self) -> Result<()> {
        self.inner.queue.flush(&self.inner.client).await
    }

    fn spawn_config_loader(&self) {
        let inner = Arc::clone(&self.inner);
        let cancel = self.inner.cancel.clone();
        let delay = self.inner.loader.load_delay();
        let period = self.inner.loader.load_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = inner.load_remote_config().await {
                            debug!(error = %e, "remote config unchanged");
                        }
                    }
                }
            }
        });
    }

    fn spawn_flusher(&self) {
        let inner = Arc::clone(&self.inner);
        let cancel = self.inner.cancel.clone();
        let period = self.inner.cfg.queue.flush_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = inner.queue.flush(&inner.client).await {
                            debug!(error = %e, "flush failed");
                        }
                    }
                }
            }
        });
    }

    fn spawn_expirer(&self) {
        let queue = Arc::clone(&self.inner.queue);
        let cancel = self.inner.cancel.clone();
        let period = self.inner.cfg.queue.expire_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => queue.expire(),
                }
            }
        });
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl Inner {
    fn reporter(&self, kind: ProfilerKind) -> Option<&ProfileReporter> {
        self.profile_reporters.iter().find(|r| r.kind() == kind)
    }

    async fn load_remote_config(&self) -> Result<()> {
        if let Some(remote) = self.loader.load(&self.client).await? {
            self.apply_remote_config(remote);
        }
        Ok(())
    }

    fn apply_remote_config(&self, remote: RemoteConfig) {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.remote = remote;
        }

        if remote.profiling_active() {
            self.start_profiling();
        } else {
            self.stop_profiling();
        }

        if remote.agent_enabled {
            self.start_monitoring();
            info!("agent activated");
        } else {
            self.stop_monitoring();
            info!("agent deactivated");
        }
    }

    fn start_profiling(&self) {
        for reporter in &self.profile_reporters {
            reporter.start();
        }
        self.span_reporter.start();
    }

    fn stop_profiling(&self) {
        for reporter in &self.profile_reporters {
            reporter.stop();
        }
        self.span_reporter.stop();
    }

    fn start_monitoring(&self) {
        if let Some(reporter) = &self.error_reporter {
            reporter.start();
        }
        if let Some(reporter) = &self.process_reporter {
            reporter.start();
        }
    }

    fn stop_monitoring(&self) {
        if let Some(reporter) = &self.error_reporter {
            reporter.stop();
        }
        if let Some(reporter) = &self.process_reporter {
            reporter.stop();
        }
    }

    fn start_all(&self) {
        self.start_profiling();
        self.start_monitoring();
    }

    fn stop_all(&self) {
        self.stop_profiling();
        self.stop_monitoring();
    }
}

/// Handle returned by [`Agent::profile`]. Stopping records the span
/// duration and closes the attached recording, once.
pub struct ProfileSpan {
    agent: Option<Arc<Inner>>,
    recording: Option<RecordingSpan>,
    name: String,
    started_at: Instant,
    stopped: AtomicBool,
}

impl ProfileSpan {
    fn noop(name: String) -> Self {
        Self {
            agent: None,
            recording: None,
            name,
            started_at: Instant::now(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a profiler recording is attached to this span.
    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(recording) = &self.recording {
            recording.stop();
        }

        let Some(agent) = &self.agent else {
            return;
        };

        let elapsed: Duration = self.started_at.elapsed();
        agent
            .span_reporter
            .record_span(&self.name, elapsed.as_secs_f64() * 1000.0);
        agent.state.lock().is_profiling = false;
    }
}

impl Drop for ProfileSpan {
    fn drop(&mut self) {
        self.stop();
    }
}
