//! Async causality reconstruction.
//!
//! A hook provider reports async resource lifecycle events to an
//! [`AsyncSampler`]: `init` when a resource is created (capturing the creating
//! call stack) and `before` when its callback is about to run. While a
//! recording window is open every created resource becomes a [`Sample`]; the
//! time between `init` and the first `before` is the resource's wait time.
//!
//! At window end the [`AsyncProfiler`] rebuilds, for every completed sample,
//! the chain of resources that transitively triggered it, merges their stacks
//! into one frame path and attributes the wait time to that path in two
//! trees: a rate profile (sum of wait time per second of recording) and a
//! trace (95th percentile wait time per path).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::breakdown::{Breakdown, BreakdownType};
use crate::health::HealthMetrics;
use crate::metric::{
    CATEGORY_ASYNC_PROFILE, CATEGORY_ASYNC_TRACE, NAME_ASYNC_CALL_TIMES, UNIT_MILLISECOND,
};

use super::{is_agent_frame, ProfileData, Profiler, ProfilerKind};

/// Samples held per recording window before further inits are dropped.
pub const SAMPLE_LIMIT: usize = 500;

/// Frame path length after which chain walking stops.
pub const MAX_FRAMES: usize = 50;

/// Resource types never attributed.
pub const EXCLUDED_RESOURCE_TYPES: [&str; 5] =
    ["TIMERWRAP", "Timeout", "Immediate", "TickObject", "PROMISE"];

const RESOURCE_METADATA_KEY: &str = "Resource";

/// One frame of a captured call stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallSite {
    pub function_name: Option<String>,
    pub method_name: Option<String>,
    pub file_name: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl CallSite {
    pub fn new(function_name: &str, file_name: &str, line: u32, column: u32) -> Self {
        Self {
            function_name: Some(function_name.to_string()),
            method_name: None,
            file_name: Some(file_name.to_string()),
            line: Some(line),
            column: Some(column),
        }
    }

    /// `func [as method] (file:line:col)`; empty when nothing is known.
    pub fn label(&self) -> String {
        let mut frame = self.function_name.clone().unwrap_or_default();

        if let Some(method) = &self.method_name {
            frame.push_str(&format!(" [as {method}]"));
        }

        if let Some(file) = &self.file_name {
            frame.push_str(&format!(
                " ({}:{}:{})",
                file,
                self.line.unwrap_or(0),
                self.column.unwrap_or(0)
            ));
        }

        frame.trim_start().to_string()
    }

    pub fn is_agent_frame(&self) -> bool {
        is_agent_frame(
            self.function_name.as_deref().unwrap_or_default(),
            self.file_name.as_deref().unwrap_or_default(),
        )
    }
}

/// Captures the current call stack, innermost frame first.
pub trait StackCapture: Send + Sync {
    /// Returns the caller's stack after dropping the agent's own capture
    /// frames and then `skip` more; `None` when capture is unsupported.
    fn capture(&self, skip: usize) -> Option<Vec<CallSite>>;
}

/// Default stack capture through `std::backtrace`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BacktraceCapture;

impl StackCapture for BacktraceCapture {
    fn capture(&self, skip: usize) -> Option<Vec<CallSite>> {
        let backtrace = std::backtrace::Backtrace::force_capture();
        if backtrace.status() != std::backtrace::BacktraceStatus::Captured {
            return None;
        }

        let frames = parse_backtrace(&backtrace.to_string())
            .into_iter()
            .skip_while(|frame| {
                frame.function_name.as_deref().map_or(true, |name| {
                    name.starts_with("std::backtrace") || is_agent_frame(name, "")
                })
            })
            .skip(skip)
            .collect();

        Some(frames)
    }
}

/// Parses the `Display` form of a captured `std::backtrace::Backtrace`.
pub fn parse_backtrace(text: &str) -> Vec<CallSite> {
    let mut frames: Vec<CallSite> = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(location) = trimmed.strip_prefix("at ") {
            if let Some(frame) = frames.last_mut() {
                apply_location(frame, location);
            }
            continue;
        }

        // "12: symbol" or a bare symbol for inlined frames.
        let name = match trimmed.split_once(": ") {
            Some((index, name)) if index.chars().all(|c| c.is_ascii_digit()) => name,
            _ => trimmed,
        };

        frames.push(CallSite {
            function_name: (name != "<unknown>").then(|| name.to_string()),
            ..Default::default()
        });
    }

    frames
}

fn apply_location(frame: &mut CallSite, location: &str) {
    let mut parts = location.rsplitn(3, ':');
    let column = parts.next().and_then(|c| c.parse().ok());
    let line = parts.next().and_then(|l| l.parse().ok());

    match (parts.next(), line, column) {
        (Some(file), Some(line), Some(column)) => {
            frame.file_name = Some(file.to_string());
            frame.line = Some(line);
            frame.column = Some(column);
        }
        _ => frame.file_name = Some(location.to_string()),
    }
}

/// One async resource observed during a recording window.
#[derive(Debug, Clone)]
pub struct Sample {
    pub id: u64,
    pub trigger_id: u64,
    pub resource_type: String,
    pub start: Instant,
    pub stack: Option<Vec<CallSite>>,
    /// Milliseconds from creation to the first callback, once known.
    pub time: Option<f64>,
}

/// Samples collected in one window, in creation order.
#[derive(Debug, Default)]
pub struct SamplerWindow {
    pub samples: Vec<Sample>,
    index: HashMap<u64, usize>,
    /// Effective recording duration in milliseconds.
    pub duration_ms: f64,
    /// Whether the sample limit cut the window short.
    pub truncated: bool,
}

impl SamplerWindow {
    pub fn get(&self, id: u64) -> Option<&Sample> {
        self.index.get(&id).and_then(|&i| self.samples.get(i))
    }

    fn insert(&mut self, sample: Sample) {
        match self.index.get(&sample.id) {
            Some(&i) => self.samples[i] = sample,
            None => {
                self.index.insert(sample.id, self.samples.len());
                self.samples.push(sample);
            }
        }
    }
}

#[derive(Default)]
struct SamplerState {
    window: SamplerWindow,
    limit_reached: bool,
    window_start: Option<Instant>,
}

/// Receives async lifecycle events and records them while enabled.
pub struct AsyncSampler {
    enabled: AtomicBool,
    state: Mutex<SamplerState>,
    capture: Arc<dyn StackCapture>,
    skip_frames: usize,
    health: Option<Arc<HealthMetrics>>,
}

impl AsyncSampler {
    pub fn new(capture: Arc<dyn StackCapture>) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            state: Mutex::new(SamplerState::default()),
            capture,
            skip_frames: 0,
            health: None,
        }
    }

    /// Frames of the hook provider itself to drop from captured stacks.
    pub fn with_skip_frames(mut self, skip_frames: usize) -> Self {
        self.skip_frames = skip_frames;
        self
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// A resource `id` of `resource_type` was created by `trigger_id`.
    pub fn init(&self, id: u64, resource_type: &str, trigger_id: u64) {
        self.init_at(id, resource_type, trigger_id, Instant::now());
    }

    /// The callback of resource `id` is about to run.
    pub fn before(&self, id: u64) {
        self.before_at(id, Instant::now());
    }

    pub(crate) fn init_at(&self, id: u64, resource_type: &str, trigger_id: u64, now: Instant) {
        if !self.is_enabled() || !self.admit() {
            return;
        }

        // Capture outside the lock; it walks the whole stack.
        let stack = self.capture.capture(self.skip_frames);

        let mut state = self.state.lock();
        if !self.is_enabled() || state.limit_reached {
            return;
        }
        state.window.insert(Sample {
            id,
            trigger_id,
            resource_type: resource_type.to_string(),
            start: now,
            stack,
            time: None,
        });
    }

    /// Checks the per-window limit, latching it once reached.
    fn admit(&self) -> bool {
        let mut state = self.state.lock();
        if state.limit_reached {
            return false;
        }

        if state.window.samples.len() >= SAMPLE_LIMIT {
            state.limit_reached = true;
            if let Some(health) = &self.health {
                health.samples_dropped.inc();
            }
            debug!(limit = SAMPLE_LIMIT, "async sample limit reached");
            return false;
        }

        true
    }

    pub(crate) fn before_at(&self, id: u64, now: Instant) {
        if !self.is_enabled() {
            return;
        }

        let mut state = self.state.lock();
        let Some(&i) = state.window.index.get(&id) else {
            return;
        };
        let sample = &mut state.window.samples[i];
        if sample.time.is_none() {
            sample.time = Some(millis_between(sample.start, now));
        }
    }

    /// Opens a recording window.
    pub fn start(&self) {
        self.start_at(Instant::now());
    }

    /// Closes the window and hands over its samples.
    pub fn stop(&self) -> SamplerWindow {
        self.stop_at(Instant::now())
    }

    pub(crate) fn start_at(&self, now: Instant) {
        let mut state = self.state.lock();
        state.window = SamplerWindow::default();
        state.limit_reached = false;
        state.window_start = Some(now);
        self.enabled.store(true, Ordering::Release);
    }

    pub(crate) fn stop_at(&self, now: Instant) -> SamplerWindow {
        self.enabled.store(false, Ordering::Release);

        let mut state = self.state.lock();
        let start = state.window_start.take().unwrap_or(now);
        let truncated = state.limit_reached;
        let mut window = std::mem::take(&mut state.window);
        state.limit_reached = false;
        drop(state);

        let wall = millis_between(start, now);
        window.truncated = truncated;
        window.duration_ms = if truncated {
            // Only the span covered by completed samples was observed.
            let end = window
                .samples
                .iter()
                .filter_map(|s| s.time.map(|t| millis_between(start, s.start) + t))
                .fold(0.0, f64::max);
            if end > 0.0 {
                end
            } else {
                wall
            }
        } else {
            wall
        };

        window
    }
}

fn millis_between(from: Instant, to: Instant) -> f64 {
    to.saturating_duration_since(from).as_nanos() as f64 / 1_000_000.0
}

/// Async call time profile and trace built from sampler windows.
pub struct AsyncProfiler {
    sampler: Arc<AsyncSampler>,
    include_agent_frames: bool,
    profile: Breakdown,
    trace: Breakdown,
    profile_duration_ms: f64,
    rng: StdRng,
}

impl AsyncProfiler {
    pub fn new(sampler: Arc<AsyncSampler>, include_agent_frames: bool) -> Self {
        Self {
            sampler,
            include_agent_frames,
            profile: empty_tree(),
            trace: empty_tree(),
            profile_duration_ms: 0.0,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    /// Accumulated effective recording time since the last reset.
    pub fn profile_duration(&self) -> Duration {
        Duration::from_secs_f64(self.profile_duration_ms / 1000.0)
    }

    fn update_profile(&mut self, window: &SamplerWindow) {
        for sample in &window.samples {
            let Some(time) = sample.time else {
                continue;
            };

            if EXCLUDED_RESOURCE_TYPES.contains(&sample.resource_type.as_str()) {
                continue;
            }

            let mut frames = causal_frames(sample, window, self.include_agent_frames);
            if frames.is_empty() {
                continue;
            }
            frames.reverse();

            let mut node = &mut self.profile;
            for frame in &frames {
                node = node.find_or_add_child(frame);
                node.set_type(BreakdownType::Callsite);
            }
            if !sample.resource_type.is_empty() {
                node.add_metadata(RESOURCE_METADATA_KEY, sample.resource_type.as_str());
            }
            node.increment(time, 1);

            let mut node = &mut self.trace;
            for frame in &frames {
                node = node.find_or_add_child(frame);
                node.set_type(BreakdownType::Callsite);
            }
            if !sample.resource_type.is_empty() {
                node.add_metadata(RESOURCE_METADATA_KEY, sample.resource_type.as_str());
            }
            node.update_p95(time, &mut self.rng);
        }
    }
}

fn empty_tree() -> Breakdown {
    Breakdown::with_type("Async call graph", BreakdownType::Callgraph)
}

/// Frames of `sample` and every resource that transitively triggered it,
/// innermost first, de-duplicated in first-seen order.
fn causal_frames(sample: &Sample, window: &SamplerWindow, include_agent_frames: bool) -> Vec<String> {
    let mut frames = Vec::new();
    let mut seen = HashSet::new();
    let mut processed = HashSet::new();

    let mut current = Some(sample);
    while let Some(s) = current {
        if !processed.insert(s.id) {
            break;
        }

        if let Some(stack) = &s.stack {
            extract_frames(stack, include_agent_frames, &mut frames, &mut seen);
            if frames.len() > MAX_FRAMES {
                break;
            }
        }

        current = window.get(s.trigger_id);
    }

    frames
}

fn extract_frames(
    stack: &[CallSite],
    include_agent_frames: bool,
    frames: &mut Vec<String>,
    seen: &mut HashSet<String>,
) {
    if !include_agent_frames && stack.iter().any(CallSite::is_agent_frame) {
        return;
    }

    for call_site in stack {
        let frame = call_site.label();
        if !frame.is_empty() && seen.insert(frame.clone()) {
            frames.push(frame);
        }
    }
}

impl Profiler for AsyncProfiler {
    fn kind(&self) -> ProfilerKind {
        ProfilerKind::Async
    }

    fn available(&self) -> bool {
        true
    }

    fn reset(&mut self) {
        self.profile = empty_tree();
        self.trace = empty_tree();
        self.profile_duration_ms = 0.0;
    }

    fn start_profiler(&mut self) -> Result<()> {
        self.sampler.start();
        Ok(())
    }

    fn stop_profiler(&mut self) -> Result<()> {
        let window = self.sampler.stop();
        self.profile_duration_ms += window.duration_ms;
        debug!(
            samples = window.samples.len(),
            truncated = window.truncated,
            duration_ms = window.duration_ms,
            "async sampler window closed",
        );
        self.update_profile(&window);
        Ok(())
    }

    /// Normalizes by the effective recording time, which may be shorter than
    /// `duration` when windows were truncated.
    fn build_profile(&mut self, _duration: Duration) -> Vec<ProfileData> {
        let mut profile = std::mem::replace(&mut self.profile, empty_tree());
        profile.propagate();
        if self.profile_duration_ms > 0.0 {
            profile.normalize(self.profile_duration_ms / 1000.0);
        }
        profile.round();
        profile.filter(2, 1.0, f64::INFINITY);

        let mut trace = std::mem::replace(&mut self.trace, empty_tree());
        trace.evaluate_p95();
        trace.propagate();
        trace.round();
        trace.filter(2, 1.0, f64::INFINITY);

        vec![
            ProfileData {
                category: CATEGORY_ASYNC_PROFILE,
                name: NAME_ASYNC_CALL_TIMES,
                unit: UNIT_MILLISECOND,
                unit_interval: Some(1.0),
                profile,
            },
            ProfileData {
                category: CATEGORY_ASYNC_TRACE,
                name: NAME_ASYNC_CALL_TIMES,
                unit: UNIT_MILLISECOND,
                unit_interval: None,
                profile: trace,
            },
        ]
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;

    use super::*;

    /// Hands out queued stacks, one per capture.
    #[derive(Default)]
    pub(crate) struct ScriptedCapture {
        pub(crate) stacks: Mutex<VecDeque<Vec<CallSite>>>,
    }

    impl StackCapture for ScriptedCapture {
        fn capture(&self, _skip: usize) -> Option<Vec<CallSite>> {
            self.stacks.lock().pop_front()
        }
    }

    fn site(name: &str) -> CallSite {
        CallSite::new(name, "/app/src/main.rs", 1, 1)
    }

    fn label(name: &str) -> String {
        format!("{name} (/app/src/main.rs:1:1)")
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    struct Harness {
        capture: Arc<ScriptedCapture>,
        sampler: Arc<AsyncSampler>,
        t0: Instant,
    }

    impl Harness {
        fn new() -> Self {
            let capture = Arc::new(ScriptedCapture::default());
            let sampler = Arc::new(AsyncSampler::new(capture.clone()));
            let t0 = Instant::now();
            sampler.start_at(t0);
            Self {
                capture,
                sampler,
                t0,
            }
        }

        fn init(&self, id: u64, kind: &str, trigger: u64, stack: Vec<CallSite>, at: u64) {
            self.capture.stacks.lock().push_back(stack);
            self.sampler.init_at(id, kind, trigger, self.t0 + ms(at));
        }

        fn before(&self, id: u64, at: u64) {
            self.sampler.before_at(id, self.t0 + ms(at));
        }

        fn stop(&self, at: u64) -> SamplerWindow {
            self.sampler.stop_at(self.t0 + ms(at))
        }
    }

    fn profiler_for(h: &Harness) -> AsyncProfiler {
        AsyncProfiler::new(Arc::clone(&h.sampler), false).with_rng(StdRng::seed_from_u64(5))
    }

    #[test]
    fn test_chain_is_attributed_root_first() {
        let h = Harness::new();
        h.init(1, "TCPWRAP", 0, vec![site("accept")], 0);
        h.init(2, "FSREQCALLBACK", 1, vec![site("read_file"), site("handler")], 5);
        h.before(2, 15);
        h.before(2, 40);

        let window = h.stop(1000);
        let mut profiler = profiler_for(&h);
        profiler.update_profile(&window);

        let accept = profiler.profile.find_child(&label("accept")).expect("root-most frame");
        let handler = accept.find_child(&label("handler")).expect("handler");
        let leaf = handler.find_child(&label("read_file")).expect("leaf");
        assert_eq!(leaf.measurement, 10.0);
        assert_eq!(leaf.num_samples, 1);
        assert_eq!(leaf.get_metadata("Resource"), Some("FSREQCALLBACK"));
        assert_eq!(leaf.breakdown_type, Some(BreakdownType::Callsite));

        // Sample 1 never ran its callback and is not attributed on its own.
        assert_eq!(accept.num_samples, 0);
    }

    #[test]
    fn test_trigger_cycle_terminates() {
        let h = Harness::new();
        h.init(1, "TCPWRAP", 2, vec![site("a")], 0);
        h.init(2, "TCPWRAP", 1, vec![site("b")], 1);
        h.before(1, 3);
        h.before(2, 4);

        let window = h.stop(100);
        let frames = causal_frames(window.get(1).expect("sample"), &window, false);
        assert_eq!(frames, vec![label("a"), label("b")]);
    }

    #[test]
    fn test_excluded_and_incomplete_samples_skipped() {
        let h = Harness::new();
        h.init(1, "Timeout", 0, vec![site("timer")], 0);
        h.init(2, "PROMISE", 0, vec![site("promise")], 0);
        h.init(3, "TCPWRAP", 0, vec![site("pending")], 0);
        h.before(1, 5);
        h.before(2, 5);

        let window = h.stop(100);
        let mut profiler = profiler_for(&h);
        profiler.update_profile(&window);
        assert!(profiler.profile.children().is_empty());
    }

    #[test]
    fn test_agent_stacks_skipped_unless_included() {
        let agent_site = CallSite::new(
            "stackpipe::queue::MessageQueue::flush",
            "/deps/stackpipe/src/queue.rs",
            1,
            1,
        );

        let h = Harness::new();
        h.init(1, "HTTPPARSER", 0, vec![site("app"), agent_site.clone()], 0);
        h.before(1, 5);
        let window = h.stop(100);

        let mut profiler = profiler_for(&h);
        profiler.update_profile(&window);
        assert!(profiler.profile.children().is_empty());

        let mut profiler = AsyncProfiler::new(Arc::clone(&h.sampler), true);
        profiler.update_profile(&window);
        assert_eq!(profiler.profile.children().len(), 1);
    }

    #[test]
    fn test_frame_path_capped() {
        let h = Harness::new();
        for id in 1..=60u64 {
            h.init(id, "TCPWRAP", id - 1, vec![site(&format!("f{id}"))], id);
        }
        h.before(60, 100);

        let window = h.stop(200);
        let frames = causal_frames(window.get(60).expect("sample"), &window, false);
        assert_eq!(frames.len(), MAX_FRAMES + 1);
        assert_eq!(frames[0], label("f60"));
    }

    #[test]
    fn test_sample_limit_truncates_window() {
        let h = Harness::new();
        for id in 0..(SAMPLE_LIMIT as u64 + 100) {
            h.init(id, "TCPWRAP", 0, vec![site("io")], 1);
        }
        assert!(h.sampler.state.lock().limit_reached);
        h.before(7, 250);
        h.before(8, 101);

        let window = h.stop(10_000);
        assert_eq!(window.samples.len(), SAMPLE_LIMIT);
        assert!(window.truncated);
        assert_eq!(window.duration_ms, 250.0);
    }

    #[test]
    fn test_truncated_window_without_completions_uses_wall_time() {
        let h = Harness::new();
        for id in 0..(SAMPLE_LIMIT as u64 + 1) {
            h.init(id, "TCPWRAP", 0, vec![site("io")], 1);
        }

        let window = h.stop(3000);
        assert!(window.truncated);
        assert_eq!(window.duration_ms, 3000.0);
    }

    #[test]
    fn test_disabled_sampler_ignores_events() {
        let capture = Arc::new(ScriptedCapture::default());
        let sampler = AsyncSampler::new(capture);
        sampler.init(1, "TCPWRAP", 0);
        sampler.before(1);
        assert!(sampler.stop().samples.is_empty());
    }

    #[test]
    fn test_build_profile_rates_and_p95() {
        let h = Harness::new();
        for (id, wait) in [(1u64, 100u64), (2, 300), (3, 200)] {
            h.init(id, "FSREQCALLBACK", 0, vec![site("read")], 0);
            h.before(id, wait);
        }
        let window = h.stop(2000);

        let mut profiler = profiler_for(&h);
        profiler.profile_duration_ms += window.duration_ms;
        profiler.update_profile(&window);

        let data = profiler.build_profile(Duration::from_secs(2));
        assert_eq!(data.len(), 2);
        assert_eq!(data[0].category, "async-profile");
        assert_eq!(data[1].category, "async-trace");

        // 600 ms of waiting over 2 s of recording.
        let read = data[0].profile.find_child(&label("read")).expect("read");
        assert_eq!(read.measurement, 300.0);
        assert_eq!(read.num_samples, 2);

        // floor(3 * 0.95) = 2 -> largest of three waits.
        let read = data[1].profile.find_child(&label("read")).expect("read");
        assert_eq!(read.measurement, 300.0);
        assert_eq!(read.num_samples, 3);
    }

    #[test]
    fn test_parse_backtrace() {
        let text = "   0: std::backtrace::Backtrace::force_capture\n             at /rustc/abc/library/std/src/backtrace.rs:312:13\n   1: app::handler::serve\n             at ./src/handler.rs:42:9\n      app::handler::inlined\n   2: <unknown>\n";
        let frames = parse_backtrace(text);

        assert_eq!(frames.len(), 4);
        assert_eq!(frames[1].function_name.as_deref(), Some("app::handler::serve"));
        assert_eq!(frames[1].file_name.as_deref(), Some("./src/handler.rs"));
        assert_eq!(frames[1].line, Some(42));
        assert_eq!(frames[1].column, Some(9));
        assert_eq!(frames[2].label(), "app::handler::inlined");
        assert_eq!(frames[3].function_name, None);
        assert_eq!(frames[3].label(), "");
    }

    #[test]
    fn test_call_site_label() {
        let mut s = site("handle");
        s.method_name = Some("call".to_string());
        assert_eq!(s.label(), "handle [as call] (/app/src/main.rs:1:1)");

        let anon = CallSite {
            file_name: Some("/app/x.rs".to_string()),
            line: Some(3),
            column: Some(4),
            ..Default::default()
        };
        assert_eq!(anon.label(), "(/app/x.rs:3:4)");
    }

    #[test]
    fn test_backtrace_capture_skips_own_frames() {
        let frames = BacktraceCapture.capture(0);
        if let Some(frames) = frames {
            if let Some(first) = frames.first() {
                let name = first.function_name.as_deref().unwrap_or_default();
                assert!(!name.starts_with("std::backtrace"));
            }
        }
    }
}
