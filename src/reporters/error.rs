//! Panic counting into an error call graph.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::breakdown::Breakdown;
use crate::metric::{
    Metric, MetricType, Trigger, CATEGORY_ERROR_PROFILE, NAME_UNCAUGHT_EXCEPTIONS, UNIT_NONE,
};
use crate::profilers::causality::{CallSite, StackCapture};

use super::{PeriodicTask, ReporterContext};

/// Distinct messages kept under one frame before folding into `Other`.
pub const MAX_MESSAGES_PER_FRAME: usize = 5;

const OTHER_MESSAGE: &str = "Other";
const UNDEFINED_MESSAGE: &str = "Undefined";

/// Frames of the panic runtime sitting between the hook and the panicking code.
const PANIC_MACHINERY: [&str; 8] = [
    "<alloc::boxed::Box",
    "core::ops::function",
    "std::panicking",
    "std::panic",
    "std::sys",
    "core::panicking",
    "rust_begin_unwind",
    "__rust",
];

struct Inner {
    ctx: ReporterContext,
    interval: Duration,
    capture: Arc<dyn StackCapture>,
    started: AtomicBool,
    profile: Mutex<Breakdown>,
}

/// Counts panics by call path and message.
pub struct ErrorReporter {
    inner: Arc<Inner>,
    task: PeriodicTask,
    hook_installed: AtomicBool,
}

impl ErrorReporter {
    pub fn new(ctx: ReporterContext, interval: Duration, capture: Arc<dyn StackCapture>) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                interval,
                capture,
                started: AtomicBool::new(false),
                profile: Mutex::new(empty_profile()),
            }),
            task: PeriodicTask::default(),
            hook_installed: AtomicBool::new(false),
        }
    }

    /// Starts counting. The panic hook is chained in front of the existing
    /// one on first start and stays installed; it is inert while stopped.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }

        *self.inner.profile.lock() = empty_profile();

        if !self.hook_installed.swap(true, Ordering::AcqRel) {
            self.install_hook();
        }

        let inner = Arc::clone(&self.inner);
        self.task.start(self.inner.interval, move || inner.report());
    }

    pub fn stop(&self) {
        if self.inner.started.swap(false, Ordering::AcqRel) {
            self.task.stop();
        }
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Counts one error. `frames` run innermost first; a missing message
    /// is recorded as `Undefined`.
    pub fn record_error(&self, frames: &[String], message: Option<&str>) {
        if self.is_started() {
            self.inner.update_profile(frames, message);
        }
    }

    pub fn report(&self) {
        self.inner.report();
    }

    fn install_hook(&self) {
        let weak = Arc::downgrade(&self.inner);
        let previous = std::panic::take_hook();

        std::panic::set_hook(Box::new(move |info| {
            if let Some(inner) = weak.upgrade() {
                if inner.started.load(Ordering::Acquire) {
                    inner.record_panic(info.payload());
                }
            }
            previous(info);
        }));
    }
}

impl Drop for ErrorReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn empty_profile() -> Breakdown {
    Breakdown::new("root")
}

impl Inner {
    fn record_panic(&self, payload: &(dyn Any + Send)) {
        let frames: Vec<String> = self
            .capture
            .capture(0)
            .unwrap_or_default()
            .iter()
            .skip_while(|site| is_panic_machinery(site))
            .map(CallSite::label)
            .filter(|label| !label.is_empty())
            .collect();

        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned());

        self.update_profile(&frames, message.as_deref());
    }

    fn update_profile(&self, frames: &[String], message: Option<&str>) {
        let mut profile = self.profile.lock();

        let mut node = &mut *profile;
        node.increment(1.0, 0);

        if frames.is_empty() {
            return;
        }

        for frame in frames.iter().rev() {
            node = node.find_or_add_child(frame);
            node.increment(1.0, 0);
        }

        let message = message.filter(|m| !m.is_empty()).unwrap_or(UNDEFINED_MESSAGE);
        let message = if node.find_child(message).is_some()
            || node.children().len() < MAX_MESSAGES_PER_FRAME
        {
            message
        } else {
            OTHER_MESSAGE
        };
        node.find_or_add_child(message).increment(1.0, 0);
    }

    fn report(&self) {
        let profile = std::mem::replace(&mut *self.profile.lock(), empty_profile());

        let mut metric = Metric::new(
            &self.ctx.scope,
            MetricType::Profile,
            CATEGORY_ERROR_PROFILE,
            NAME_UNCAUGHT_EXCEPTIONS,
            UNIT_NONE,
        );
        let count = profile.measurement;
        metric.create_measurement(
            Trigger::Timer,
            count,
            Some(self.interval.as_secs_f64()),
            Some(profile),
        );
        self.ctx.queue.add("metric", metric.to_json());

        debug!(count, "reported error profile");
    }
}

fn is_panic_machinery(site: &CallSite) -> bool {
    site.function_name
        .as_deref()
        .map_or(true, |name| PANIC_MACHINERY.iter().any(|p| name.starts_with(p)))
}
