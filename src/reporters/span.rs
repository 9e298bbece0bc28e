use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::breakdown::Breakdown;
use crate::metric::{Metric, MetricType, Trigger, CATEGORY_SPAN, UNIT_MILLISECOND};

use super::{PeriodicTask, ReporterContext};

struct Inner {
    ctx: ReporterContext,
    interval: Duration,
    started: AtomicBool,
    counters: Mutex<HashMap<String, Breakdown>>,
    rng: Mutex<StdRng>,
}

/// 95th percentile durations of named application spans.
pub struct SpanReporter {
    inner: Arc<Inner>,
    task: PeriodicTask,
}

impl SpanReporter {
    pub fn new(ctx: ReporterContext, interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                interval,
                started: AtomicBool::new(false),
                counters: Mutex::new(HashMap::new()),
                rng: Mutex::new(StdRng::from_entropy()),
            }),
            task: PeriodicTask::default(),
        }
    }

    /// Only runs with auto profiling.
    pub fn start(&self) {
        if !self.inner.ctx.auto_profiling {
            return;
        }

        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.counters.lock().clear();

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

    /// Feeds one span duration in milliseconds. Ignored while stopped.
    pub fn record_span(&self, name: &str, duration_ms: f64) {
        if !self.is_started() {
            return;
        }

        let mut counters = self.inner.counters.lock();
        let counter = counters
            .entry(name.to_string())
            .or_insert_with(|| Breakdown::new(name));
        counter.update_p95(duration_ms, &mut *self.inner.rng.lock());
    }

    pub fn report(&self) {
        self.inner.report();
    }
}

impl Inner {
    fn report(&self) {
        let counters = std::mem::take(&mut *self.counters.lock());
        let duration = self.interval.as_secs_f64();

        for (name, mut counter) in counters {
            counter.evaluate_p95();

            let mut metric = Metric::new(
                &self.ctx.scope,
                MetricType::State,
                CATEGORY_SPAN,
                &name,
                UNIT_MILLISECOND,
            );
            metric.create_measurement(Trigger::Timer, counter.measurement, Some(duration), None);
            self.ctx.queue.add("metric", metric.to_json());

            debug!(span = %name, p95 = counter.measurement, "reported span");
        }
    }
}

impl Drop for SpanReporter {
    fn drop(&mut self) {
        self.stop();
    }
}
