//! Jittered record/report timers serialized through the [`ProfilerLock`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::lock::{LockGuard, ProfilerLock};

/// Default poll interval while waiting for the lock.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Starts a recording window of the given length. The guard must be released
/// (or dropped) once the window closes.
pub type RecordFn = Arc<dyn Fn(Duration, LockGuard) -> Result<()> + Send + Sync>;

/// Finalizes and ships collected data. Same guard contract as [`RecordFn`].
pub type ReportFn = Arc<dyn Fn(LockGuard) -> Result<()> + Send + Sync>;

/// Timer settings for one scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub record_interval: Duration,
    pub record_duration: Duration,
    pub report_interval: Duration,
    pub retry_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            record_interval: Duration::from_secs(16),
            record_duration: Duration::from_secs(2),
            report_interval: Duration::from_secs(120),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// Runs a record function at a random offset inside every record interval and
/// a report function every report interval, never while another activity
/// holds the shared lock.
pub struct ProfilerScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: SchedulerConfig,
    lock: Arc<ProfilerLock>,
    record_fn: Option<RecordFn>,
    report_fn: ReportFn,
    rng: Mutex<StdRng>,
    retry_pending: AtomicBool,
    started: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl ProfilerScheduler {
    pub fn new(
        cfg: SchedulerConfig,
        lock: Arc<ProfilerLock>,
        record_fn: Option<RecordFn>,
        report_fn: ReportFn,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                lock,
                record_fn,
                report_fn,
                rng: Mutex::new(StdRng::from_entropy()),
                retry_pending: AtomicBool::new(false),
                started: AtomicBool::new(false),
                cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Replaces the jitter source, e.g. with a seeded generator.
    pub fn with_rng(self, rng: StdRng) -> Self {
        *self.inner.rng.lock() = rng;
        self
    }

    /// Spawns the record and report timers. Must be called inside a Tokio
    /// runtime; a second call while running is ignored.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let cancel = self.inner.cancel.lock().clone();

        if self.inner.record_fn.is_some() {
            let inner = Arc::clone(&self.inner);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let period = inner.cfg.record_interval;
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => {
                            let delay = inner.jitter();
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                _ = tokio::time::sleep(delay) => inner.execute_record(),
                            }
                        }
                    }
                }
            });
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let period = inner.cfg.report_interval;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => inner.execute_report(),
                }
            }
        });
    }

    /// Cancels the timers and any pending retry. Work already handed a guard
    /// runs to completion.
    pub fn stop(&self) {
        let mut cancel = self.inner.cancel.lock();
        cancel.cancel();
        *cancel = CancellationToken::new();
        self.inner.retry_pending.store(false, Ordering::Release);
        self.inner.started.store(false, Ordering::Release);
    }

    /// Queues a record run outside the timer.
    pub fn execute_record(&self) {
        self.inner.execute_record();
    }

    /// Queues a report run outside the timer.
    pub fn execute_report(&self) {
        self.inner.execute_report();
    }

    /// Runs `func` with the lock now if it is free, otherwise polls for it.
    /// Dropped when a retry is already pending.
    pub fn queue<F>(&self, func: F)
    where
        F: FnOnce(LockGuard) -> Result<()> + Send + 'static,
    {
        Inner::queue(&self.inner, func);
    }

    pub fn is_retry_pending(&self) -> bool {
        self.inner.retry_pending.load(Ordering::Acquire)
    }

    /// Random delay in `[0, record_interval - record_duration]`, whole ms.
    pub fn jitter(&self) -> Duration {
        self.inner.jitter()
    }
}

impl Drop for ProfilerScheduler {
    fn drop(&mut self) {
        self.inner.cancel.lock().cancel();
    }
}

impl Inner {
    fn jitter(&self) -> Duration {
        let span = self
            .cfg
            .record_interval
            .saturating_sub(self.cfg.record_duration)
            .as_millis() as u64;
        Duration::from_millis(self.rng.lock().gen_range(0..=span))
    }

    fn execute_record(self: &Arc<Self>) {
        let Some(record_fn) = self.record_fn.clone() else {
            return;
        };
        let duration = self.cfg.record_duration;
        Self::queue(self, move |guard| record_fn(duration, guard));
    }

    fn execute_report(self: &Arc<Self>) {
        let report_fn = Arc::clone(&self.report_fn);
        Self::queue(self, move |guard| report_fn(guard));
    }

    fn queue<F>(inner: &Arc<Self>, func: F)
    where
        F: FnOnce(LockGuard) -> Result<()> + Send + 'static,
    {
        if inner.retry_pending.load(Ordering::Acquire) {
            debug!("profiler activity already queued, dropping request");
            return;
        }

        if let Some(guard) = inner.lock.try_acquire() {
            run(func, guard);
            return;
        }

        inner.retry_pending.store(true, Ordering::Release);

        let lock = Arc::clone(&inner.lock);
        let retry_interval = inner.cfg.retry_interval;
        let cancel = inner.cancel.lock().clone();
        let inner = Arc::clone(inner);

        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(Instant::now() + retry_interval, retry_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Some(guard) = lock.try_acquire() {
                            inner.retry_pending.store(false, Ordering::Release);
                            run(func, guard);
                            return;
                        }
                    }
                }
            }
        });
    }
}

/// Runs `func` under `guard`. Errors and panics release the lock and only
/// cost this cycle; the timers keep running.
fn run<F>(func: F, guard: LockGuard)
where
    F: FnOnce(LockGuard) -> Result<()>,
{
    let handle = guard.release_handle();
    match std::panic::catch_unwind(AssertUnwindSafe(|| func(guard))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(error = %e, "scheduled profiler activity failed");
            handle.release();
        }
        Err(payload) => {
            error!(panic = panic_message(&*payload), "scheduled profiler activity panicked");
            handle.release();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
