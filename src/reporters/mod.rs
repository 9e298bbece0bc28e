//! Reporters turning collected data into queued metrics.

pub mod error;
pub mod process;
pub mod profile;
pub mod span;

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub use error::ErrorReporter;
pub use process::{ProcessReporter, ProcessStats, ProcfsStats};
pub use profile::{ProfileReporter, RecordingSpan, ReporterContext, ReporterSettings};
pub use span::SpanReporter;

/// Report period of the span, process and error reporters.
pub const METRICS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// A cancellable fixed-period background loop. The first run happens one
/// full period after start.
#[derive(Default)]
pub(crate) struct PeriodicTask {
    cancel: Mutex<Option<CancellationToken>>,
}

impl PeriodicTask {
    /// Spawns the loop. Returns false if it is already running.
    pub(crate) fn start<F>(&self, period: Duration, mut tick: F) -> bool
    where
        F: FnMut() + Send + 'static,
    {
        let mut slot = self.cancel.lock();
        if slot.is_some() {
            return false;
        }

        let cancel = CancellationToken::new();
        *slot = Some(cancel.clone());

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => tick(),
                }
            }
        });

        true
    }

    /// Cancels the loop. Returns false if it was not running.
    pub(crate) fn stop(&self) -> bool {
        match self.cancel.lock().take() {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.cancel.lock().is_some()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_ticks_until_stopped() {
        let task = PeriodicTask::default();
        let ticks = Arc::new(AtomicUsize::new(0));

        let t = Arc::clone(&ticks);
        assert!(task.start(Duration::from_secs(60), move || {
            t.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!task.start(Duration::from_secs(60), || {}));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(62)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);

        assert!(task.stop());
        assert!(!task.is_running());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }
}
