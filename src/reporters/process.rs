//! Periodic process and runtime statistics.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::metric::{
    MetricCache, MetricType, Trigger, CATEGORY_CPU, CATEGORY_GC, CATEGORY_MEMORY,
    CATEGORY_RUNTIME, NAME_CPP_OBJECTS, NAME_CPU_USAGE, NAME_EVENT_LOOP_IO_STAGE,
    NAME_EVENT_LOOP_TICKS, NAME_GC_CYCLES, NAME_GC_TIME, NAME_RSS, NAME_TOTAL_HEAP_SIZE,
    NAME_USED_HEAP_SIZE, UNIT_BYTE, UNIT_NANOSECOND, UNIT_NONE, UNIT_PERCENT,
};

use super::{PeriodicTask, ReporterContext};

/// Kernel clock ticks per second for /proc CPU times.
const USER_HZ: u64 = 100;

/// Process memory figures in bytes. Unknown values are `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryUsage {
    pub rss: Option<u64>,
    pub heap_total: Option<u64>,
    pub heap_used: Option<u64>,
    /// Memory held by native objects outside the managed heap.
    pub external: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct HeapSpace {
    pub name: String,
    pub used_size: u64,
}

/// Garbage collection totals since the previous read.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    pub num_cycles: u64,
    pub total_time_ns: u64,
}

/// Event loop totals since the previous read.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventLoopStats {
    pub num_ticks: u64,
    pub io_time_ns: u64,
}

/// Source of process and runtime statistics. Every figure is optional.
pub trait ProcessStats: Send + Sync {
    /// Total user plus system CPU time consumed by the process.
    fn cpu_time(&self) -> Option<Duration>;

    fn memory_usage(&self) -> MemoryUsage;

    fn heap_spaces(&self) -> Vec<HeapSpace> {
        Vec::new()
    }

    fn read_and_reset_gc_stats(&self) -> Option<GcStats> {
        None
    }

    fn read_and_reset_event_loop_stats(&self) -> Option<EventLoopStats> {
        None
    }

    /// Begins collecting GC and event loop statistics.
    fn start(&self) {}

    fn stop(&self) {}
}

/// Reads the current process's statistics from procfs.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsStats;

impl ProcessStats for ProcfsStats {
    fn cpu_time(&self) -> Option<Duration> {
        let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
        parse_proc_stat_cpu_time(&stat)
    }

    fn memory_usage(&self) -> MemoryUsage {
        let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
            return MemoryUsage::default();
        };

        let rss = parse_proc_status_kb_bytes(&status, "VmRSS:");
        let heap = parse_proc_status_kb_bytes(&status, "VmData:");

        MemoryUsage {
            rss,
            heap_total: heap,
            heap_used: parse_proc_status_kb_bytes(&status, "RssAnon:"),
            external: None,
        }
    }
}

/// utime and stime are fields 14 and 15, counted after the parenthesized
/// command name which may itself contain spaces.
fn parse_proc_stat_cpu_time(stat: &str) -> Option<Duration> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    // Field 3 (state) is the first after the command name.
    let utime: u64 = fields.nth(11)?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;

    let ticks = utime + stime;
    Some(Duration::from_millis(ticks * 1000 / USER_HZ))
}

fn parse_proc_status_kb_bytes(status: &str, key: &str) -> Option<u64> {
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix(key) {
            let value: u64 = rest.split_whitespace().next()?.parse().ok()?;
            return Some(value.saturating_mul(1024));
        }
    }
    None
}

struct Inner {
    ctx: ReporterContext,
    interval: Duration,
    stats: Arc<dyn ProcessStats>,
    metrics: Mutex<MetricCache>,
    last_cpu_time: Mutex<Option<Duration>>,
}

/// Emits CPU, memory, GC and event loop state metrics every interval.
pub struct ProcessReporter {
    inner: Arc<Inner>,
    task: PeriodicTask,
}

impl ProcessReporter {
    pub fn new(ctx: ReporterContext, interval: Duration, stats: Arc<dyn ProcessStats>) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                interval,
                stats,
                metrics: Mutex::new(MetricCache::new()),
                last_cpu_time: Mutex::new(None),
            }),
            task: PeriodicTask::default(),
        }
    }

    /// Only runs with auto profiling.
    pub fn start(&self) {
        if !self.inner.ctx.auto_profiling || self.task.is_running() {
            return;
        }

        self.inner.metrics.lock().clear();
        *self.inner.last_cpu_time.lock() = None;
        self.inner.stats.start();

        let inner = Arc::clone(&self.inner);
        self.task.start(self.inner.interval, move || inner.report());
    }

    pub fn stop(&self) {
        if self.task.stop() {
            self.inner.stats.stop();
        }
    }

    pub fn is_started(&self) -> bool {
        self.task.is_running()
    }

    pub fn report(&self) {
        self.inner.report();
    }
}

impl Drop for ProcessReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn report(&self) {
        let interval = self.interval.as_secs_f64();
        let mut metrics = self.metrics.lock();
        let mut reported = 0usize;

        let mut emit = |category: &str, name: &str, unit: &str, value: f64, duration: Option<f64>| {
            let metric = metrics.get_or_create(
                &self.ctx.scope,
                MetricType::State,
                category,
                name,
                unit,
            );
            metric.create_measurement(Trigger::Timer, value, duration, None);

            if metric.has_measurement() {
                self.ctx.queue.add("metric", metric.to_json());
                reported += 1;
            }
        };

        if let Some(cpu_time) = self.stats.cpu_time() {
            let mut last = self.last_cpu_time.lock();
            if let Some(previous) = *last {
                let used = cpu_time.saturating_sub(previous).as_secs_f64();
                emit(CATEGORY_CPU, NAME_CPU_USAGE, UNIT_PERCENT, used / interval * 100.0, None);
            }
            *last = Some(cpu_time);
        }

        let memory = self.stats.memory_usage();
        for (name, value) in [
            (NAME_RSS, memory.rss),
            (NAME_TOTAL_HEAP_SIZE, memory.heap_total),
            (NAME_USED_HEAP_SIZE, memory.heap_used),
            (NAME_CPP_OBJECTS, memory.external),
        ] {
            if let Some(value) = value {
                emit(CATEGORY_MEMORY, name, UNIT_BYTE, value as f64, None);
            }
        }

        for space in self.stats.heap_spaces() {
            let name = format!("{NAME_USED_HEAP_SIZE}: {}", space.name);
            emit(CATEGORY_MEMORY, &name, UNIT_BYTE, space.used_size as f64, None);
        }

        if let Some(gc) = self.stats.read_and_reset_gc_stats() {
            emit(CATEGORY_GC, NAME_GC_CYCLES, UNIT_NONE, gc.num_cycles as f64, Some(interval));
            emit(CATEGORY_GC, NAME_GC_TIME, UNIT_NANOSECOND, gc.total_time_ns as f64, Some(interval));
        }

        if let Some(event_loop) = self.stats.read_and_reset_event_loop_stats() {
            emit(
                CATEGORY_RUNTIME,
                NAME_EVENT_LOOP_TICKS,
                UNIT_NONE,
                event_loop.num_ticks as f64,
                Some(interval),
            );
            emit(
                CATEGORY_RUNTIME,
                NAME_EVENT_LOOP_IO_STAGE,
                UNIT_NANOSECOND,
                event_loop.io_time_ns as f64,
                Some(interval),
            );
        }

        debug!(count = reported, "reported process metrics");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::ProfilerLock;
    use crate::metric::MetricScope;
    use crate::queue::{MessageQueue, QueueConfig};

    /// Scripted statistics; CPU time grows 15 s per read.
    #[derive(Default)]
    struct FakeStats {
        cpu_reads: Mutex<u64>,
        started: Mutex<bool>,
    }

    impl ProcessStats for FakeStats {
        fn cpu_time(&self) -> Option<Duration> {
            let mut reads = self.cpu_reads.lock();
            *reads += 1;
            Some(Duration::from_secs(15 * *reads))
        }

        fn memory_usage(&self) -> MemoryUsage {
            MemoryUsage {
                rss: Some(4096),
                heap_total: Some(2048),
                heap_used: None,
                external: None,
            }
        }

        fn heap_spaces(&self) -> Vec<HeapSpace> {
            vec![HeapSpace {
                name: "old_space".to_string(),
                used_size: 100,
            }]
        }

        fn read_and_reset_gc_stats(&self) -> Option<GcStats> {
            Some(GcStats {
                num_cycles: 3,
                total_time_ns: 900,
            })
        }

        fn start(&self) {
            *self.started.lock() = true;
        }

        fn stop(&self) {
            *self.started.lock() = false;
        }
    }

    fn context() -> ReporterContext {
        ReporterContext {
            scope: MetricScope::default(),
            queue: Arc::new(MessageQueue::new(QueueConfig::default())),
            lock: ProfilerLock::new(),
            auto_profiling: true,
            health: None,
        }
    }

    fn find<'a>(messages: &'a [serde_json::Value], name: &str) -> Option<&'a serde_json::Value> {
        messages.iter().find(|m| m["name"] == name)
    }

    #[tokio::test]
    async fn test_process_metrics() {
        let ctx = context();
        let queue = Arc::clone(&ctx.queue);
        let stats = Arc::new(FakeStats::default());
        let reporter = ProcessReporter::new(ctx, Duration::from_secs(60), stats.clone());

        reporter.start();
        assert!(*stats.started.lock());

        reporter.report();
        let first: Vec<_> = queue.snapshot().into_iter().map(|m| m.content).collect();
        // No CPU usage before a baseline exists.
        assert!(find(&first, "CPU usage").is_none());
        assert_eq!(find(&first, "RSS").expect("rss")["measurement"]["value"], 4096.0);
        assert!(find(&first, "Total heap size").is_some());
        assert!(find(&first, "Used heap size").is_none());
        assert_eq!(
            find(&first, "Used heap size: old_space").expect("space")["unit"],
            "byte"
        );
        let gc = find(&first, "GC cycles").expect("gc");
        assert_eq!(gc["category"], "gc");
        assert_eq!(gc["measurement"]["duration"], 60.0);
        assert_eq!(first.len(), 5);

        queue.reset();
        reporter.report();
        let second: Vec<_> = queue.snapshot().into_iter().map(|m| m.content).collect();
        // 15 s of CPU over a 60 s interval.
        let cpu = find(&second, "CPU usage").expect("cpu");
        assert_eq!(cpu["measurement"]["value"], 25.0);
        assert_eq!(cpu["unit"], "percent");

        reporter.stop();
        assert!(!*stats.started.lock());
    }

    #[tokio::test]
    async fn test_manual_mode_never_starts() {
        let mut ctx = context();
        ctx.auto_profiling = false;
        let reporter = ProcessReporter::new(ctx, Duration::from_secs(60), Arc::new(FakeStats::default()));
        reporter.start();
        assert!(!reporter.is_started());
    }

    #[test]
    fn test_parse_proc_stat_cpu_time() {
        let stat = "1234 (my (odd) app) S 1 1234 1234 0 -1 4194560 500 0 0 0 250 150 0 0 20 0 4 0 100 0 0";
        assert_eq!(parse_proc_stat_cpu_time(stat), Some(Duration::from_secs(4)));
        assert_eq!(parse_proc_stat_cpu_time("garbage"), None);
    }

    #[test]
    fn test_parse_proc_status_kb_bytes() {
        let status = "Name:\tapp\nVmRSS:\t    2048 kB\nThreads:\t4\n";
        assert_eq!(parse_proc_status_kb_bytes(status, "VmRSS:"), Some(2048 * 1024));
        assert_eq!(parse_proc_status_kb_bytes(status, "VmSwap:"), None);
    }

    #[test]
    fn test_procfs_stats_reads_self() {
        let stats = ProcfsStats;
        if std::path::Path::new("/proc/self/stat").exists() {
            assert!(stats.cpu_time().is_some());
            assert!(stats.memory_usage().rss.is_some());
        }
    }
}
