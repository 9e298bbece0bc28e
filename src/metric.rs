//! Metric and measurement model shipped to the collector.

use std::collections::HashMap;
use std::fmt::Write;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::breakdown::Breakdown;

pub const CATEGORY_CPU: &str = "cpu";
pub const CATEGORY_MEMORY: &str = "memory";
pub const CATEGORY_GC: &str = "gc";
pub const CATEGORY_RUNTIME: &str = "runtime";
pub const CATEGORY_SPAN: &str = "span";
pub const CATEGORY_CPU_PROFILE: &str = "cpu-profile";
pub const CATEGORY_MEMORY_PROFILE: &str = "memory-profile";
pub const CATEGORY_ASYNC_PROFILE: &str = "async-profile";
pub const CATEGORY_ASYNC_TRACE: &str = "async-trace";
pub const CATEGORY_ERROR_PROFILE: &str = "error-profile";

pub const NAME_CPU_TIME: &str = "CPU time";
pub const NAME_CPU_USAGE: &str = "CPU usage";
pub const NAME_RSS: &str = "RSS";
pub const NAME_USED_HEAP_SIZE: &str = "Used heap size";
pub const NAME_TOTAL_HEAP_SIZE: &str = "Total heap size";
pub const NAME_CPP_OBJECTS: &str = "C++ Objects";
pub const NAME_GC_CYCLES: &str = "GC cycles";
pub const NAME_GC_TIME: &str = "GC time";
pub const NAME_EVENT_LOOP_TICKS: &str = "Event loop ticks";
pub const NAME_EVENT_LOOP_IO_STAGE: &str = "Event loop I/O stage";
pub const NAME_HEAP_ALLOCATION_RATE: &str = "Heap allocation rate";
pub const NAME_ASYNC_CALL_TIMES: &str = "Async call times";
pub const NAME_UNCAUGHT_EXCEPTIONS: &str = "Uncaught exceptions";
pub const NAME_UNHANDLED_REJECTIONS: &str = "Unhandled rejections";

pub const UNIT_NONE: &str = "";
pub const UNIT_MILLISECOND: &str = "millisecond";
pub const UNIT_MICROSECOND: &str = "microsecond";
pub const UNIT_NANOSECOND: &str = "nanosecond";
pub const UNIT_BYTE: &str = "byte";
pub const UNIT_KILOBYTE: &str = "kilobyte";
pub const UNIT_PERCENT: &str = "percent";

/// Kind of metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    State,
    Counter,
    Profile,
    Trace,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::State => "state",
            Self::Counter => "counter",
            Self::Profile => "profile",
            Self::Trace => "trace",
        }
    }
}

/// What caused a measurement to be taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Timer,
    Api,
}

/// Application identity folded into every metric id.
#[derive(Debug, Clone, Default)]
pub struct MetricScope {
    pub app_name: String,
    pub app_environment: String,
    pub host_name: String,
}

/// One named, typed series.
#[derive(Debug, Clone, Serialize)]
pub struct Metric {
    pub id: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub category: String,
    pub name: String,
    pub unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measurement: Option<Measurement>,
    #[serde(skip)]
    last_value: Option<f64>,
}

/// Immutable value snapshot of a metric.
#[derive(Debug, Clone, Serialize)]
pub struct Measurement {
    pub id: String,
    pub trigger: Trigger,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<Breakdown>,
    pub timestamp: i64,
}

impl Metric {
    pub fn new(
        scope: &MetricScope,
        metric_type: MetricType,
        category: &str,
        name: &str,
        unit: &str,
    ) -> Self {
        let id = metric_id(scope, metric_type, category, name, unit);

        Self {
            id,
            metric_type,
            category: category.to_string(),
            name: name.to_string(),
            unit: unit.to_string(),
            measurement: None,
            last_value: None,
        }
    }

    pub fn has_measurement(&self) -> bool {
        self.measurement.is_some()
    }

    /// Records a new measurement.
    ///
    /// Counters emit the delta against the previous call; the first call only
    /// seeds the baseline and leaves the current measurement untouched.
    pub fn create_measurement(
        &mut self,
        trigger: Trigger,
        value: f64,
        duration: Option<f64>,
        breakdown: Option<Breakdown>,
    ) {
        let value = if self.metric_type == MetricType::Counter {
            match self.last_value.replace(value) {
                Some(last) => value - last,
                None => return,
            }
        } else {
            value
        };

        self.measurement = Some(Measurement {
            id: uuid::Uuid::new_v4().to_string(),
            trigger,
            value,
            duration,
            breakdown,
            timestamp: chrono::Utc::now().timestamp(),
        });
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Hex SHA-256 of the concatenated identity and series descriptors.
pub fn metric_id(
    scope: &MetricScope,
    metric_type: MetricType,
    category: &str,
    name: &str,
    unit: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scope.app_name.as_bytes());
    hasher.update(scope.app_environment.as_bytes());
    hasher.update(scope.host_name.as_bytes());
    hasher.update(metric_type.as_str().as_bytes());
    hasher.update(name.as_bytes());
    hasher.update(category.as_bytes());
    hasher.update(unit.as_bytes());

    let digest = hasher.finalize();
    let mut id = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(id, "{byte:02x}");
    }
    id
}

/// Long-lived metrics reused across report cycles, keyed by type, category
/// and name. Counters must live here so their baseline survives.
#[derive(Debug, Default)]
pub struct MetricCache {
    metrics: HashMap<(MetricType, String, String), Metric>,
}

impl MetricCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached metric, creating it on first use.
    pub fn get_or_create(
        &mut self,
        scope: &MetricScope,
        metric_type: MetricType,
        category: &str,
        name: &str,
        unit: &str,
    ) -> &mut Metric {
        self.metrics
            .entry((metric_type, category.to_string(), name.to_string()))
            .or_insert_with(|| Metric::new(scope, metric_type, category, name, unit))
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn clear(&mut self) {
        self.metrics.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> MetricScope {
        MetricScope {
            app_name: "app".to_string(),
            app_environment: "prod".to_string(),
            host_name: "host1".to_string(),
        }
    }

    #[test]
    fn test_counter_first_measurement_seeds_baseline() {
        let mut m = Metric::new(&scope(), MetricType::Counter, CATEGORY_CPU, NAME_CPU_TIME, UNIT_NONE);

        m.create_measurement(Trigger::Timer, 100.0, None, None);
        assert!(!m.has_measurement());

        m.create_measurement(Trigger::Timer, 110.0, None, None);
        assert_eq!(m.measurement.as_ref().map(|x| x.value), Some(10.0));

        m.create_measurement(Trigger::Timer, 115.0, None, None);
        assert_eq!(m.measurement.as_ref().map(|x| x.value), Some(5.0));
    }

    #[test]
    fn test_state_measurement_is_raw_value() {
        let mut m = Metric::new(&scope(), MetricType::State, CATEGORY_MEMORY, NAME_RSS, UNIT_KILOBYTE);
        m.create_measurement(Trigger::Timer, 2048.0, Some(60.0), None);

        let measurement = m.measurement.as_ref().expect("measurement");
        assert_eq!(measurement.value, 2048.0);
        assert_eq!(measurement.duration, Some(60.0));
        assert_eq!(measurement.trigger, Trigger::Timer);
        assert_eq!(measurement.id.len(), 36);
        assert!(measurement.timestamp > 0);
    }

    #[test]
    fn test_id_is_stable_and_distinguishes_series() {
        let a = Metric::new(&scope(), MetricType::State, CATEGORY_CPU, NAME_CPU_USAGE, UNIT_PERCENT);
        let b = Metric::new(&scope(), MetricType::State, CATEGORY_CPU, NAME_CPU_USAGE, UNIT_PERCENT);
        let c = Metric::new(&scope(), MetricType::Counter, CATEGORY_CPU, NAME_CPU_USAGE, UNIT_PERCENT);

        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(a.id.len(), 64);
        assert!(a.id.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn test_to_json_shape() {
        let mut breakdown = Breakdown::new("root");
        breakdown.increment(3.0, 1);

        let mut m = Metric::new(
            &scope(),
            MetricType::Profile,
            CATEGORY_CPU_PROFILE,
            NAME_CPU_USAGE,
            UNIT_PERCENT,
        );
        let json = m.to_json();
        assert!(json.get("measurement").is_none());

        m.create_measurement(Trigger::Api, 3.0, None, Some(breakdown));
        let json = m.to_json();
        assert_eq!(json["type"], "profile");
        assert_eq!(json["category"], "cpu-profile");
        assert_eq!(json["name"], "CPU usage");
        assert_eq!(json["unit"], "percent");
        assert_eq!(json["measurement"]["trigger"], "api");
        assert_eq!(json["measurement"]["value"], 3.0);
        assert!(json["measurement"].get("duration").is_none());
        assert_eq!(json["measurement"]["breakdown"]["name"], "root");
    }

    #[test]
    fn test_cache_reuses_metric() {
        let mut cache = MetricCache::new();
        let s = scope();

        cache
            .get_or_create(&s, MetricType::Counter, CATEGORY_GC, NAME_GC_CYCLES, UNIT_NONE)
            .create_measurement(Trigger::Timer, 5.0, None, None);
        let m = cache.get_or_create(&s, MetricType::Counter, CATEGORY_GC, NAME_GC_CYCLES, UNIT_NONE);
        m.create_measurement(Trigger::Timer, 8.0, None, None);

        assert_eq!(m.measurement.as_ref().map(|x| x.value), Some(3.0));
        assert_eq!(cache.len(), 1);
    }
}
