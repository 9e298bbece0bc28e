use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::metric::MetricScope;
use crate::queue::QueueConfig;
use crate::reporters::profile::ReporterSettings;

/// Top-level configuration for the stackpipe agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Collector credentials. Required.
    #[serde(default)]
    pub agent_key: String,

    /// Application name reported with every message. Required.
    #[serde(default)]
    pub app_name: String,

    #[serde(default)]
    pub app_version: String,

    #[serde(default)]
    pub app_environment: String,

    /// Host name reported with every message. Default: the OS hostname.
    #[serde(default = "default_host_name")]
    pub host_name: String,

    /// Collector base URL (e.g., "https://collector.example.com"). Required.
    #[serde(default)]
    pub dashboard_address: String,

    /// Timer-driven profiling. When off, profiling only happens through the
    /// manual start/stop/report API. Default: true.
    #[serde(default = "default_true")]
    pub auto_profiling: bool,

    /// Keep the agent's own frames in call graphs. Default: false.
    #[serde(default)]
    pub include_agent_frames: bool,

    /// CPU profiler settings.
    #[serde(default)]
    pub cpu: ProfilerConfig,

    /// Allocation profiler settings.
    #[serde(default)]
    pub allocation: ProfilerConfig,

    /// Async call profiler settings.
    #[serde(default)]
    pub async_calls: ProfilerConfig,

    /// Outgoing message queue settings.
    #[serde(default)]
    pub queue: QueueSettings,

    /// Remote enable/disable polling.
    #[serde(default)]
    pub remote_config: RemoteConfigSettings,

    /// Report process CPU, memory and runtime statistics. Default: true.
    #[serde(default = "default_true")]
    pub process_metrics: bool,

    /// Count panics into an error profile. Default: true.
    #[serde(default = "default_true")]
    pub error_profile: bool,

    /// Report interval of the span, process and error reporters. Default: 60s.
    #[serde(default = "default_metrics_interval", with = "humantime_serde")]
    pub metrics_interval: Duration,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Per-profiler overrides. Unset durations fall back to the profiler's
/// built-in defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfilerConfig {
    /// Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Recording time accumulated per report before recording pauses.
    #[serde(default, with = "humantime_serde")]
    pub max_profile_duration: Option<Duration>,

    /// Length of one recording window.
    #[serde(default, with = "humantime_serde")]
    pub max_span_duration: Option<Duration>,

    /// API-triggered recordings allowed per report.
    #[serde(default)]
    pub max_span_count: Option<u32>,

    /// Period of timer-driven recordings.
    #[serde(default, with = "humantime_serde")]
    pub span_interval: Option<Duration>,

    /// Period of profile reports.
    #[serde(default, with = "humantime_serde")]
    pub report_interval: Option<Duration>,
}

/// Outgoing message queue settings.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    /// Upload attempt period. Default: 5s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Age after which undelivered messages are dropped. Default: 10m.
    #[serde(default = "default_message_ttl", with = "humantime_serde")]
    pub message_ttl: Duration,

    /// Period of the standalone expiry sweep. Default: 60s.
    #[serde(default = "default_expire_interval", with = "humantime_serde")]
    pub expire_interval: Duration,
}

/// Remote enable/disable polling.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfigSettings {
    /// Delay before the first fetch. Default: 2s.
    #[serde(default = "default_load_delay", with = "humantime_serde")]
    pub load_delay: Duration,

    /// Fetch period. Default: 120s.
    #[serde(default = "default_load_interval", with = "humantime_serde")]
    pub load_interval: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthConfig {
    /// Listen address (e.g., ":9090"). Unset disables the server.
    #[serde(default)]
    pub addr: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_host_name() -> String {
    read_text_file("/proc/sys/kernel/hostname").unwrap_or_else(|| "unknown".to_string())
}

fn default_metrics_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_message_ttl() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_expire_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_load_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_load_interval() -> Duration {
    Duration::from_secs(120)
}

fn read_text_file(path: &str) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_key: String::new(),
            app_name: String::new(),
            app_version: String::new(),
            app_environment: String::new(),
            host_name: default_host_name(),
            dashboard_address: String::new(),
            auto_profiling: true,
            include_agent_frames: false,
            cpu: ProfilerConfig::default(),
            allocation: ProfilerConfig::default(),
            async_calls: ProfilerConfig::default(),
            queue: QueueSettings::default(),
            remote_config: RemoteConfigSettings::default(),
            process_metrics: true,
            error_profile: true,
            metrics_interval: default_metrics_interval(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_profile_duration: None,
            max_span_duration: None,
            max_span_count: None,
            span_interval: None,
            report_interval: None,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            flush_interval: default_flush_interval(),
            message_ttl: default_message_ttl(),
            expire_interval: default_expire_interval(),
        }
    }
}

impl Default for RemoteConfigSettings {
    fn default() -> Self {
        Self {
            load_delay: default_load_delay(),
            load_interval: default_load_interval(),
        }
    }
}

impl ProfilerConfig {
    /// Applies the overrides on top of `defaults`.
    pub fn resolve(&self, defaults: ReporterSettings) -> ReporterSettings {
        ReporterSettings {
            max_profile_duration: self
                .max_profile_duration
                .unwrap_or(defaults.max_profile_duration),
            max_span_duration: self.max_span_duration.unwrap_or(defaults.max_span_duration),
            max_span_count: self.max_span_count.unwrap_or(defaults.max_span_count),
            span_interval: self.span_interval.unwrap_or(defaults.span_interval),
            report_interval: self.report_interval.unwrap_or(defaults.report_interval),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.agent_key.is_empty() {
            bail!("agent_key is required");
        }

        if self.app_name.is_empty() {
            bail!("app_name is required");
        }

        if self.dashboard_address.is_empty() {
            bail!("dashboard_address is required");
        }

        if !self.dashboard_address.starts_with("http://")
            && !self.dashboard_address.starts_with("https://")
        {
            bail!(
                "dashboard_address must start with http:// or https://, got {}",
                self.dashboard_address
            );
        }

        for (name, profiler, defaults) in [
            ("cpu", &self.cpu, ReporterSettings::cpu()),
            ("allocation", &self.allocation, ReporterSettings::allocation()),
            ("async_calls", &self.async_calls, ReporterSettings::async_calls()),
        ] {
            let settings = profiler.resolve(defaults);

            if settings.max_span_duration.is_zero() {
                bail!("{name}.max_span_duration must be positive");
            }

            if settings.span_interval < settings.max_span_duration {
                bail!(
                    "{name}.span_interval ({:?}) must not be shorter than max_span_duration ({:?})",
                    settings.span_interval,
                    settings.max_span_duration,
                );
            }

            if settings.report_interval.is_zero() {
                bail!("{name}.report_interval must be positive");
            }
        }

        if self.queue.flush_interval.is_zero() {
            bail!("queue.flush_interval must be positive");
        }

        if self.queue.message_ttl.is_zero() {
            bail!("queue.message_ttl must be positive");
        }

        if self.queue.expire_interval.is_zero() {
            bail!("queue.expire_interval must be positive");
        }

        if self.remote_config.load_interval.is_zero() {
            bail!("remote_config.load_interval must be positive");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be positive");
        }

        Ok(())
    }

    /// Identity folded into metric ids.
    pub fn metric_scope(&self) -> MetricScope {
        MetricScope {
            app_name: self.app_name.clone(),
            app_environment: self.app_environment.clone(),
            host_name: self.host_name.clone(),
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            flush_interval: self.queue.flush_interval,
            message_ttl: self.queue.message_ttl,
            auto_profiling: self.auto_profiling,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn valid_config() -> Config {
        Config {
            agent_key: "key1".to_string(),
            app_name: "app1".to_string(),
            dashboard_address: "http://localhost:5000".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert!(cfg.auto_profiling);
        assert!(!cfg.include_agent_frames);
        assert!(cfg.process_metrics);
        assert!(cfg.error_profile);
        assert!(!cfg.host_name.is_empty());
        assert_eq!(cfg.metrics_interval, Duration::from_secs(60));
        assert_eq!(cfg.queue.flush_interval, Duration::from_secs(5));
        assert_eq!(cfg.queue.message_ttl, Duration::from_secs(600));
        assert_eq!(cfg.remote_config.load_delay, Duration::from_secs(2));
        assert_eq!(cfg.remote_config.load_interval, Duration::from_secs(120));
        assert!(cfg.health.addr.is_none());
    }

    #[test]
    fn test_valid_config_passes() {
        valid_config().validate().expect("valid");
    }

    #[test]
    fn test_validation_missing_agent_key() {
        let cfg = Config {
            agent_key: String::new(),
            ..valid_config()
        };
        let err = cfg.validate().expect_err("missing agent key");
        assert!(err.to_string().contains("agent_key"));
    }

    #[test]
    fn test_validation_missing_app_name() {
        let cfg = Config {
            app_name: String::new(),
            ..valid_config()
        };
        let err = cfg.validate().expect_err("missing app name");
        assert!(err.to_string().contains("app_name"));
    }

    #[test]
    fn test_validation_dashboard_scheme() {
        let cfg = Config {
            dashboard_address: "localhost:5000".to_string(),
            ..valid_config()
        };
        let err = cfg.validate().expect_err("bad scheme");
        assert!(err.to_string().contains("dashboard_address"));
    }

    #[test]
    fn test_validation_span_longer_than_interval() {
        let cfg = Config {
            cpu: ProfilerConfig {
                max_span_duration: Some(Duration::from_secs(30)),
                ..Default::default()
            },
            ..valid_config()
        };
        let err = cfg.validate().expect_err("span too long");
        assert!(err.to_string().contains("cpu.span_interval"));
    }

    #[test]
    fn test_profiler_overrides_resolve() {
        let cfg = ProfilerConfig {
            max_span_count: Some(5),
            report_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let settings = cfg.resolve(ReporterSettings::allocation());
        assert_eq!(settings.max_span_count, 5);
        assert_eq!(settings.report_interval, Duration::from_secs(30));
        assert_eq!(settings.max_span_duration, Duration::from_secs(4));
        assert_eq!(settings.max_profile_duration, Duration::from_secs(20));
    }

    #[test]
    fn test_load_yaml() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"
agent_key: key1
app_name: MyApp
app_environment: staging
host_name: web-1
dashboard_address: https://collector.example.com
auto_profiling: false
cpu:
  enabled: false
async_calls:
  max_span_duration: 2s
queue:
  message_ttl: 5m
health:
  addr: ":9191"
"#
        )
        .expect("write config");

        let cfg = Config::load(file.path()).expect("load");
        assert_eq!(cfg.app_name, "MyApp");
        assert_eq!(cfg.host_name, "web-1");
        assert!(!cfg.auto_profiling);
        assert!(!cfg.cpu.enabled);
        assert!(cfg.allocation.enabled);
        assert_eq!(cfg.async_calls.max_span_duration, Some(Duration::from_secs(2)));
        assert_eq!(cfg.queue.message_ttl, Duration::from_secs(300));
        assert_eq!(cfg.queue.flush_interval, Duration::from_secs(5));
        assert_eq!(cfg.health.addr.as_deref(), Some(":9191"));

        let scope = cfg.metric_scope();
        assert_eq!(scope.app_environment, "staging");
        assert!(!cfg.queue_config().auto_profiling);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "app_name: only-name").expect("write config");

        let err = Config::load(file.path()).expect_err("invalid config");
        assert!(err.to_string().contains("agent_key"));
    }
}
