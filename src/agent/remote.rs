//! Remote enable/disable switches fetched from the collector.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::Transport;
use crate::config::RemoteConfigSettings;
use crate::health::HealthMetrics;

const ENABLED: &str = "yes";

/// Switches returned by the `config` endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteConfig {
    pub agent_enabled: bool,
    pub profiling_disabled: bool,
}

impl RemoteConfig {
    /// Anything but the literal "yes" reads as off.
    pub fn from_response(value: &serde_json::Value) -> Result<Self> {
        let Some(fields) = value.as_object() else {
            bail!("remote config is not an object: {value}");
        };

        let switch = |key: &str| fields.get(key).and_then(serde_json::Value::as_str) == Some(ENABLED);

        Ok(Self {
            agent_enabled: switch("agent_enabled"),
            profiling_disabled: switch("profiling_disabled"),
        })
    }

    /// Whether the profile and span reporters should run.
    pub fn profiling_active(&self) -> bool {
        self.agent_enabled && !self.profiling_disabled
    }
}

/// Fetches [`RemoteConfig`], rate limited in manual mode.
pub struct ConfigLoader {
    settings: RemoteConfigSettings,
    auto_profiling: bool,
    last_load: Mutex<Option<Instant>>,
    health: Option<Arc<HealthMetrics>>,
}

impl ConfigLoader {
    pub fn new(settings: RemoteConfigSettings, auto_profiling: bool) -> Self {
        Self {
            settings,
            auto_profiling,
            last_load: Mutex::new(None),
            health: None,
        }
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn load_delay(&self) -> Duration {
        self.settings.load_delay
    }

    pub fn load_interval(&self) -> Duration {
        self.settings.load_interval
    }

    /// Posts to the `config` endpoint. Returns `None` when skipped because
    /// a manual-mode load happened less than one interval ago.
    pub async fn load<T: Transport>(&self, transport: &T) -> Result<Option<RemoteConfig>> {
        {
            let mut last_load = self.last_load.lock();
            let now = Instant::now();
            if !self.auto_profiling {
                if let Some(last) = *last_load {
                    if now.duration_since(last) < self.settings.load_interval {
                        debug!("remote config loaded recently, skipping");
                        return Ok(None);
                    }
                }
            }
            *last_load = Some(now);
        }

        let result = match transport.post("config", serde_json::json!({})).await {
            Ok(value) => RemoteConfig::from_response(&value),
            Err(e) => Err(e),
        };

        match result {
            Ok(config) => {
                debug!(
                    agent_enabled = config.agent_enabled,
                    profiling_disabled = config.profiling_disabled,
                    "loaded remote config",
                );
                Ok(Some(config))
            }
            Err(e) => {
                if let Some(health) = &self.health {
                    health.config_load_failures.inc();
                }
                warn!(error = %e, "loading remote config failed");
                Err(e.context("loading remote config"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct StaticTransport {
        response: Option<serde_json::Value>,
        calls: AtomicUsize,
    }

    impl Transport for StaticTransport {
        async fn post(&self, endpoint: &str, payload: serde_json::Value) -> Result<serde_json::Value> {
            assert_eq!(endpoint, "config");
            assert_eq!(payload, serde_json::json!({}));
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.response
                .clone()
                .ok_or_else(|| anyhow::anyhow!("connection refused"))
        }
    }

    fn transport(response: Option<serde_json::Value>) -> StaticTransport {
        StaticTransport {
            response,
            calls: AtomicUsize::new(0),
        }
    }

    #[test]
    fn test_from_response() {
        let cfg = RemoteConfig::from_response(
            &serde_json::json!({"agent_enabled": "yes", "profiling_disabled": "no"}),
        )
        .expect("decode");
        assert!(cfg.agent_enabled);
        assert!(!cfg.profiling_disabled);
        assert!(cfg.profiling_active());

        let cfg = RemoteConfig::from_response(&serde_json::json!({"agent_enabled": true}))
            .expect("decode");
        assert_eq!(cfg, RemoteConfig::default());

        let cfg = RemoteConfig::from_response(
            &serde_json::json!({"agent_enabled": "yes", "profiling_disabled": "yes"}),
        )
        .expect("decode");
        assert!(!cfg.profiling_active());

        assert!(RemoteConfig::from_response(&serde_json::json!("yes")).is_err());
    }

    #[tokio::test]
    async fn test_load_failure_is_reported() {
        let health = Arc::new(HealthMetrics::new().expect("health"));
        let loader = ConfigLoader::new(RemoteConfigSettings::default(), true).with_health(Arc::clone(&health));

        let err = loader.load(&transport(None)).await.expect_err("failure");
        assert!(err.to_string().contains("loading remote config"));
        assert_eq!(health.config_load_failures.get(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_mode_rate_limited() {
        let t = transport(Some(serde_json::json!({"agent_enabled": "yes"})));
        let loader = ConfigLoader::new(RemoteConfigSettings::default(), false);

        assert!(loader.load(&t).await.expect("first").is_some());
        assert!(loader.load(&t).await.expect("second").is_none());
        assert_eq!(t.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(loader.load(&t).await.expect("third").is_some());
        assert_eq!(t.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_auto_mode_not_rate_limited() {
        let t = transport(Some(serde_json::json!({})));
        let loader = ConfigLoader::new(RemoteConfigSettings::default(), true);

        for _ in 0..3 {
            assert!(loader.load(&t).await.expect("load").is_some());
        }
        assert_eq!(t.calls.load(Ordering::SeqCst), 3);
    }
}
