use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics describing the agent's own pipeline.
///
/// All metrics use the "stackpipe" namespace.
pub struct HealthMetrics {
    registry: Registry,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Messages appended to the outgoing queue.
    pub messages_queued: Counter,
    /// Messages accepted by the collector.
    pub messages_uploaded: Counter,
    /// Messages dropped by TTL expiry.
    pub messages_expired: Counter,
    /// Failed upload attempts.
    pub upload_failures: Counter,
    /// Messages currently waiting for upload.
    pub queue_length: Gauge,
    /// Current upload backoff in seconds.
    pub upload_backoff_seconds: Gauge,
    /// Async lifecycle samples dropped after the per-window limit.
    pub samples_dropped: Counter,
    /// Recording windows opened, by profiler.
    pub recordings: CounterVec,
    /// Profiles reported, by profiler.
    pub profiles_reported: CounterVec,
    /// Remote config fetch failures.
    pub config_load_failures: Counter,
}

impl HealthMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let messages_queued = Counter::with_opts(
            Opts::new("messages_queued_total", "Total messages added to the upload queue.")
                .namespace("stackpipe"),
        )?;
        let messages_uploaded = Counter::with_opts(
            Opts::new(
                "messages_uploaded_total",
                "Total messages accepted by the collector.",
            )
            .namespace("stackpipe"),
        )?;
        let messages_expired = Counter::with_opts(
            Opts::new(
                "messages_expired_total",
                "Total messages dropped after exceeding their TTL.",
            )
            .namespace("stackpipe"),
        )?;
        let upload_failures = Counter::with_opts(
            Opts::new("upload_failures_total", "Total failed upload attempts.")
                .namespace("stackpipe"),
        )?;
        let queue_length = Gauge::with_opts(
            Opts::new("queue_length", "Messages waiting for upload.").namespace("stackpipe"),
        )?;
        let upload_backoff_seconds = Gauge::with_opts(
            Opts::new("upload_backoff_seconds", "Current upload backoff in seconds.")
                .namespace("stackpipe"),
        )?;
        let samples_dropped = Counter::with_opts(
            Opts::new(
                "async_samples_dropped_total",
                "Async lifecycle samples dropped after the per-window limit.",
            )
            .namespace("stackpipe"),
        )?;
        let recordings = CounterVec::new(
            Opts::new("recordings_total", "Recording windows opened by profiler.")
                .namespace("stackpipe"),
            &["profiler"],
        )?;
        let profiles_reported = CounterVec::new(
            Opts::new("profiles_reported_total", "Profiles reported by profiler.")
                .namespace("stackpipe"),
            &["profiler"],
        )?;
        let config_load_failures = Counter::with_opts(
            Opts::new(
                "config_load_failures_total",
                "Total failed remote config fetches.",
            )
            .namespace("stackpipe"),
        )?;

        registry.register(Box::new(messages_queued.clone()))?;
        registry.register(Box::new(messages_uploaded.clone()))?;
        registry.register(Box::new(messages_expired.clone()))?;
        registry.register(Box::new(upload_failures.clone()))?;
        registry.register(Box::new(queue_length.clone()))?;
        registry.register(Box::new(upload_backoff_seconds.clone()))?;
        registry.register(Box::new(samples_dropped.clone()))?;
        registry.register(Box::new(recordings.clone()))?;
        registry.register(Box::new(profiles_reported.clone()))?;
        registry.register(Box::new(config_load_failures.clone()))?;

        Ok(Self {
            registry,
            shutdown: parking_lot::Mutex::new(None),
            messages_queued,
            messages_uploaded,
            messages_expired,
            upload_failures,
            queue_length,
            upload_backoff_seconds,
            samples_dropped,
            recordings,
            profiles_reported,
            config_load_failures,
        })
    }

    /// Renders the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz on `addr`.
    /// Returns the bound address.
    pub async fn start(&self, addr: &str) -> Result<SocketAddr> {
        // ":port" shorthand binds all interfaces.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

struct AppState {
    registry: Registry,
}

fn encode(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_namespaced_metrics() {
        let health = HealthMetrics::new().expect("health");
        health.messages_queued.inc_by(3.0);
        health.recordings.with_label_values(&["cpu"]).inc();

        let text = health.render().expect("render");
        assert!(text.contains("stackpipe_messages_queued_total 3"));
        assert!(text.contains("stackpipe_recordings_total{profiler=\"cpu\"} 1"));
    }

    #[tokio::test]
    async fn test_server_serves_metrics() {
        let health = HealthMetrics::new().expect("health");
        health.upload_failures.inc();

        let addr = health.start("127.0.0.1:0").await.expect("start");

        let client = reqwest::Client::new();
        let body = client
            .get(format!("http://{addr}/metrics"))
            .send()
            .await
            .expect("request")
            .text()
            .await
            .expect("body");
        assert!(body.contains("stackpipe_upload_failures_total 1"));

        let ok = client
            .get(format!("http://{addr}/healthz"))
            .send()
            .await
            .expect("request")
            .text()
            .await
            .expect("body");
        assert_eq!(ok, "ok");

        health.stop();
    }
}
