//! Collector HTTP client.

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;

/// Request timeout for every collector call.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

const RUNTIME_TYPE: &str = "rust";
/// Version of the compiler that built the agent, injected by build.rs.
const RUNTIME_VERSION: &str = env!("STACKPIPE_RUSTC_VERSION");
const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Collector protocol failures.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("collector returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("decoding collector response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Delivers a JSON payload to a named collector endpoint.
pub trait Transport: Send + Sync {
    fn post(
        &self,
        endpoint: &str,
        payload: serde_json::Value,
    ) -> impl std::future::Future<Output = Result<serde_json::Value>> + Send;
}

/// Envelope wrapped around every payload.
#[derive(Serialize)]
struct Envelope<'a> {
    runtime_type: &'static str,
    runtime_version: &'static str,
    agent_version: &'static str,
    app_name: &'a str,
    app_version: &'a str,
    app_environment: &'a str,
    host_name: &'a str,
    process_id: u32,
    run_id: &'a str,
    run_ts: i64,
    sent_at: i64,
    payload: serde_json::Value,
}

/// Gzip JSON client for `{dashboard_address}/agent/v1/{endpoint}`.
pub struct ApiClient {
    http: reqwest::Client,
    dashboard_address: String,
    agent_key: String,
    app_name: String,
    app_version: String,
    app_environment: String,
    host_name: String,
    run_id: String,
    run_ts: i64,
}

impl ApiClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            dashboard_address: cfg.dashboard_address.trim_end_matches('/').to_string(),
            agent_key: cfg.agent_key.clone(),
            app_name: cfg.app_name.clone(),
            app_version: cfg.app_version.clone(),
            app_environment: cfg.app_environment.clone(),
            host_name: cfg.host_name.clone(),
            run_id: uuid::Uuid::new_v4().to_string(),
            run_ts: chrono::Utc::now().timestamp(),
        })
    }

    /// Identifier of this agent run, sent with every request.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn envelope(&self, payload: serde_json::Value) -> Envelope<'_> {
        Envelope {
            runtime_type: RUNTIME_TYPE,
            runtime_version: RUNTIME_VERSION,
            agent_version: AGENT_VERSION,
            app_name: &self.app_name,
            app_version: &self.app_version,
            app_environment: &self.app_environment,
            host_name: &self.host_name,
            process_id: std::process::id(),
            run_id: &self.run_id,
            run_ts: self.run_ts,
            sent_at: chrono::Utc::now().timestamp(),
            payload,
        }
    }
}

impl Transport for ApiClient {
    async fn post(&self, endpoint: &str, payload: serde_json::Value) -> Result<serde_json::Value> {
        let start = std::time::Instant::now();
        let url = format!("{}/agent/v1/{}", self.dashboard_address, endpoint);

        let body = serde_json::to_vec(&self.envelope(payload)).context("encoding request")?;
        let body = compress_gzip(&body)?;

        let response = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Content-Encoding", "gzip")
            .header("Accept-Encoding", "gzip")
            .basic_auth(&self.agent_key, Some(""))
            .body(body)
            .send()
            .await
            .with_context(|| format!("requesting {endpoint}"))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("reading response from {endpoint}"))?;

        debug!(
            endpoint,
            status = status.as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "collector request finished",
        );

        if status != reqwest::StatusCode::OK {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            }
            .into());
        }

        let value = serde_json::from_slice(&bytes).map_err(ApiError::from)?;

        Ok(value)
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}
