//! In-process profiling agent: call-graph aggregation, a randomized
//! sampling scheduler and resilient delivery to a collector.

pub mod agent;
pub mod api;
pub mod breakdown;
pub mod config;
pub mod health;
pub mod lock;
pub mod metric;
pub mod profilers;
pub mod queue;
pub mod reporters;
pub mod scheduler;

pub use agent::{Agent, Collaborators, ProfileSpan};
pub use config::Config;

/// Build-time version info.
pub mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}
