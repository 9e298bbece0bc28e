//! Profilers turning raw sampler output into call-graph [`Breakdown`]s.

pub mod allocation;
pub mod causality;
pub mod cpu;
pub mod native;

use std::time::Duration;

use anyhow::Result;

use crate::breakdown::Breakdown;

/// Path fragment identifying the agent's own source files.
const AGENT_FILE_MARKER: &str = "/stackpipe/src/";
/// Symbol prefix identifying the agent's own functions.
const AGENT_SYMBOL_PREFIX: &str = "stackpipe::";

/// Which profiler a reporter drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfilerKind {
    Cpu,
    Allocation,
    Async,
}

impl ProfilerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Allocation => "allocation",
            Self::Async => "async",
        }
    }
}

impl std::fmt::Display for ProfilerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One finalized profile ready to be wrapped into a metric.
#[derive(Debug, Clone)]
pub struct ProfileData {
    pub category: &'static str,
    pub name: &'static str,
    pub unit: &'static str,
    pub unit_interval: Option<f64>,
    pub profile: Breakdown,
}

/// A sampling activity that records into a call graph between
/// `start_profiler` and `stop_profiler` and is finalized by `build_profile`.
pub trait Profiler: Send {
    fn kind(&self) -> ProfilerKind;

    /// Whether the underlying sampler can run at all.
    fn available(&self) -> bool;

    /// Discards collected data and starts a fresh profile.
    fn reset(&mut self);

    fn start_profiler(&mut self) -> Result<()>;

    /// Ends the recording window and folds its samples into the profile.
    fn stop_profiler(&mut self) -> Result<()>;

    /// Finalizes the collected profile. `duration` is the total recording
    /// time since the last reset. The profile must be reset afterwards.
    fn build_profile(&mut self, duration: Duration) -> Vec<ProfileData>;
}

/// Whether a frame belongs to the agent itself.
pub fn is_agent_frame(function_name: &str, file_name: &str) -> bool {
    let symbol = function_name.strip_prefix('<').unwrap_or(function_name);
    symbol.starts_with(AGENT_SYMBOL_PREFIX) || file_name.contains(AGENT_FILE_MARKER)
}

/// Canonical frame label: `func (file:line:col)`, `func` alone without a
/// file, `unknown` when both are missing.
pub fn frame_label(function_name: &str, file_name: &str, line: u32, column: u32) -> String {
    match (function_name.is_empty(), file_name.is_empty()) {
        (true, true) => "unknown".to_string(),
        (_, true) => function_name.to_string(),
        _ => format!("{function_name} ({file_name}:{line}:{column})"),
    }
}
