use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::breakdown::{Breakdown, BreakdownType};
use crate::metric::{CATEGORY_CPU_PROFILE, NAME_CPU_USAGE, UNIT_PERCENT};

use super::native::{NativeSampler, ProfileNode};
use super::{ProfileData, Profiler, ProfilerKind};

/// Root frame the native sampler uses for time spent outside user code.
const PROGRAM_FRAME: &str = "(program)";

/// CPU usage call graph, as a percentage of all samples taken.
pub struct CpuProfiler {
    sampler: Arc<dyn NativeSampler>,
    include_agent_frames: bool,
    profile: Breakdown,
    profile_samples: u64,
}

impl CpuProfiler {
    pub fn new(sampler: Arc<dyn NativeSampler>, include_agent_frames: bool) -> Self {
        Self {
            sampler,
            include_agent_frames,
            profile: empty_profile(),
            profile_samples: 0,
        }
    }

    /// Every visited node counts towards the total, including frames that
    /// are then dropped; their descendants are not visited.
    fn update_profile(&mut self, nodes: &[ProfileNode]) {
        let include_agent_frames = self.include_agent_frames;
        let mut total = 0;
        fold(&mut self.profile, nodes, include_agent_frames, &mut total);
        self.profile_samples += total;
    }
}

fn fold(parent: &mut Breakdown, nodes: &[ProfileNode], include_agent_frames: bool, total: &mut u64) {
    for node in nodes {
        *total += node.hit_count;

        if node.func_name == PROGRAM_FRAME {
            continue;
        }

        if !include_agent_frames && node.is_agent_frame() {
            continue;
        }

        let child = parent.find_or_add_child(&node.label());
        child.set_type(BreakdownType::Callsite);
        child.num_samples += node.hit_count;

        fold(child, &node.children, include_agent_frames, total);
    }
}

fn empty_profile() -> Breakdown {
    Breakdown::with_type("CPU call graph", BreakdownType::Callgraph)
}

impl Profiler for CpuProfiler {
    fn kind(&self) -> ProfilerKind {
        ProfilerKind::Cpu
    }

    fn available(&self) -> bool {
        true
    }

    fn reset(&mut self) {
        self.profile = empty_profile();
        self.profile_samples = 0;
    }

    fn start_profiler(&mut self) -> Result<()> {
        self.sampler
            .start_cpu_profiler()
            .context("starting CPU profiler")
    }

    fn stop_profiler(&mut self) -> Result<()> {
        let root = self
            .sampler
            .stop_cpu_profiler()
            .context("stopping CPU profiler")?;

        if let Some(root) = root {
            self.update_profile(&root.children);
        }

        Ok(())
    }

    fn build_profile(&mut self, _duration: Duration) -> Vec<ProfileData> {
        let mut profile = std::mem::replace(&mut self.profile, empty_profile());
        profile.propagate();
        profile.evaluate_percent(self.profile_samples);
        profile.filter(2, 1.0, 100.0);

        vec![ProfileData {
            category: CATEGORY_CPU_PROFILE,
            name: NAME_CPU_USAGE,
            unit: UNIT_PERCENT,
            unit_interval: None,
            profile,
        }]
    }
}
