use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::breakdown::{Breakdown, BreakdownType};
use crate::metric::{CATEGORY_MEMORY_PROFILE, NAME_HEAP_ALLOCATION_RATE, UNIT_BYTE};

use super::native::{fold_nodes, NativeSampler};
use super::{ProfileData, Profiler, ProfilerKind};

/// Minimum allocation rate, bytes per second, for frames below the top level.
const MIN_RATE: f64 = 1000.0;

/// Heap allocation rate call graph, bytes per second.
pub struct AllocationProfiler {
    sampler: Arc<dyn NativeSampler>,
    include_agent_frames: bool,
    profile: Breakdown,
}

impl AllocationProfiler {
    pub fn new(sampler: Arc<dyn NativeSampler>, include_agent_frames: bool) -> Self {
        Self {
            sampler,
            include_agent_frames,
            profile: empty_profile(),
        }
    }
}

fn empty_profile() -> Breakdown {
    Breakdown::with_type("Allocation call graph", BreakdownType::Callgraph)
}

impl Profiler for AllocationProfiler {
    fn kind(&self) -> ProfilerKind {
        ProfilerKind::Allocation
    }

    fn available(&self) -> bool {
        self.sampler.check_allocation_sampler()
    }

    fn reset(&mut self) {
        self.profile = empty_profile();
    }

    fn start_profiler(&mut self) -> Result<()> {
        self.sampler
            .start_allocation_sampler()
            .context("starting allocation sampler")
    }

    fn stop_profiler(&mut self) -> Result<()> {
        let root = self.sampler.read_allocation_profile();
        let stopped = self.sampler.stop_allocation_sampler();

        if let Some(root) = root.context("reading allocation profile")? {
            fold_nodes(
                &mut self.profile,
                &root.children,
                self.include_agent_frames,
                &mut |node, child| child.increment(node.size as f64, node.count),
            );
        }

        stopped.context("stopping allocation sampler")
    }

    fn build_profile(&mut self, duration: Duration) -> Vec<ProfileData> {
        let mut profile = std::mem::replace(&mut self.profile, empty_profile());
        profile.normalize(duration.as_secs_f64());
        profile.propagate();
        profile.floor();
        profile.filter(2, MIN_RATE, f64::INFINITY);

        vec![ProfileData {
            category: CATEGORY_MEMORY_PROFILE,
            name: NAME_HEAP_ALLOCATION_RATE,
            unit: UNIT_BYTE,
            unit_interval: Some(1.0),
            profile,
        }]
    }
}
