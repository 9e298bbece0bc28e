//! Native sampler collaborator interface.

use anyhow::Result;

use crate::breakdown::{Breakdown, BreakdownType};

use super::{frame_label, is_agent_frame};

/// Raw call-tree node produced by a native sampler.
#[derive(Debug, Clone, Default)]
pub struct ProfileNode {
    pub func_name: String,
    pub file_name: String,
    pub line_num: u32,
    pub col_num: u32,
    /// CPU samples that hit this frame.
    pub hit_count: u64,
    /// Bytes allocated at this frame.
    pub size: u64,
    /// Allocations at this frame.
    pub count: u64,
    pub children: Vec<ProfileNode>,
}

impl ProfileNode {
    pub fn new(func_name: &str, file_name: &str, line_num: u32, col_num: u32) -> Self {
        Self {
            func_name: func_name.to_string(),
            file_name: file_name.to_string(),
            line_num,
            col_num,
            ..Default::default()
        }
    }

    pub fn label(&self) -> String {
        frame_label(&self.func_name, &self.file_name, self.line_num, self.col_num)
    }

    pub fn is_agent_frame(&self) -> bool {
        !self.file_name.is_empty() && is_agent_frame(&self.func_name, &self.file_name)
    }
}

/// Captures CPU and allocation call trees. Implemented by the host runtime
/// integration; raw stack capture itself happens there.
pub trait NativeSampler: Send + Sync {
    fn start_cpu_profiler(&self) -> Result<()>;

    /// Stops CPU sampling and returns the collected tree, if any.
    fn stop_cpu_profiler(&self) -> Result<Option<ProfileNode>>;

    /// Whether allocation sampling is supported.
    fn check_allocation_sampler(&self) -> bool;

    fn start_allocation_sampler(&self) -> Result<()>;

    fn read_allocation_profile(&self) -> Result<Option<ProfileNode>>;

    fn stop_allocation_sampler(&self) -> Result<()>;
}

/// Sampler for hosts without native sampling support. Produces no data.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSampler;

impl NativeSampler for NullSampler {
    fn start_cpu_profiler(&self) -> Result<()> {
        Ok(())
    }

    fn stop_cpu_profiler(&self) -> Result<Option<ProfileNode>> {
        Ok(None)
    }

    fn check_allocation_sampler(&self) -> bool {
        false
    }

    fn start_allocation_sampler(&self) -> Result<()> {
        Ok(())
    }

    fn read_allocation_profile(&self) -> Result<Option<ProfileNode>> {
        Ok(None)
    }

    fn stop_allocation_sampler(&self) -> Result<()> {
        Ok(())
    }
}

/// Folds `nodes` into `parent` as callsite children, skipping agent frames
/// and their subtrees unless `include_agent_frames`. `update` attributes a
/// raw node to its breakdown node.
pub(crate) fn fold_nodes<F>(
    parent: &mut Breakdown,
    nodes: &[ProfileNode],
    include_agent_frames: bool,
    update: &mut F,
) where
    F: FnMut(&ProfileNode, &mut Breakdown),
{
    for node in nodes {
        if !include_agent_frames && node.is_agent_frame() {
            continue;
        }

        let child = parent.find_or_add_child(&node.label());
        child.set_type(BreakdownType::Callsite);
        update(node, child);

        fold_nodes(child, &node.children, include_agent_frames, update);
    }
}
