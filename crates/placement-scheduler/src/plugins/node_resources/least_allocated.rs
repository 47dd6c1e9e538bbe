//! Prefer nodes with the most room left.

use super::names::LEAST_ALLOCATED as NAME;
use super::{default_resources, resource_usage, validate_resources, weighted_score, ResourceSpec};
use crate::error::Result;
use crate::framework::{decode_args, CycleState, FrameworkHandle, Plugin, ScorePlugin, Status, MAX_NODE_SCORE};
use crate::node_info::NodeInfo;
use crate::plugins::helper::node_of;
use placement_core::Pod;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Args of [`LeastAllocated`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeResourcesLeastAllocatedArgs {
    /// Scored resources.
    pub resources: Vec<ResourceSpec>,
}

impl Default for NodeResourcesLeastAllocatedArgs {
    fn default() -> Self {
        Self {
            resources: default_resources(),
        }
    }
}

/// Scores `(allocatable - requested) * 100 / allocatable` per resource.
#[derive(Debug)]
pub struct LeastAllocated {
    resources: Vec<ResourceSpec>,
}

fn least_requested_score(requested: i64, capacity: i64) -> i64 {
    if capacity == 0 || requested > capacity {
        return 0;
    }
    (capacity - requested) * MAX_NODE_SCORE / capacity
}

impl Plugin for LeastAllocated {
    fn name(&self) -> &str {
        NAME
    }

    fn as_score(&self) -> Option<&dyn ScorePlugin> {
        Some(self)
    }
}

impl ScorePlugin for LeastAllocated {
    fn score(&self, _state: &CycleState, pod: &Pod, node_info: &NodeInfo) -> std::result::Result<i64, Status> {
        node_of(node_info)?;
        let usage = resource_usage(pod, node_info, &self.resources);
        Ok(weighted_score(&usage, least_requested_score))
    }
}

/// Factory.
///
/// # Errors
///
/// Returns [`crate::error::SchedulerError::Config`] on bad args or weights.
pub fn new(args: Option<&serde_json::Value>, _handle: &FrameworkHandle) -> Result<Arc<dyn Plugin>> {
    let args: NodeResourcesLeastAllocatedArgs = decode_args(NAME, args)?;
    validate_resources(&args.resources)?;
    Ok(Arc::new(LeastAllocated {
        resources: args.resources,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{make_node, make_pod};

    #[test]
    fn emptier_node_scores_higher() {
        let plugin = LeastAllocated {
            resources: default_resources(),
        };
        let pod = make_pod("p").req(&[("cpu", "1"), ("memory", "1Gi")]).obj();
        let busy = NodeInfo::with_node(
            Arc::new(make_node("busy").capacity(&[("cpu", "4"), ("memory", "4Gi")]).obj()),
            [Arc::new(make_pod("e").node("busy").req(&[("cpu", "2"), ("memory", "2Gi")]).obj())],
        );
        let idle = NodeInfo::with_node(
            Arc::new(make_node("idle").capacity(&[("cpu", "4"), ("memory", "4Gi")]).obj()),
            [],
        );
        let state = CycleState::new();
        // (4-3)/4 and (4-1)/4 on both resources.
        assert_eq!(plugin.score(&state, &pod, &busy).unwrap(), 25);
        assert_eq!(plugin.score(&state, &pod, &idle).unwrap(), 75);
    }

    #[test]
    fn over_capacity_scores_zero() {
        assert_eq!(least_requested_score(5, 4), 0);
        assert_eq!(least_requested_score(1, 0), 0);
    }
}
