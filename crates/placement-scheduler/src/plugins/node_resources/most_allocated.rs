//! Prefer the fullest nodes, for bin packing.

use super::names::MOST_ALLOCATED as NAME;
use super::{default_resources, resource_usage, validate_resources, weighted_score, ResourceSpec};
use crate::error::Result;
use crate::framework::{decode_args, CycleState, FrameworkHandle, Plugin, ScorePlugin, Status, MAX_NODE_SCORE};
use crate::node_info::NodeInfo;
use crate::plugins::helper::node_of;
use placement_core::Pod;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Args of [`MostAllocated`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeResourcesMostAllocatedArgs {
    /// Scored resources.
    pub resources: Vec<ResourceSpec>,
}

impl Default for NodeResourcesMostAllocatedArgs {
    fn default() -> Self {
        Self {
            resources: default_resources(),
        }
    }
}

/// Scores `requested * 100 / allocatable` per resource.
#[derive(Debug)]
pub struct MostAllocated {
    resources: Vec<ResourceSpec>,
}

fn most_requested_score(requested: i64, capacity: i64) -> i64 {
    if capacity == 0 || requested > capacity {
        return 0;
    }
    requested * MAX_NODE_SCORE / capacity
}

impl Plugin for MostAllocated {
    fn name(&self) -> &str {
        NAME
    }

    fn as_score(&self) -> Option<&dyn ScorePlugin> {
        Some(self)
    }
}

impl ScorePlugin for MostAllocated {
    fn score(&self, _state: &CycleState, pod: &Pod, node_info: &NodeInfo) -> std::result::Result<i64, Status> {
        node_of(node_info)?;
        let usage = resource_usage(pod, node_info, &self.resources);
        Ok(weighted_score(&usage, most_requested_score))
    }
}

/// Factory.
///
/// # Errors
///
/// Returns [`crate::error::SchedulerError::Config`] on bad args or weights.
pub fn new(args: Option<&serde_json::Value>, _handle: &FrameworkHandle) -> Result<Arc<dyn Plugin>> {
    let args: NodeResourcesMostAllocatedArgs = decode_args(NAME, args)?;
    validate_resources(&args.resources)?;
    Ok(Arc::new(MostAllocated {
        resources: args.resources,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Snapshot;
    use crate::testing::{make_node, make_pod, test_handle};
    use serde_json::json;

    fn node(name: &str, used_cpu: &str) -> NodeInfo {
        NodeInfo::with_node(
            Arc::new(make_node(name).capacity(&[("cpu", "4")]).obj()),
            [Arc::new(make_pod(&format!("{name}-used")).node(name).req(&[("cpu", used_cpu)]).obj())],
        )
    }

    #[test]
    fn fuller_node_scores_higher() {
        let handle = test_handle(Snapshot::new());
        let plugin = new(Some(&json!({"resources": [{"name": "cpu", "weight": 1}]})), &handle).unwrap();
        let scorer = plugin.as_score().unwrap();
        let pod = make_pod("p").req(&[("cpu", "500m")]).obj();
        let state = CycleState::new();

        assert_eq!(scorer.score(&state, &pod, &node("a", "3000m")).unwrap(), 87);
        assert_eq!(scorer.score(&state, &pod, &node("b", "1000m")).unwrap(), 37);
    }

    #[test]
    fn zero_weight_is_rejected() {
        let handle = test_handle(Snapshot::new());
        assert!(new(Some(&json!({"resources": [{"name": "cpu", "weight": 0}]})), &handle).is_err());
    }
}
