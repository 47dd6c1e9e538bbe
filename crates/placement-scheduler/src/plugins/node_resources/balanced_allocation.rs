//! Prefer nodes whose CPU and memory would stay in step.

use super::names::BALANCED_ALLOCATION as NAME;
use super::{default_resources, resource_usage};
use crate::error::Result;
use crate::framework::{CycleState, FrameworkHandle, Plugin, ScorePlugin, Status, MAX_NODE_SCORE};
use crate::node_info::NodeInfo;
use crate::plugins::helper::node_of;
use placement_core::Pod;
use std::sync::Arc;

/// Scores `(1 - |cpu fraction - memory fraction|) * 100`, or 0 when either
/// resource would be fully used.
#[derive(Debug, Default)]
pub struct BalancedAllocation;

fn fraction(requested: i64, capacity: i64) -> f64 {
    if capacity == 0 {
        return 1.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let f = requested as f64 / capacity as f64;
    f
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn balanced_score(cpu_fraction: f64, memory_fraction: f64) -> i64 {
    if cpu_fraction >= 1.0 || memory_fraction >= 1.0 {
        return 0;
    }
    let diff = (cpu_fraction - memory_fraction).abs();
    ((1.0 - diff) * MAX_NODE_SCORE as f64) as i64
}

impl Plugin for BalancedAllocation {
    fn name(&self) -> &str {
        NAME
    }

    fn as_score(&self) -> Option<&dyn ScorePlugin> {
        Some(self)
    }
}

impl ScorePlugin for BalancedAllocation {
    fn score(&self, _state: &CycleState, pod: &Pod, node_info: &NodeInfo) -> std::result::Result<i64, Status> {
        node_of(node_info)?;
        let usage = resource_usage(pod, node_info, &default_resources());
        let cpu = fraction(usage[0].requested, usage[0].allocatable);
        let memory = fraction(usage[1].requested, usage[1].allocatable);
        Ok(balanced_score(cpu, memory))
    }
}

/// Factory.
///
/// # Errors
///
/// Never fails.
pub fn new(_args: Option<&serde_json::Value>, _handle: &FrameworkHandle) -> Result<Arc<dyn Plugin>> {
    Ok(Arc::new(BalancedAllocation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{make_node, make_pod};

    fn node(cpu: &str, memory: &str) -> NodeInfo {
        NodeInfo::with_node(
            Arc::new(make_node("n").capacity(&[("cpu", cpu), ("memory", memory)]).obj()),
            [],
        )
    }

    #[test]
    fn balanced_usage_scores_high() {
        let pod = make_pod("p").req(&[("cpu", "1"), ("memory", "1Gi")]).obj();
        let state = CycleState::new();
        assert_eq!(BalancedAllocation.score(&state, &pod, &node("4", "4Gi")).unwrap(), 100);
        // cpu 1/2, memory 1/4.
        assert_eq!(BalancedAllocation.score(&state, &pod, &node("2", "4Gi")).unwrap(), 75);
    }

    #[test]
    fn full_resource_scores_zero() {
        let pod = make_pod("p").req(&[("cpu", "2"), ("memory", "1Gi")]).obj();
        assert_eq!(BalancedAllocation.score(&CycleState::new(), &pod, &node("2", "4Gi")).unwrap(), 0);
        assert_eq!(balanced_score(fraction(1, 0), 0.1), 0);
    }
}
