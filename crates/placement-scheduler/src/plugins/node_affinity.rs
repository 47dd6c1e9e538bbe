//! Node selector and node affinity.

use super::helper::{default_normalize_score, node_of, pod_matches_node_selector_and_affinity_terms};
use crate::error::Result;
use crate::framework::{
    CycleState, FilterPlugin, FrameworkHandle, NodeScore, Plugin, ScoreExtensions, ScorePlugin,
    Status, MAX_NODE_SCORE,
};
use crate::node_info::NodeInfo;
use placement_core::Pod;
use std::sync::Arc;

/// Registered name.
pub const NAME: &str = "NodeAffinity";

/// Failure reason.
pub const ERR_REASON: &str = "node(s) didn't match node selector";

/// Filters on `nodeSelector` plus required node affinity, and scores the
/// summed weight of matching preferred terms.
#[derive(Debug, Default)]
pub struct NodeAffinity;

impl Plugin for NodeAffinity {
    fn name(&self) -> &str {
        NAME
    }

    fn as_filter(&self) -> Option<&dyn FilterPlugin> {
        Some(self)
    }

    fn as_score(&self) -> Option<&dyn ScorePlugin> {
        Some(self)
    }
}

impl FilterPlugin for NodeAffinity {
    fn filter(&self, _state: &CycleState, pod: &Pod, node_info: &NodeInfo) -> Status {
        let node = match node_of(node_info) {
            Ok(node) => node,
            Err(status) => return status,
        };
        if pod_matches_node_selector_and_affinity_terms(pod, node) {
            Status::success()
        } else {
            Status::unresolvable(ERR_REASON)
        }
    }
}

impl ScorePlugin for NodeAffinity {
    fn score(&self, _state: &CycleState, pod: &Pod, node_info: &NodeInfo) -> std::result::Result<i64, Status> {
        let node = node_of(node_info)?;
        let Some(affinity) = pod.node_affinity() else {
            return Ok(0);
        };
        Ok(affinity
            .preferred
            .iter()
            .filter(|t| t.weight != 0 && t.preference.matches(node.name(), node.labels()))
            .map(|t| i64::from(t.weight))
            .sum())
    }

    fn score_extensions(&self) -> Option<&dyn ScoreExtensions> {
        Some(self)
    }
}

impl ScoreExtensions for NodeAffinity {
    fn normalize_score(&self, _state: &CycleState, _pod: &Pod, scores: &mut [NodeScore]) -> Status {
        default_normalize_score(MAX_NODE_SCORE, false, scores)
    }
}

/// Factory.
///
/// # Errors
///
/// Never fails.
pub fn new(_args: Option<&serde_json::Value>, _handle: &FrameworkHandle) -> Result<Arc<dyn Plugin>> {
    Ok(Arc::new(NodeAffinity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::Code;
    use crate::testing::{make_node, make_pod};

    #[test]
    fn filter_is_unresolvable_on_mismatch() {
        let info = NodeInfo::with_node(Arc::new(make_node("n1").label("zone", "a").obj()), []);
        let pod = make_pod("p").node_affinity_in("zone", &["b"]).obj();
        let status = NodeAffinity.filter(&CycleState::new(), &pod, &info);
        assert_eq!(status.code(), Code::UnschedulableAndUnresolvable);
        assert_eq!(status.reasons(), [ERR_REASON]);
    }

    #[test]
    fn preferred_terms_are_summed_and_normalized() {
        let pod = make_pod("p")
            .preferred_node_affinity(5, "zone", &["a"])
            .preferred_node_affinity(3, "disk", &["ssd"])
            .obj();
        let a = NodeInfo::with_node(Arc::new(make_node("a").label("zone", "a").label("disk", "ssd").obj()), []);
        let b = NodeInfo::with_node(Arc::new(make_node("b").label("disk", "ssd").obj()), []);
        let state = CycleState::new();

        let mut scores = vec![
            NodeScore {
                name: "a".into(),
                score: NodeAffinity.score(&state, &pod, &a).unwrap(),
            },
            NodeScore {
                name: "b".into(),
                score: NodeAffinity.score(&state, &pod, &b).unwrap(),
            },
        ];
        assert_eq!(scores[0].score, 8);
        assert_eq!(scores[1].score, 3);
        NodeAffinity.normalize_score(&state, &pod, &mut scores);
        assert_eq!(scores[0].score, 100);
        assert_eq!(scores[1].score, 37);
    }
}
