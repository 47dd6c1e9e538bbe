//! Node taints against pod tolerations.

use super::helper::{default_normalize_score, node_of, state_error};
use crate::error::Result;
use crate::framework::{
    CycleState, FilterPlugin, FrameworkHandle, NodeScore, Plugin, PreScorePlugin, ScoreExtensions,
    ScorePlugin, Status, MAX_NODE_SCORE,
};
use crate::node_info::NodeInfo;
use placement_core::{find_untolerated_taint, tolerations_tolerate_taint, Pod, TaintEffect, Toleration};
use std::sync::Arc;

/// Registered name.
pub const NAME: &str = "TaintToleration";

const PRE_SCORE_STATE_KEY: &str = "PreScoreTaintToleration";

#[derive(Debug)]
struct PreScoreState {
    tolerations_prefer_no_schedule: Vec<Toleration>,
}

/// Filters on untolerated `NoSchedule`/`NoExecute` taints and prefers nodes
/// with fewer untolerated `PreferNoSchedule` taints.
#[derive(Debug, Default)]
pub struct TaintToleration;

impl Plugin for TaintToleration {
    fn name(&self) -> &str {
        NAME
    }

    fn as_filter(&self) -> Option<&dyn FilterPlugin> {
        Some(self)
    }

    fn as_pre_score(&self) -> Option<&dyn PreScorePlugin> {
        Some(self)
    }

    fn as_score(&self) -> Option<&dyn ScorePlugin> {
        Some(self)
    }
}

impl FilterPlugin for TaintToleration {
    fn filter(&self, _state: &CycleState, pod: &Pod, node_info: &NodeInfo) -> Status {
        let node = match node_of(node_info) {
            Ok(node) => node,
            Err(_) => return Status::error("invalid nodeInfo"),
        };
        let untolerated = find_untolerated_taint(&node.spec.taints, &pod.spec.tolerations, |t| {
            matches!(t.effect, TaintEffect::NoSchedule | TaintEffect::NoExecute)
        });
        match untolerated {
            None => Status::success(),
            Some(taint) => Status::unresolvable(format!(
                "node(s) had taint {{{}: {}}}, that the pod didn't tolerate",
                taint.key, taint.value
            )),
        }
    }
}

impl PreScorePlugin for TaintToleration {
    fn pre_score(&self, state: &CycleState, pod: &Pod, nodes: &[Arc<NodeInfo>]) -> Status {
        if nodes.is_empty() {
            return Status::success();
        }
        let tolerations_prefer_no_schedule = pod
            .spec
            .tolerations
            .iter()
            .filter(|t| matches!(t.effect, None | Some(TaintEffect::PreferNoSchedule)))
            .cloned()
            .collect();
        state.write(
            PRE_SCORE_STATE_KEY,
            PreScoreState {
                tolerations_prefer_no_schedule,
            },
        );
        Status::success()
    }
}

impl ScorePlugin for TaintToleration {
    fn score(&self, state: &CycleState, _pod: &Pod, node_info: &NodeInfo) -> std::result::Result<i64, Status> {
        let node = node_of(node_info)?;
        let s = state
            .read::<PreScoreState>(PRE_SCORE_STATE_KEY)
            .map_err(|e| state_error(PRE_SCORE_STATE_KEY, &e))?;
        let intolerable = node
            .spec
            .taints
            .iter()
            .filter(|t| t.effect == TaintEffect::PreferNoSchedule)
            .filter(|t| !tolerations_tolerate_taint(&s.tolerations_prefer_no_schedule, t))
            .count();
        Ok(i64::try_from(intolerable).unwrap_or(i64::MAX))
    }

    fn score_extensions(&self) -> Option<&dyn ScoreExtensions> {
        Some(self)
    }
}

impl ScoreExtensions for TaintToleration {
    fn normalize_score(&self, _state: &CycleState, _pod: &Pod, scores: &mut [NodeScore]) -> Status {
        default_normalize_score(MAX_NODE_SCORE, true, scores)
    }
}

/// Factory.
///
/// # Errors
///
/// Never fails.
pub fn new(_args: Option<&serde_json::Value>, _handle: &FrameworkHandle) -> Result<Arc<dyn Plugin>> {
    Ok(Arc::new(TaintToleration))
}
