//! Spread pods of the same group across nodes and zones.

use super::helper::{count_pods_match_selector, default_selector, state_error};
use crate::error::Result;
use crate::framework::{
    CycleState, FrameworkHandle, NodeScore, Plugin, PreScorePlugin, ScoreExtensions, ScorePlugin,
    Status, MAX_NODE_SCORE,
};
use crate::node_info::NodeInfo;
use placement_core::{zone_key, LabelSelector, Pod};
use std::collections::HashMap;
use std::sync::Arc;

/// Registered name.
pub const NAME: &str = "SelectorSpread";

const PRE_SCORE_STATE_KEY: &str = "PreScoreSelectorSpread";

/// Share of the final score decided by the zone spread.
const ZONE_WEIGHTING: f64 = 2.0 / 3.0;

#[derive(Debug)]
struct PreScoreState {
    selector: LabelSelector,
}

/// Prefers nodes, and zones, with fewer pods matching the incoming pod's
/// labels. Stands aside for pods with explicit spread constraints.
#[derive(Debug)]
pub struct SelectorSpread {
    handle: FrameworkHandle,
}

fn skip(pod: &Pod) -> bool {
    !pod.spec.topology_spread_constraints.is_empty()
}

impl Plugin for SelectorSpread {
    fn name(&self) -> &str {
        NAME
    }

    fn as_pre_score(&self) -> Option<&dyn PreScorePlugin> {
        Some(self)
    }

    fn as_score(&self) -> Option<&dyn ScorePlugin> {
        Some(self)
    }
}

impl PreScorePlugin for SelectorSpread {
    fn pre_score(&self, state: &CycleState, pod: &Pod, _nodes: &[Arc<NodeInfo>]) -> Status {
        if !skip(pod) {
            state.write(
                PRE_SCORE_STATE_KEY,
                PreScoreState {
                    selector: default_selector(pod),
                },
            );
        }
        Status::success()
    }
}

impl ScorePlugin for SelectorSpread {
    fn score(&self, state: &CycleState, pod: &Pod, node_info: &NodeInfo) -> std::result::Result<i64, Status> {
        if skip(pod) {
            return Ok(0);
        }
        let s = state
            .read::<PreScoreState>(PRE_SCORE_STATE_KEY)
            .map_err(|e| state_error(PRE_SCORE_STATE_KEY, &e))?;
        if s.selector.is_empty() {
            return Ok(0);
        }
        let count = count_pods_match_selector(node_info, &s.selector, pod.namespace());
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    fn score_extensions(&self) -> Option<&dyn ScoreExtensions> {
        Some(self)
    }
}

impl ScoreExtensions for SelectorSpread {
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn normalize_score(&self, _state: &CycleState, pod: &Pod, scores: &mut [NodeScore]) -> Status {
        if skip(pod) {
            return Status::success();
        }
        let snapshot = self.handle.snapshot();
        let mut zones: Vec<String> = Vec::with_capacity(scores.len());
        for s in scores.iter() {
            let Some(node) = snapshot.get(&s.name).and_then(|i| i.node()) else {
                return Status::error(format!("node {:?} not found in snapshot", s.name));
            };
            zones.push(zone_key(node.labels()));
        }

        let mut counts_by_zone: HashMap<&str, i64> = HashMap::new();
        for (s, zone) in scores.iter().zip(&zones) {
            if !zone.is_empty() {
                *counts_by_zone.entry(zone.as_str()).or_default() += s.score;
            }
        }
        let max_by_node = scores.iter().map(|s| s.score).max().unwrap_or(0).max(0);
        let max_by_zone = counts_by_zone.values().copied().max().unwrap_or(0).max(0);
        let max_score = MAX_NODE_SCORE as f64;

        for (s, zone) in scores.iter_mut().zip(&zones) {
            let mut f = if max_by_node > 0 {
                max_score * ((max_by_node - s.score) as f64 / max_by_node as f64)
            } else {
                max_score
            };
            if let Some(&zone_count) = counts_by_zone.get(zone.as_str()) {
                let zone_score = if max_by_zone > 0 {
                    max_score * ((max_by_zone - zone_count) as f64 / max_by_zone as f64)
                } else {
                    max_score
                };
                f = f * (1.0 - ZONE_WEIGHTING) + ZONE_WEIGHTING * zone_score;
            }
            s.score = f as i64;
        }
        Status::success()
    }
}

/// Factory.
///
/// # Errors
///
/// Never fails.
pub fn new(_args: Option<&serde_json::Value>, handle: &FrameworkHandle) -> Result<Arc<dyn Plugin>> {
    Ok(Arc::new(SelectorSpread {
        handle: handle.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Snapshot;
    use crate::testing::{make_node, make_pod, test_handle};
    use placement_core::{LabelSelector, UnsatisfiableConstraintAction};

    fn run(pod: &Pod, pods: &[Pod], nodes: &[placement_core::Node]) -> HashMap<String, i64> {
        let snapshot = Snapshot::from_objects(pods, nodes);
        let p = new(None, &test_handle(Snapshot::from_objects(pods, nodes))).unwrap();
        let state = CycleState::new();
        let infos: Vec<Arc<NodeInfo>> = snapshot.list().cloned().collect();
        p.as_pre_score().unwrap().pre_score(&state, pod, &infos);
        let scorer = p.as_score().unwrap();
        let mut scores: Vec<NodeScore> = infos
            .iter()
            .map(|n| NodeScore {
                name: n.name().to_string(),
                score: scorer.score(&state, pod, n).unwrap(),
            })
            .collect();
        scorer.score_extensions().unwrap().normalize_score(&state, pod, &mut scores);
        scores.into_iter().map(|s| (s.name, s.score)).collect()
    }

    #[test]
    fn spreads_over_nodes() {
        let nodes = [make_node("n1").obj(), make_node("n2").obj()];
        let pods = [
            make_pod("w1").label("app", "web").node("n1").obj(),
            make_pod("w2").label("app", "web").node("n1").obj(),
            make_pod("other").label("app", "db").node("n2").obj(),
        ];
        let s = run(&make_pod("w3").label("app", "web").obj(), &pods, &nodes);
        assert_eq!(s["n1"], 0);
        assert_eq!(s["n2"], 100);
    }

    #[test]
    fn zones_weigh_two_thirds() {
        let nodes = [
            make_node("a1").zone("a").obj(),
            make_node("a2").zone("a").obj(),
            make_node("b1").zone("b").obj(),
        ];
        let pods = [make_pod("w1").label("app", "web").node("a1").obj()];
        let s = run(&make_pod("w2").label("app", "web").obj(), &pods, &nodes);
        // a2 is empty but shares a zone with a1: 100 / 3 from the node share only.
        assert_eq!(s["a1"], 0);
        assert_eq!(s["a2"], 33);
        assert_eq!(s["b1"], 100);
    }

    #[test]
    fn pods_with_constraints_are_skipped() {
        let nodes = [make_node("n1").obj()];
        let pods = [make_pod("w1").label("app", "web").node("n1").obj()];
        let pod = make_pod("w2")
            .label("app", "web")
            .spread_constraint(
                1,
                "zone",
                UnsatisfiableConstraintAction::ScheduleAnyway,
                LabelSelector::with_labels(&[("app", "web")]),
            )
            .obj();
        assert_eq!(run(&pod, &pods, &nodes)["n1"], 0);
    }
}
