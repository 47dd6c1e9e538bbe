use super::{node_labels_match_constraints, Constraint, PodTopologySpread};
use crate::framework::{
    CycleState, ErrorChannel, NodeScore, PreScorePlugin, ScoreExtensions, ScorePlugin, Status,
    MAX_NODE_SCORE,
};
use crate::node_info::NodeInfo;
use crate::plugins::helper::{node_of, pod_matches_node_selector_and_affinity_terms, state_error};
use placement_core::well_known::LABEL_HOSTNAME;
use placement_core::{Pod, UnsatisfiableConstraintAction};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const PRE_SCORE_STATE_KEY: &str = "PreScorePodTopologySpread";

#[derive(Debug, Default)]
struct PreScoreState {
    constraints: Vec<Constraint>,
    /// Feasible nodes missing a constraint key.
    ignored_nodes: HashSet<String>,
    /// Matching pods per domain. Hostname domains are counted at score time.
    pod_counts: HashMap<(String, String), i64>,
    /// Per constraint, dampens domains that are one of many.
    normalizing_weights: Vec<f64>,
}

#[allow(clippy::cast_precision_loss)]
fn topology_normalizing_weight(size: usize) -> f64 {
    ((size + 2) as f64).ln()
}

#[allow(clippy::cast_precision_loss)]
fn score_for_count(count: i64, max_skew: i32, weight: f64) -> f64 {
    count as f64 * weight + f64::from(max_skew - 1)
}

impl PodTopologySpread {
    fn init_pre_score_state(&self, pod: &Pod, nodes: &[Arc<NodeInfo>]) -> crate::error::Result<PreScoreState> {
        let mut s = PreScoreState {
            constraints: self.constraints_for(pod, UnsatisfiableConstraintAction::ScheduleAnyway)?,
            ..PreScoreState::default()
        };
        if s.constraints.is_empty() {
            return Ok(s);
        }
        let mut sizes = vec![0usize; s.constraints.len()];
        for info in nodes {
            let Some(node) = info.node() else {
                continue;
            };
            if !node_labels_match_constraints(node.labels(), &s.constraints) {
                s.ignored_nodes.insert(node.name().to_string());
                continue;
            }
            for (i, c) in s.constraints.iter().enumerate() {
                if c.topology_key == LABEL_HOSTNAME {
                    continue;
                }
                let value = node.labels().get(&c.topology_key).cloned().unwrap_or_default();
                if let std::collections::hash_map::Entry::Vacant(e) =
                    s.pod_counts.entry((c.topology_key.clone(), value))
                {
                    e.insert(0);
                    sizes[i] += 1;
                }
            }
        }
        s.normalizing_weights = s
            .constraints
            .iter()
            .zip(sizes)
            .map(|(c, size)| {
                let size = if c.topology_key == LABEL_HOSTNAME {
                    nodes.len() - s.ignored_nodes.len()
                } else {
                    size
                };
                topology_normalizing_weight(size)
            })
            .collect();
        Ok(s)
    }
}

impl PreScorePlugin for PodTopologySpread {
    fn pre_score(&self, state: &CycleState, pod: &Pod, nodes: &[Arc<NodeInfo>]) -> Status {
        let snapshot = self.handle.snapshot();
        if nodes.is_empty() || snapshot.num_nodes() == 0 {
            return Status::success();
        }
        let mut s = match self.init_pre_score_state(pod, nodes) {
            Ok(s) => s,
            Err(e) => return Status::error(format!("calculating spread score state: {e}")),
        };
        if s.constraints.is_empty() {
            state.write(PRE_SCORE_STATE_KEY, s);
            return Status::success();
        }

        let all: Vec<Arc<NodeInfo>> = snapshot.list().cloned().collect();
        let constraints = &s.constraints;
        let pod_counts = &s.pod_counts;
        let per_node = self.handle.parallelizer().map(&ErrorChannel::new(), all.len(), |i| {
            let info = &all[i];
            let node = info.node()?;
            if !pod_matches_node_selector_and_affinity_terms(pod, node)
                || !node_labels_match_constraints(node.labels(), constraints)
            {
                return None;
            }
            let counts: Vec<((String, String), i64)> = constraints
                .iter()
                .filter_map(|c| {
                    let value = node.labels().get(&c.topology_key).cloned().unwrap_or_default();
                    let pair = (c.topology_key.clone(), value);
                    pod_counts
                        .contains_key(&pair)
                        .then(|| (pair, c.count_matching(info, pod.namespace())))
                })
                .collect();
            Some(counts)
        });
        for (pair, count) in per_node.into_iter().flatten().flatten() {
            *s.pod_counts.entry(pair).or_default() += count;
        }
        state.write(PRE_SCORE_STATE_KEY, s);
        Status::success()
    }
}

impl ScorePlugin for PodTopologySpread {
    #[allow(clippy::cast_possible_truncation)]
    fn score(&self, state: &CycleState, pod: &Pod, node_info: &NodeInfo) -> std::result::Result<i64, Status> {
        let node = node_of(node_info)?;
        let s = state
            .read::<PreScoreState>(PRE_SCORE_STATE_KEY)
            .map_err(|e| state_error(PRE_SCORE_STATE_KEY, &e))?;
        if s.ignored_nodes.contains(node.name()) {
            return Ok(0);
        }
        let mut score = 0.0;
        for (i, c) in s.constraints.iter().enumerate() {
            let Some(value) = node.labels().get(&c.topology_key) else {
                continue;
            };
            let count = if c.topology_key == LABEL_HOSTNAME {
                c.count_matching(node_info, pod.namespace())
            } else {
                s.pod_counts
                    .get(&(c.topology_key.clone(), value.clone()))
                    .copied()
                    .unwrap_or(0)
            };
            score += score_for_count(count, c.max_skew, s.normalizing_weights[i]);
        }
        Ok(score as i64)
    }

    fn score_extensions(&self) -> Option<&dyn ScoreExtensions> {
        Some(self)
    }
}

impl ScoreExtensions for PodTopologySpread {
    fn normalize_score(&self, state: &CycleState, _pod: &Pod, scores: &mut [NodeScore]) -> Status {
        let s = match state.read::<PreScoreState>(PRE_SCORE_STATE_KEY) {
            Ok(s) => s,
            Err(e) => return state_error(PRE_SCORE_STATE_KEY, &e),
        };
        let counted = || scores.iter().filter(|n| !s.ignored_nodes.contains(&n.name)).map(|n| n.score);
        let min = counted().min().unwrap_or(i64::MAX);
        let max = counted().max().unwrap_or(0).max(0);
        for n in scores.iter_mut() {
            n.score = if s.ignored_nodes.contains(&n.name) {
                0
            } else if max == 0 {
                MAX_NODE_SCORE
            } else {
                MAX_NODE_SCORE * (max + min - n.score) / max
            };
        }
        Status::success()
    }
}
