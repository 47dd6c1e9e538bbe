use super::InterPodAffinity;
use crate::framework::{
    CycleState, ErrorChannel, NodeScore, PreScorePlugin, ScoreExtensions, ScorePlugin, Status,
    MAX_NODE_SCORE,
};
use crate::node_info::{NodeInfo, PodInfo, WeightedAffinityTerm};
use crate::plugins::helper::{node_of, state_error};
use placement_core::{Node, Pod};
use std::collections::HashMap;
use std::sync::Arc;

const PRE_SCORE_STATE_KEY: &str = "PreScoreInterPodAffinity";

/// topology key -> topology value -> score
#[derive(Debug, Clone, Default)]
struct TopologyScore(HashMap<String, HashMap<String, i64>>);

impl TopologyScore {
    fn process_term(&mut self, term: &WeightedAffinityTerm, pod_to_check: &Pod, fixed_node: &Node, multiplier: i64) {
        let labels = fixed_node.labels();
        if labels.is_empty() || !term.term.matches(pod_to_check) {
            return;
        }
        if let Some(value) = labels.get(&term.term.topology_key) {
            *self
                .0
                .entry(term.term.topology_key.clone())
                .or_default()
                .entry(value.clone())
                .or_default() += i64::from(term.weight) * multiplier;
        }
    }

    fn process_terms(&mut self, terms: &[WeightedAffinityTerm], pod_to_check: &Pod, fixed_node: &Node, multiplier: i64) {
        for t in terms {
            self.process_term(t, pod_to_check, fixed_node, multiplier);
        }
    }

    fn append(&mut self, other: Self) {
        for (key, values) in other.0 {
            let scores = self.0.entry(key).or_default();
            for (value, score) in values {
                *scores.entry(value).or_default() += score;
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug)]
struct PreScoreState {
    topology_score: TopologyScore,
}

impl InterPodAffinity {
    fn process_existing_pod(
        &self,
        incoming: &PodInfo,
        existing: &PodInfo,
        existing_node: &Node,
        scores: &mut TopologyScore,
    ) {
        scores.process_terms(&incoming.preferred_affinity_terms, &existing.pod, existing_node, 1);
        scores.process_terms(&incoming.preferred_anti_affinity_terms, &existing.pod, existing_node, -1);

        if self.args.hard_pod_affinity_weight > 0 {
            for term in &existing.required_affinity_terms {
                let weighted = WeightedAffinityTerm {
                    term: term.clone(),
                    weight: self.args.hard_pod_affinity_weight,
                };
                scores.process_term(&weighted, &incoming.pod, existing_node, 1);
            }
        }

        scores.process_terms(&existing.preferred_affinity_terms, &incoming.pod, existing_node, 1);
        scores.process_terms(&existing.preferred_anti_affinity_terms, &incoming.pod, existing_node, -1);
    }
}

impl PreScorePlugin for InterPodAffinity {
    fn pre_score(&self, state: &CycleState, pod: &Pod, nodes: &[Arc<NodeInfo>]) -> Status {
        if nodes.is_empty() {
            return Status::success();
        }
        let has_constraints = pod.pod_affinity().is_some() || pod.pod_anti_affinity().is_some();
        let snapshot = self.handle.snapshot();
        // Without terms of its own the pod can only be affected by pods
        // that carry terms.
        let all: Vec<Arc<NodeInfo>> = if has_constraints {
            snapshot.list().cloned().collect()
        } else {
            snapshot.have_pods_with_affinity().cloned().collect()
        };
        let incoming = PodInfo::new(Arc::new(pod.clone()));

        let per_node = self.handle.parallelizer().map(&ErrorChannel::new(), all.len(), |i| {
            let info = &all[i];
            let node = info.node()?;
            let pods = if has_constraints {
                info.pods()
            } else {
                info.pods_with_affinity()
            };
            let mut scores = TopologyScore::default();
            for existing in pods {
                self.process_existing_pod(&incoming, existing, node, &mut scores);
            }
            (!scores.is_empty()).then_some(scores)
        });

        let mut topology_score = TopologyScore::default();
        for scores in per_node.into_iter().flatten() {
            topology_score.append(scores);
        }
        state.write(PRE_SCORE_STATE_KEY, PreScoreState { topology_score });
        Status::success()
    }
}

impl ScorePlugin for InterPodAffinity {
    fn score(&self, state: &CycleState, _pod: &Pod, node_info: &NodeInfo) -> std::result::Result<i64, Status> {
        let node = node_of(node_info)?;
        let s = state
            .read::<PreScoreState>(PRE_SCORE_STATE_KEY)
            .map_err(|e| state_error(PRE_SCORE_STATE_KEY, &e))?;
        Ok(s.topology_score
            .0
            .iter()
            .filter_map(|(key, values)| node.labels().get(key).and_then(|v| values.get(v)))
            .sum())
    }

    fn score_extensions(&self) -> Option<&dyn ScoreExtensions> {
        Some(self)
    }
}

impl ScoreExtensions for InterPodAffinity {
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn normalize_score(&self, state: &CycleState, _pod: &Pod, scores: &mut [NodeScore]) -> Status {
        let s = match state.read::<PreScoreState>(PRE_SCORE_STATE_KEY) {
            Ok(s) => s,
            Err(e) => return state_error(PRE_SCORE_STATE_KEY, &e),
        };
        if s.topology_score.is_empty() {
            return Status::success();
        }
        let max = scores.iter().map(|s| s.score).max().unwrap_or(0).max(0);
        let min = scores.iter().map(|s| s.score).min().unwrap_or(0).min(0);
        let diff = max - min;
        for s in scores {
            s.score = if diff > 0 {
                (MAX_NODE_SCORE as f64 * ((s.score - min) as f64 / diff as f64)) as i64
            } else {
                0
            };
        }
        Status::success()
    }
}

#[cfg(test)]
mod tests {
    use super::super::new;
    use super::*;
    use crate::cache::Snapshot;
    use crate::framework::Plugin;
    use crate::testing::{make_node, make_pod, test_handle};
    use placement_core::well_known::LABEL_ZONE;
    use serde_json::json;

    fn scores(p: &dyn Plugin, pod: &Pod, snapshot: &Snapshot) -> HashMap<String, i64> {
        let state = CycleState::new();
        let nodes: Vec<Arc<NodeInfo>> = snapshot.list().cloned().collect();
        assert!(p.as_pre_score().unwrap().pre_score(&state, pod, &nodes).is_success());
        let scorer = p.as_score().unwrap();
        let mut out: Vec<NodeScore> = nodes
            .iter()
            .map(|n| NodeScore {
                name: n.name().to_string(),
                score: scorer.score(&state, pod, n).unwrap(),
            })
            .collect();
        scorer.score_extensions().unwrap().normalize_score(&state, pod, &mut out);
        out.into_iter().map(|s| (s.name, s.score)).collect()
    }

    fn cluster() -> (Vec<Pod>, Vec<placement_core::Node>) {
        let nodes = vec![
            make_node("n1").zone("z1").obj(),
            make_node("n2").zone("z2").obj(),
            make_node("n3").zone("z3").obj(),
        ];
        let pods = vec![
            make_pod("cache").label("app", "cache").node("n1").obj(),
            make_pod("noisy").label("app", "noisy").node("n2").obj(),
        ];
        (pods, nodes)
    }

    #[test]
    fn preferred_terms_attract_and_repel() {
        let (pods, nodes) = cluster();
        let snapshot = Snapshot::from_objects(&pods, &nodes);
        let p = new(None, &test_handle(Snapshot::from_objects(&pods, &nodes))).unwrap();
        let pod = make_pod("web")
            .preferred_pod_affinity(10, "app", &["cache"], LABEL_ZONE)
            .preferred_pod_anti_affinity(5, "app", &["noisy"], LABEL_ZONE)
            .obj();

        let s = scores(p.as_ref(), &pod, &snapshot);
        // Raw: z1 +10, z2 -5, z3 0.
        assert_eq!(s["n1"], 100);
        assert_eq!(s["n2"], 0);
        assert_eq!(s["n3"], 33);
    }

    #[test]
    fn existing_required_affinity_uses_hard_weight() {
        let nodes = vec![make_node("n1").zone("z1").obj(), make_node("n2").zone("z2").obj()];
        let pods = vec![make_pod("sidecar")
            .node("n1")
            .pod_affinity_in("app", &["web"], LABEL_ZONE)
            .obj()];
        let snapshot = Snapshot::from_objects(&pods, &nodes);
        let handle = test_handle(Snapshot::from_objects(&pods, &nodes));
        let pod = make_pod("web").label("app", "web").obj();

        let p = new(Some(&json!({"hardPodAffinityWeight": 5})), &handle).unwrap();
        let s = scores(p.as_ref(), &pod, &snapshot);
        assert_eq!(s["n1"], 100);
        assert_eq!(s["n2"], 0);

        let p = new(Some(&json!({"hardPodAffinityWeight": 0})), &handle).unwrap();
        let s = scores(p.as_ref(), &pod, &snapshot);
        assert_eq!(s["n1"], 0);
        assert_eq!(s["n2"], 0);
    }
}
