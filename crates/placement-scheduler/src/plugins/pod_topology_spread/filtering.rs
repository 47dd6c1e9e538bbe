use super::{node_labels_match_constraints, Constraint, PodTopologySpread};
use crate::framework::{
    CycleState, ErrorChannel, FilterPlugin, PreFilterExtensions, PreFilterPlugin, Status,
};
use crate::node_info::NodeInfo;
use crate::plugins::helper::{node_of, pod_matches_node_selector_and_affinity_terms, state_error};
use placement_core::{Node, Pod, UnsatisfiableConstraintAction};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const PRE_FILTER_STATE_KEY: &str = "PreFilterPodTopologySpread";

/// Placing the pod would exceed a constraint's max skew.
pub const ERR_REASON_CONSTRAINTS_NOT_MATCH: &str = "node(s) didn't match pod topology spread constraints";
/// The node lacks a constraint's topology key.
pub const ERR_REASON_NODE_LABEL_NOT_MATCH: &str =
    "node(s) didn't match pod topology spread constraints (missing required label)";

type TopologyPair = (String, String);

/// The two domains with the fewest matching pods, lowest first.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CriticalPaths([(String, i64); 2]);

impl Default for CriticalPaths {
    fn default() -> Self {
        Self([(String::new(), i64::MAX), (String::new(), i64::MAX)])
    }
}

impl CriticalPaths {
    fn min(&self) -> i64 {
        self.0[0].1
    }

    fn update(&mut self, value: &str, num: i64) {
        let paths = &mut self.0;
        if let Some(i) = paths.iter().position(|(v, _)| v == value) {
            paths[i].1 = num;
            if paths[0].1 > paths[1].1 {
                paths.swap(0, 1);
            }
        } else if num < paths[0].1 {
            paths[1] = std::mem::replace(&mut paths[0], (value.to_string(), num));
        } else if num < paths[1].1 {
            paths[1] = (value.to_string(), num);
        }
    }
}

#[derive(Debug, Clone, Default)]
struct PreFilterState {
    constraints: Vec<Constraint>,
    critical_paths: HashMap<String, CriticalPaths>,
    match_num: HashMap<TopologyPair, i64>,
}

impl PreFilterState {
    fn update_with_pod(&mut self, updated: &Pod, incoming: &Pod, node: &Node, delta: i64) {
        if updated.namespace() != incoming.namespace()
            || !node_labels_match_constraints(node.labels(), &self.constraints)
        {
            return;
        }
        for c in &self.constraints {
            if !c.matches(updated.labels()) {
                continue;
            }
            let value = node.labels().get(&c.topology_key).cloned().unwrap_or_default();
            let Some(num) = self.match_num.get_mut(&(c.topology_key.clone(), value.clone())) else {
                continue;
            };
            *num += delta;
            let num = *num;
            if let Some(paths) = self.critical_paths.get_mut(&c.topology_key) {
                paths.update(&value, num);
            }
        }
    }
}

impl PodTopologySpread {
    fn pre_filter_state(&self, pod: &Pod) -> crate::error::Result<PreFilterState> {
        let constraints = self.constraints_for(pod, UnsatisfiableConstraintAction::DoNotSchedule)?;
        if constraints.is_empty() {
            return Ok(PreFilterState::default());
        }
        let snapshot = self.handle.snapshot();
        let nodes: Vec<Arc<NodeInfo>> = snapshot.list().cloned().collect();

        let per_node = self.handle.parallelizer().map(&ErrorChannel::new(), nodes.len(), |i| {
            let info = &nodes[i];
            let node = info.node()?;
            if !pod_matches_node_selector_and_affinity_terms(pod, node)
                || !node_labels_match_constraints(node.labels(), &constraints)
            {
                return None;
            }
            let counts: Vec<(TopologyPair, i64)> = constraints
                .iter()
                .map(|c| {
                    let value = node.labels().get(&c.topology_key).cloned().unwrap_or_default();
                    ((c.topology_key.clone(), value), c.count_matching(info, pod.namespace()))
                })
                .collect();
            Some(counts)
        });

        let mut match_num: HashMap<TopologyPair, i64> = HashMap::new();
        for (pair, count) in per_node.into_iter().flatten().flatten() {
            *match_num.entry(pair).or_default() += count;
        }
        let mut critical_paths: HashMap<String, CriticalPaths> = constraints
            .iter()
            .map(|c| (c.topology_key.clone(), CriticalPaths::default()))
            .collect();
        for ((key, value), num) in &match_num {
            if let Some(paths) = critical_paths.get_mut(key) {
                paths.update(value, *num);
            }
        }
        Ok(PreFilterState {
            constraints,
            critical_paths,
            match_num,
        })
    }

    fn update_state(&self, state: &CycleState, incoming: &Pod, pod: &Pod, node_info: &NodeInfo, delta: i64) -> Status {
        let current = match state.read::<PreFilterState>(PRE_FILTER_STATE_KEY) {
            Ok(s) => s,
            Err(e) => return state_error(PRE_FILTER_STATE_KEY, &e),
        };
        let Some(node) = node_info.node() else {
            return Status::success();
        };
        let mut next = (*current).clone();
        next.update_with_pod(pod, incoming, node, delta);
        state.write(PRE_FILTER_STATE_KEY, next);
        Status::success()
    }
}

impl PreFilterPlugin for PodTopologySpread {
    fn pre_filter(&self, state: &CycleState, pod: &Pod) -> Status {
        match self.pre_filter_state(pod) {
            Ok(s) => {
                state.write(PRE_FILTER_STATE_KEY, s);
                Status::success()
            }
            Err(e) => Status::error(e.to_string()),
        }
    }

    fn pre_filter_extensions(&self) -> Option<&dyn PreFilterExtensions> {
        Some(self)
    }
}

impl PreFilterExtensions for PodTopologySpread {
    fn add_pod(&self, state: &CycleState, pod_to_schedule: &Pod, pod_to_add: &Arc<Pod>, node_info: &NodeInfo) -> Status {
        self.update_state(state, pod_to_schedule, pod_to_add, node_info, 1)
    }

    fn remove_pod(
        &self,
        state: &CycleState,
        pod_to_schedule: &Pod,
        pod_to_remove: &Arc<Pod>,
        node_info: &NodeInfo,
    ) -> Status {
        self.update_state(state, pod_to_schedule, pod_to_remove, node_info, -1)
    }
}

impl FilterPlugin for PodTopologySpread {
    fn filter(&self, state: &CycleState, pod: &Pod, node_info: &NodeInfo) -> Status {
        let node = match node_of(node_info) {
            Ok(node) => node,
            Err(status) => return status,
        };
        let s = match state.read::<PreFilterState>(PRE_FILTER_STATE_KEY) {
            Ok(s) => s,
            Err(e) => return state_error(PRE_FILTER_STATE_KEY, &e),
        };
        if s.match_num.is_empty() || s.constraints.is_empty() {
            return Status::success();
        }

        for c in &s.constraints {
            let Some(value) = node.labels().get(&c.topology_key) else {
                debug!(node = node.name(), key = %c.topology_key, "node lacks topology label");
                return Status::unresolvable(ERR_REASON_NODE_LABEL_NOT_MATCH);
            };
            let Some(paths) = s.critical_paths.get(&c.topology_key) else {
                continue;
            };
            let self_match = i64::from(c.matches(pod.labels()));
            let match_num = s
                .match_num
                .get(&(c.topology_key.clone(), value.clone()))
                .copied()
                .unwrap_or(0);
            let skew = match_num + self_match - paths.min();
            if skew > i64::from(c.max_skew) {
                debug!(
                    node = node.name(),
                    key = %c.topology_key,
                    match_num,
                    self_match,
                    min = paths.min(),
                    max_skew = c.max_skew,
                    "spread constraint violated"
                );
                return Status::unschedulable(ERR_REASON_CONSTRAINTS_NOT_MATCH);
            }
        }
        Status::success()
    }
}

#[cfg(test)]
mod tests {
    use super::super::new;
    use super::*;
    use crate::cache::Snapshot;
    use crate::framework::{Code, Plugin};
    use crate::testing::{make_node, make_pod, test_handle};
    use placement_core::well_known::{LABEL_HOSTNAME, LABEL_ZONE};
    use placement_core::LabelSelector;

    fn web_pod(name: &str, key: &str, max_skew: i32) -> Pod {
        make_pod(name)
            .label("app", "web")
            .spread_constraint(
                max_skew,
                key,
                UnsatisfiableConstraintAction::DoNotSchedule,
                LabelSelector::with_labels(&[("app", "web")]),
            )
            .obj()
    }

    fn filter_all(p: &dyn Plugin, pod: &Pod, snapshot: &Snapshot) -> HashMap<String, Status> {
        let state = CycleState::new();
        assert!(p.as_pre_filter().unwrap().pre_filter(&state, pod).is_success());
        snapshot
            .list()
            .map(|n| (n.name().to_string(), p.as_filter().unwrap().filter(&state, pod, n)))
            .collect()
    }

    #[test]
    fn critical_paths_keep_two_smallest() {
        let mut paths = CriticalPaths::default();
        paths.update("a", 3);
        paths.update("b", 1);
        paths.update("c", 2);
        assert_eq!(paths.0[0], ("b".to_string(), 1));
        assert_eq!(paths.0[1], ("c".to_string(), 2));
        paths.update("b", 4);
        assert_eq!(paths.min(), 2);
    }

    #[test]
    fn skew_over_zones() {
        let nodes = [
            make_node("a1").zone("a").obj(),
            make_node("b1").zone("b").obj(),
            make_node("c1").zone("c").obj(),
        ];
        let pods = [
            make_pod("w1").label("app", "web").node("a1").obj(),
            make_pod("w2").label("app", "web").node("a1").obj(),
            make_pod("w3").label("app", "web").node("b1").obj(),
        ];
        let snapshot = Snapshot::from_objects(&pods, &nodes);
        let p = new(None, &test_handle(Snapshot::from_objects(&pods, &nodes))).unwrap();

        let statuses = filter_all(p.as_ref(), &web_pod("w4", LABEL_ZONE, 1), &snapshot);
        assert_eq!(statuses["a1"].code(), Code::Unschedulable);
        assert_eq!(statuses["a1"].reasons(), [ERR_REASON_CONSTRAINTS_NOT_MATCH]);
        assert!(!statuses["b1"].is_success());
        assert!(statuses["c1"].is_success());

        let statuses = filter_all(p.as_ref(), &web_pod("w4", LABEL_ZONE, 2), &snapshot);
        assert!(!statuses["a1"].is_success());
        assert!(statuses["b1"].is_success());
    }

    #[test]
    fn node_without_key_is_unresolvable() {
        let nodes = [make_node("a1").zone("a").obj(), make_node("bare").obj()];
        let snapshot = Snapshot::from_objects(&[], &nodes);
        let p = new(None, &test_handle(Snapshot::from_objects(&[], &nodes))).unwrap();
        let statuses = filter_all(p.as_ref(), &web_pod("w", LABEL_ZONE, 1), &snapshot);
        assert!(statuses["a1"].is_success());
        assert_eq!(statuses["bare"].code(), Code::UnschedulableAndUnresolvable);
        assert_eq!(statuses["bare"].reasons(), [ERR_REASON_NODE_LABEL_NOT_MATCH]);
    }

    #[test]
    fn nominated_pod_counts_in_cloned_state() {
        let nodes = [make_node("n1").obj(), make_node("n2").obj()];
        let snapshot = Snapshot::from_objects(&[], &nodes);
        let p = new(None, &test_handle(Snapshot::from_objects(&[], &nodes))).unwrap();
        let pod = web_pod("w", LABEL_HOSTNAME, 1);
        let n1 = snapshot.get("n1").unwrap();

        let state = CycleState::new();
        p.as_pre_filter().unwrap().pre_filter(&state, &pod);
        let branch = state.clone();
        let nominated = Arc::new(make_pod("w0").label("app", "web").node("n1").obj());
        let ext = p.as_pre_filter().unwrap().pre_filter_extensions().unwrap();
        assert!(ext.add_pod(&branch, &pod, &nominated, n1).is_success());

        let filter = p.as_filter().unwrap();
        assert!(!filter.filter(&branch, &pod, n1).is_success());
        assert!(filter.filter(&state, &pod, n1).is_success());
    }
}
