use super::InterPodAffinity;
use crate::framework::{
    Code, CycleState, ErrorChannel, FilterPlugin, PreFilterExtensions, PreFilterPlugin, Status,
};
use crate::node_info::{AffinityTerm, NodeInfo, PodInfo};
use crate::plugins::helper::{node_of, state_error};
use placement_core::{Node, Pod};
use std::collections::HashMap;
use std::sync::Arc;

const PRE_FILTER_STATE_KEY: &str = "PreFilterInterPodAffinity";

/// Umbrella reason attached to every affinity failure.
pub const ERR_REASON_AFFINITY_NOT_MATCH: &str = "node(s) didn't match pod affinity/anti-affinity";
/// The incoming pod's required affinity is not satisfied.
pub const ERR_REASON_AFFINITY_RULES_NOT_MATCH: &str = "node(s) didn't match pod affinity rules";
/// The incoming pod's required anti-affinity is violated.
pub const ERR_REASON_ANTI_AFFINITY_RULES_NOT_MATCH: &str = "node(s) didn't match pod anti-affinity rules";
/// An existing pod's required anti-affinity would be violated.
pub const ERR_REASON_EXISTING_ANTI_AFFINITY_RULES_NOT_MATCH: &str =
    "node(s) didn't satisfy existing pods anti-affinity rules";

type TopologyPair = (String, String);

#[derive(Debug, Clone, Default)]
struct TopologyCounts(HashMap<TopologyPair, i64>);

impl TopologyCounts {
    fn get(&self, key: &str, value: &str) -> i64 {
        self.0
            .get(&(key.to_string(), value.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn bump(&mut self, key: &str, value: &str, by: i64) {
        let pair = (key.to_string(), value.to_string());
        let count = self.0.entry(pair.clone()).or_default();
        *count += by;
        if *count == 0 {
            self.0.remove(&pair);
        }
    }

    fn append(&mut self, other: Self) {
        for ((k, v), n) in other.0 {
            self.bump(&k, &v, n);
        }
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Count `target` (on `node`) against the terms if it matches all of them.
    fn update_with_affinity_terms(&mut self, target: &Pod, node: &Node, terms: &[AffinityTerm], by: i64) {
        if !pod_matches_all_terms(target, terms) {
            return;
        }
        for t in terms {
            if let Some(value) = node.labels().get(&t.topology_key) {
                self.bump(&t.topology_key, value, by);
            }
        }
    }

    /// Count `target` (on `node`) against each term it matches.
    fn update_with_anti_affinity_terms(&mut self, target: &Pod, node: &Node, terms: &[AffinityTerm], by: i64) {
        for t in terms {
            if t.matches(target) {
                if let Some(value) = node.labels().get(&t.topology_key) {
                    self.bump(&t.topology_key, value, by);
                }
            }
        }
    }
}

fn pod_matches_all_terms(pod: &Pod, terms: &[AffinityTerm]) -> bool {
    !terms.is_empty() && terms.iter().all(|t| t.matches(pod))
}

#[derive(Debug, Clone)]
struct PreFilterState {
    existing_anti_affinity: TopologyCounts,
    affinity: TopologyCounts,
    anti_affinity: TopologyCounts,
    pod_info: Arc<PodInfo>,
}

impl PreFilterState {
    fn update_with_pod(&mut self, updated: &Arc<Pod>, node: &Node, by: i64) {
        let updated_info = PodInfo::new(Arc::clone(updated));
        self.existing_anti_affinity.update_with_anti_affinity_terms(
            &self.pod_info.pod,
            node,
            &updated_info.required_anti_affinity_terms,
            by,
        );
        self.affinity
            .update_with_affinity_terms(updated, node, &self.pod_info.required_affinity_terms, by);
        self.anti_affinity.update_with_anti_affinity_terms(
            updated,
            node,
            &self.pod_info.required_anti_affinity_terms,
            by,
        );
    }
}

impl InterPodAffinity {
    fn existing_anti_affinity_counts(&self, pod: &Pod, nodes: &[Arc<NodeInfo>]) -> TopologyCounts {
        let per_node = self.handle.parallelizer().map(&ErrorChannel::new(), nodes.len(), |i| {
            let info = &nodes[i];
            let node = info.node()?;
            let mut counts = TopologyCounts::default();
            for existing in info.pods_with_required_anti_affinity() {
                counts.update_with_anti_affinity_terms(pod, node, &existing.required_anti_affinity_terms, 1);
            }
            (!counts.is_empty()).then_some(counts)
        });
        let mut out = TopologyCounts::default();
        for counts in per_node.into_iter().flatten() {
            out.append(counts);
        }
        out
    }

    fn incoming_counts(&self, pod_info: &PodInfo, nodes: &[Arc<NodeInfo>]) -> (TopologyCounts, TopologyCounts) {
        let mut affinity = TopologyCounts::default();
        let mut anti_affinity = TopologyCounts::default();
        if pod_info.required_affinity_terms.is_empty() && pod_info.required_anti_affinity_terms.is_empty() {
            return (affinity, anti_affinity);
        }
        let per_node = self.handle.parallelizer().map(&ErrorChannel::new(), nodes.len(), |i| {
            let info = &nodes[i];
            let node = info.node()?;
            let mut a = TopologyCounts::default();
            let mut anti = TopologyCounts::default();
            for existing in info.pods() {
                a.update_with_affinity_terms(&existing.pod, node, &pod_info.required_affinity_terms, 1);
                anti.update_with_anti_affinity_terms(
                    &existing.pod,
                    node,
                    &pod_info.required_anti_affinity_terms,
                    1,
                );
            }
            (!(a.is_empty() && anti.is_empty())).then_some((a, anti))
        });
        for (a, anti) in per_node.into_iter().flatten() {
            affinity.append(a);
            anti_affinity.append(anti);
        }
        (affinity, anti_affinity)
    }

    fn update_state(&self, state: &CycleState, pod: &Arc<Pod>, node_info: &NodeInfo, by: i64) -> Status {
        let current = match state.read::<PreFilterState>(PRE_FILTER_STATE_KEY) {
            Ok(s) => s,
            Err(e) => return state_error(PRE_FILTER_STATE_KEY, &e),
        };
        let node = match node_of(node_info) {
            Ok(node) => node,
            Err(status) => return status,
        };
        let mut next = (*current).clone();
        next.update_with_pod(pod, node, by);
        state.write(PRE_FILTER_STATE_KEY, next);
        Status::success()
    }
}

impl PreFilterPlugin for InterPodAffinity {
    fn pre_filter(&self, state: &CycleState, pod: &Pod) -> Status {
        let snapshot = self.handle.snapshot();
        let all: Vec<Arc<NodeInfo>> = snapshot.list().cloned().collect();
        let with_anti: Vec<Arc<NodeInfo>> = snapshot.have_pods_with_required_anti_affinity().cloned().collect();

        let pod_info = Arc::new(PodInfo::new(Arc::new(pod.clone())));
        let existing_anti_affinity = self.existing_anti_affinity_counts(pod, &with_anti);
        let (affinity, anti_affinity) = self.incoming_counts(&pod_info, &all);

        state.write(
            PRE_FILTER_STATE_KEY,
            PreFilterState {
                existing_anti_affinity,
                affinity,
                anti_affinity,
                pod_info,
            },
        );
        Status::success()
    }

    fn pre_filter_extensions(&self) -> Option<&dyn PreFilterExtensions> {
        Some(self)
    }
}

impl PreFilterExtensions for InterPodAffinity {
    fn add_pod(&self, state: &CycleState, _pod_to_schedule: &Pod, pod_to_add: &Arc<Pod>, node_info: &NodeInfo) -> Status {
        self.update_state(state, pod_to_add, node_info, 1)
    }

    fn remove_pod(
        &self,
        state: &CycleState,
        _pod_to_schedule: &Pod,
        pod_to_remove: &Arc<Pod>,
        node_info: &NodeInfo,
    ) -> Status {
        self.update_state(state, pod_to_remove, node_info, -1)
    }
}

fn satisfies_existing_pods_anti_affinity(s: &PreFilterState, node: &Node) -> bool {
    s.existing_anti_affinity.is_empty()
        || node
            .labels()
            .iter()
            .all(|(k, v)| s.existing_anti_affinity.get(k, v) <= 0)
}

fn satisfies_pod_anti_affinity(s: &PreFilterState, node: &Node) -> bool {
    s.pod_info.required_anti_affinity_terms.iter().all(|t| {
        node.labels()
            .get(&t.topology_key)
            .map_or(true, |v| s.anti_affinity.get(&t.topology_key, v) <= 0)
    })
}

fn satisfies_pod_affinity(s: &PreFilterState, node: &Node) -> bool {
    let mut pods_exist = true;
    for t in &s.pod_info.required_affinity_terms {
        let Some(value) = node.labels().get(&t.topology_key) else {
            return false;
        };
        if s.affinity.get(&t.topology_key, value) <= 0 {
            pods_exist = false;
        }
    }
    if pods_exist {
        return true;
    }
    // The first pod of a group that selects itself may go anywhere, as long
    // as no matching pod exists yet.
    s.affinity.is_empty() && pod_matches_all_terms(&s.pod_info.pod, &s.pod_info.required_affinity_terms)
}

impl FilterPlugin for InterPodAffinity {
    fn filter(&self, state: &CycleState, _pod: &Pod, node_info: &NodeInfo) -> Status {
        let node = match node_of(node_info) {
            Ok(node) => node,
            Err(status) => return status,
        };
        let s = match state.read::<PreFilterState>(PRE_FILTER_STATE_KEY) {
            Ok(s) => s,
            Err(e) => return state_error(PRE_FILTER_STATE_KEY, &e),
        };
        let fail = |code, reason: &str| {
            Status::with_reasons(code, vec![ERR_REASON_AFFINITY_NOT_MATCH.to_string(), reason.to_string()])
        };
        if !satisfies_pod_affinity(&s, node) {
            return fail(Code::UnschedulableAndUnresolvable, ERR_REASON_AFFINITY_RULES_NOT_MATCH);
        }
        if !satisfies_pod_anti_affinity(&s, node) {
            return fail(Code::Unschedulable, ERR_REASON_ANTI_AFFINITY_RULES_NOT_MATCH);
        }
        if !satisfies_existing_pods_anti_affinity(&s, node) {
            return fail(Code::Unschedulable, ERR_REASON_EXISTING_ANTI_AFFINITY_RULES_NOT_MATCH);
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
    use placement_core::well_known::LABEL_HOSTNAME;

    fn plugin(snapshot: Snapshot) -> Arc<dyn Plugin> {
        new(None, &test_handle(snapshot)).unwrap()
    }

    fn run_filter(p: &dyn Plugin, pod: &Pod, snapshot_nodes: &Snapshot, node: &str) -> Status {
        let state = CycleState::new();
        assert!(p.as_pre_filter().unwrap().pre_filter(&state, pod).is_success());
        p.as_filter().unwrap().filter(&state, pod, snapshot_nodes.get(node).unwrap())
    }

    #[test]
    fn anti_affinity_rejects_node_with_matching_pod() {
        let nodes = [make_node("n1").zone("z1").obj(), make_node("n2").zone("z2").obj()];
        let pods = [make_pod("web-1").label("app", "web").node("n1").obj()];
        let snapshot = Snapshot::from_objects(&pods, &nodes);
        let p = plugin(Snapshot::from_objects(&pods, &nodes));
        let pod = make_pod("web-2")
            .label("app", "web")
            .pod_anti_affinity_in("app", &["web"], LABEL_HOSTNAME)
            .obj();

        let status = run_filter(p.as_ref(), &pod, &snapshot, "n1");
        assert_eq!(status.code(), Code::Unschedulable);
        assert_eq!(
            status.reasons(),
            [ERR_REASON_AFFINITY_NOT_MATCH, ERR_REASON_ANTI_AFFINITY_RULES_NOT_MATCH]
        );
        assert!(run_filter(p.as_ref(), &pod, &snapshot, "n2").is_success());
    }

    #[test]
    fn affinity_requires_a_matching_domain() {
        let nodes = [make_node("n1").zone("z1").obj(), make_node("n2").zone("z2").obj()];
        let pods = [make_pod("db").label("app", "db").node("n1").obj()];
        let snapshot = Snapshot::from_objects(&pods, &nodes);
        let p = plugin(Snapshot::from_objects(&pods, &nodes));
        let pod = make_pod("web")
            .pod_affinity_in("app", &["db"], placement_core::well_known::LABEL_ZONE)
            .obj();

        assert!(run_filter(p.as_ref(), &pod, &snapshot, "n1").is_success());
        let status = run_filter(p.as_ref(), &pod, &snapshot, "n2");
        assert_eq!(status.code(), Code::UnschedulableAndUnresolvable);
        assert_eq!(status.reasons()[1], ERR_REASON_AFFINITY_RULES_NOT_MATCH);
    }

    #[test]
    fn first_pod_of_self_affine_group_is_placed() {
        let nodes = [make_node("n1").obj()];
        let snapshot = Snapshot::from_objects(&[], &nodes);
        let p = plugin(Snapshot::from_objects(&[], &nodes));
        let pod = make_pod("web")
            .label("app", "web")
            .pod_affinity_in("app", &["web"], LABEL_HOSTNAME)
            .obj();
        assert!(run_filter(p.as_ref(), &pod, &snapshot, "n1").is_success());

        let other = make_pod("api").pod_affinity_in("app", &["web"], LABEL_HOSTNAME).obj();
        assert!(!run_filter(p.as_ref(), &other, &snapshot, "n1").is_success());
    }

    #[test]
    fn existing_pod_anti_affinity_is_honoured() {
        let nodes = [make_node("n1").obj(), make_node("n2").obj()];
        let pods = [make_pod("loner")
            .node("n1")
            .pod_anti_affinity_in("app", &["web"], LABEL_HOSTNAME)
            .obj()];
        let snapshot = Snapshot::from_objects(&pods, &nodes);
        let p = plugin(Snapshot::from_objects(&pods, &nodes));
        let pod = make_pod("web").label("app", "web").obj();

        let status = run_filter(p.as_ref(), &pod, &snapshot, "n1");
        assert_eq!(status.reasons()[1], ERR_REASON_EXISTING_ANTI_AFFINITY_RULES_NOT_MATCH);
        assert!(run_filter(p.as_ref(), &pod, &snapshot, "n2").is_success());
    }

    #[test]
    fn add_and_remove_pod_update_a_cloned_state() {
        let nodes = [make_node("n1").obj()];
        let snapshot = Snapshot::from_objects(&[], &nodes);
        let p = plugin(Snapshot::from_objects(&[], &nodes));
        let pod = make_pod("web-2")
            .label("app", "web")
            .pod_anti_affinity_in("app", &["web"], LABEL_HOSTNAME)
            .obj();
        let info = snapshot.get("n1").unwrap();

        let state = CycleState::new();
        p.as_pre_filter().unwrap().pre_filter(&state, &pod);
        let ext = p.as_pre_filter().unwrap().pre_filter_extensions().unwrap();
        let filter = p.as_filter().unwrap();

        let branch = state.clone();
        let nominated = Arc::new(make_pod("web-1").label("app", "web").node("n1").obj());
        assert!(ext.add_pod(&branch, &pod, &nominated, info).is_success());
        assert!(!filter.filter(&branch, &pod, info).is_success());
        assert!(filter.filter(&state, &pod, info).is_success());

        assert!(ext.remove_pod(&branch, &pod, &nominated, info).is_success());
        assert!(filter.filter(&branch, &pod, info).is_success());
    }
}
