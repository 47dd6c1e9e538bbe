//! Helpers shared by several plugins.

use crate::error::SchedulerError;
use crate::framework::{NodeScore, Status};
use crate::node_info::NodeInfo;
use placement_core::{LabelSelector, Node, Pod};

/// Scale scores so the highest becomes `max_priority`. With `reverse` the
/// scale is flipped, so the lowest raw score ends highest.
pub fn default_normalize_score(max_priority: i64, reverse: bool, scores: &mut [NodeScore]) -> Status {
    let max_count = scores.iter().map(|s| s.score).max().unwrap_or(0).max(0);
    if max_count == 0 {
        if reverse {
            for s in scores {
                s.score = max_priority;
            }
        }
        return Status::success();
    }
    for s in scores {
        let mut score = max_priority * s.score / max_count;
        if reverse {
            score = max_priority - score;
        }
        s.score = score;
    }
    Status::success()
}

/// Check the pod's node selector and required node affinity against `node`.
#[must_use]
pub fn pod_matches_node_selector_and_affinity_terms(pod: &Pod, node: &Node) -> bool {
    let labels = node.labels();
    if !pod
        .spec
        .node_selector
        .iter()
        .all(|(k, v)| labels.get(k) == Some(v))
    {
        return false;
    }
    match pod.node_affinity().and_then(|a| a.required.as_ref()) {
        Some(required) => required.matches(node.name(), labels),
        None => true,
    }
}

/// The selector used when a pod carries no explicit spread selector: the
/// pod's own labels. Empty when the pod has no labels.
#[must_use]
pub fn default_selector(pod: &Pod) -> LabelSelector {
    LabelSelector::from_labels(pod.labels())
}

/// Count the live pods of `namespace` on the node matched by `selector`.
#[must_use]
pub fn count_pods_match_selector(node_info: &NodeInfo, selector: &LabelSelector, namespace: &str) -> usize {
    node_info
        .pods()
        .iter()
        .filter(|p| {
            !p.pod.is_terminating()
                && p.pod.namespace() == namespace
                && selector.matches(p.pod.labels())
        })
        .count()
}

/// The node record of a node info, or the error status plugins return when
/// it is missing.
///
/// # Errors
///
/// Returns an error status when the node record is absent.
pub fn node_of(node_info: &NodeInfo) -> Result<&Node, Status> {
    node_info
        .node()
        .map(|n| &**n)
        .ok_or_else(|| Status::error("node not found"))
}

/// Turn a cycle-state read failure into an error status.
pub fn state_error(key: &str, err: &SchedulerError) -> Status {
    Status::error(format!("reading {key:?} from cycle state: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{make_node, make_pod};

    fn scores(raw: &[i64]) -> Vec<NodeScore> {
        raw.iter()
            .enumerate()
            .map(|(i, &score)| NodeScore {
                name: format!("n{i}"),
                score,
            })
            .collect()
    }

    #[test]
    fn normalize_scales_to_max() {
        let mut s = scores(&[0, 5, 10]);
        default_normalize_score(100, false, &mut s);
        assert_eq!(s.iter().map(|s| s.score).collect::<Vec<_>>(), [0, 50, 100]);

        let mut s = scores(&[0, 5, 10]);
        default_normalize_score(100, true, &mut s);
        assert_eq!(s.iter().map(|s| s.score).collect::<Vec<_>>(), [100, 50, 0]);
    }

    #[test]
    fn normalize_all_zero() {
        let mut s = scores(&[0, 0]);
        default_normalize_score(100, false, &mut s);
        assert!(s.iter().all(|s| s.score == 0));
        default_normalize_score(100, true, &mut s);
        assert!(s.iter().all(|s| s.score == 100));
    }

    #[test]
    fn node_selector_and_required_affinity() {
        let node = make_node("n1").label("disk", "ssd").label("zone", "a").obj();
        assert!(pod_matches_node_selector_and_affinity_terms(&make_pod("p").obj(), &node));
        assert!(pod_matches_node_selector_and_affinity_terms(
            &make_pod("p").node_selector("disk", "ssd").obj(),
            &node
        ));
        assert!(!pod_matches_node_selector_and_affinity_terms(
            &make_pod("p").node_selector("disk", "hdd").obj(),
            &node
        ));
        assert!(pod_matches_node_selector_and_affinity_terms(
            &make_pod("p").node_affinity_in("zone", &["a", "b"]).obj(),
            &node
        ));
        assert!(!pod_matches_node_selector_and_affinity_terms(
            &make_pod("p").node_affinity_in("zone", &["c"]).obj(),
            &node
        ));
    }
}
