//! Tracks the node each pod has been nominated for.

use parking_lot::RwLock;
use placement_core::{Pod, Uid};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Nominations {
    by_node: HashMap<String, Vec<Arc<Pod>>>,
    node_of: HashMap<Uid, String>,
}

impl Nominations {
    fn add(&mut self, pod: Arc<Pod>, node_name: &str) {
        self.delete(&pod);
        let node = if node_name.is_empty() {
            pod.status.nominated_node_name.clone()
        } else {
            node_name.to_string()
        };
        if node.is_empty() {
            return;
        }
        self.node_of.insert(pod.uid().clone(), node.clone());
        let pods = self.by_node.entry(node).or_default();
        if pods.iter().all(|p| p.uid() != pod.uid()) {
            pods.push(pod);
        }
    }

    fn delete(&mut self, pod: &Pod) {
        let Some(node) = self.node_of.remove(pod.uid()) else {
            return;
        };
        if let Some(pods) = self.by_node.get_mut(&node) {
            pods.retain(|p| p.uid() != pod.uid());
            if pods.is_empty() {
                self.by_node.remove(&node);
            }
        }
    }
}

/// Thread-safe map of nominated pods, shared by the queue and the framework.
#[derive(Debug, Default)]
pub struct PodNominator {
    inner: RwLock<Nominations>,
}

impl PodNominator {
    /// Create an empty nominator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Nominate `pod` for `node_name`, or for its `status.nominated_node_name`
    /// when `node_name` is empty. Any earlier nomination is replaced.
    pub fn add_nominated_pod(&self, pod: Arc<Pod>, node_name: &str) {
        self.inner.write().add(pod, node_name);
    }

    /// Drop the nomination of a pod, if any.
    pub fn delete_nominated_pod_if_exists(&self, pod: &Pod) {
        self.inner.write().delete(pod);
    }

    /// Carry a nomination over to an updated pod.
    ///
    /// A nomination made by the scheduler itself survives updates that carry
    /// no nominated node of their own.
    pub fn update_nominated_pod(&self, old: &Pod, new: Arc<Pod>) {
        let mut inner = self.inner.write();
        let mut node = String::new();
        if old.status.nominated_node_name.is_empty() && new.status.nominated_node_name.is_empty() {
            if let Some(n) = inner.node_of.get(old.uid()) {
                node.clone_from(n);
            }
        }
        inner.delete(old);
        inner.add(new, &node);
    }

    /// Pods nominated for a node.
    #[must_use]
    pub fn nominated_pods_for_node(&self, node_name: &str) -> Vec<Arc<Pod>> {
        self.inner
            .read()
            .by_node
            .get(node_name)
            .cloned()
            .unwrap_or_default()
    }

    /// The node a pod is nominated for.
    #[must_use]
    pub fn nominated_node(&self, pod: &Pod) -> Option<String> {
        self.inner.read().node_of.get(pod.uid()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::make_pod;

    #[test]
    fn add_replaces_previous_nomination() {
        let nominator = PodNominator::new();
        let pod = Arc::new(make_pod("p").obj());
        nominator.add_nominated_pod(Arc::clone(&pod), "n1");
        nominator.add_nominated_pod(Arc::clone(&pod), "n2");
        assert!(nominator.nominated_pods_for_node("n1").is_empty());
        assert_eq!(nominator.nominated_pods_for_node("n2").len(), 1);
        assert_eq!(nominator.nominated_node(&pod).as_deref(), Some("n2"));
    }

    #[test]
    fn falls_back_to_status_field() {
        let nominator = PodNominator::new();
        let mut pod = make_pod("p").obj();
        nominator.add_nominated_pod(Arc::new(pod.clone()), "");
        assert!(nominator.nominated_node(&pod).is_none());

        pod.status.nominated_node_name = "n3".into();
        nominator.add_nominated_pod(Arc::new(pod.clone()), "");
        assert_eq!(nominator.nominated_node(&pod).as_deref(), Some("n3"));
    }

    #[test]
    fn update_keeps_scheduler_nomination() {
        let nominator = PodNominator::new();
        let old = make_pod("p").obj();
        nominator.add_nominated_pod(Arc::new(old.clone()), "n1");
        let new = make_pod("p").label("v", "2").obj();
        nominator.update_nominated_pod(&old, Arc::new(new));
        let pods = nominator.nominated_pods_for_node("n1");
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].labels().get("v").map(String::as_str), Some("2"));

        nominator.delete_nominated_pod_if_exists(&old);
        assert!(nominator.nominated_pods_for_node("n1").is_empty());
    }
}
