//! Point-in-time view of the cluster consumed by one scheduling cycle.

use crate::node_info::NodeInfo;
use parking_lot::RwLock;
use placement_core::{Node, Pod};
use std::collections::HashMap;
use std::sync::Arc;

/// An immutable view of every node, plus the subsets hosting pods with
/// affinity terms.
///
/// Node infos live in slots; the lists hold slot indices, so refreshing a
/// node in place is reflected by every list without rebuilding them.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    infos: Vec<Arc<NodeInfo>>,
    names: Vec<String>,
    index: HashMap<String, usize>,
    list: Vec<usize>,
    affinity_list: Vec<usize>,
    required_anti_affinity_list: Vec<usize>,
    generation: i64,
}

impl Snapshot {
    /// Create an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot directly from pods and nodes. Pods whose node is not
    /// listed are ignored.
    #[must_use]
    pub fn from_objects(pods: &[Pod], nodes: &[Node]) -> Self {
        let mut infos: HashMap<&str, NodeInfo> = nodes
            .iter()
            .map(|n| (n.name(), NodeInfo::with_node(Arc::new(n.clone()), [])))
            .collect();
        for pod in pods {
            if let Some(info) = infos.get_mut(pod.node_name()) {
                info.add_pod(Arc::new(pod.clone()));
            }
        }
        let mut snapshot = Self::new();
        for node in nodes {
            if let Some(info) = infos.remove(node.name()) {
                snapshot.upsert(node.name(), Arc::new(info));
            }
        }
        let order: Vec<String> = nodes.iter().map(|n| n.name().to_string()).collect();
        snapshot.rebuild_lists(&order);
        snapshot
    }

    /// Number of nodes.
    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.list.len()
    }

    /// Generation of the newest node info reflected in the snapshot.
    #[must_use]
    pub fn generation(&self) -> i64 {
        self.generation
    }

    /// Look up a node by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<NodeInfo>> {
        self.index.get(name).map(|&i| &self.infos[i])
    }

    /// The node at position `i` of the traversal order.
    #[must_use]
    pub fn at(&self, i: usize) -> &Arc<NodeInfo> {
        &self.infos[self.list[i]]
    }

    /// Every node, in traversal order.
    pub fn list(&self) -> impl ExactSizeIterator<Item = &Arc<NodeInfo>> + '_ {
        self.list.iter().map(|&i| &self.infos[i])
    }

    /// Nodes hosting at least one pod with an affinity term.
    pub fn have_pods_with_affinity(&self) -> impl ExactSizeIterator<Item = &Arc<NodeInfo>> + '_ {
        self.affinity_list.iter().map(|&i| &self.infos[i])
    }

    /// Nodes hosting at least one pod with a required anti-affinity term.
    pub fn have_pods_with_required_anti_affinity(
        &self,
    ) -> impl ExactSizeIterator<Item = &Arc<NodeInfo>> + '_ {
        self.required_anti_affinity_list
            .iter()
            .map(|&i| &self.infos[i])
    }

    pub(crate) fn len_map(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn names(&self) -> &[String] {
        &self.names
    }

    pub(crate) fn set_generation(&mut self, generation: i64) {
        self.generation = generation;
    }

    /// Insert or replace a node info. Returns true when the lists need a
    /// rebuild: the node is new or its affinity membership changed.
    pub(crate) fn upsert(&mut self, name: &str, info: Arc<NodeInfo>) -> bool {
        if let Some(&slot) = self.index.get(name) {
            let old = &self.infos[slot];
            let flipped = old.pods_with_affinity().is_empty() != info.pods_with_affinity().is_empty()
                || old.pods_with_required_anti_affinity().is_empty()
                    != info.pods_with_required_anti_affinity().is_empty();
            self.infos[slot] = info;
            return flipped;
        }
        self.index.insert(name.to_string(), self.infos.len());
        self.names.push(name.to_string());
        self.infos.push(info);
        true
    }

    /// Drop a node. The lists must be rebuilt afterwards.
    pub(crate) fn remove(&mut self, name: &str) {
        let Some(slot) = self.index.remove(name) else {
            return;
        };
        self.infos.swap_remove(slot);
        self.names.swap_remove(slot);
        if let Some(moved) = self.names.get(slot) {
            self.index.insert(moved.clone(), slot);
        }
        self.list.clear();
        self.affinity_list.clear();
        self.required_anti_affinity_list.clear();
    }

    /// Regenerate the traversal lists from the given node order. Names
    /// without a node info are skipped.
    pub(crate) fn rebuild_lists(&mut self, order: &[String]) {
        self.list = order
            .iter()
            .filter_map(|name| self.index.get(name).copied())
            .collect();
        self.rebuild_affinity_lists();
    }

    pub(crate) fn rebuild_affinity_lists(&mut self) {
        self.affinity_list = self
            .list
            .iter()
            .copied()
            .filter(|&i| !self.infos[i].pods_with_affinity().is_empty())
            .collect();
        self.required_anti_affinity_list = self
            .list
            .iter()
            .copied()
            .filter(|&i| !self.infos[i].pods_with_required_anti_affinity().is_empty())
            .collect();
    }
}

/// Shared handle to the snapshot of the current cycle.
///
/// The scheduling loop refreshes it in place at the start of a cycle; plugins
/// take an `Arc` of the current value and never see it change under them.
#[derive(Debug, Clone, Default)]
pub struct SnapshotHandle(Arc<RwLock<Arc<Snapshot>>>);

impl SnapshotHandle {
    /// Wrap a snapshot.
    #[must_use]
    pub fn new(snapshot: Snapshot) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(snapshot))))
    }

    /// The current snapshot.
    #[must_use]
    pub fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&self.0.read())
    }

    /// Mutate the snapshot. Readers holding the previous value keep it.
    pub fn update<R>(&self, f: impl FnOnce(&mut Snapshot) -> R) -> R {
        let mut guard = self.0.write();
        f(Arc::make_mut(&mut guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{make_node, make_pod};

    #[test]
    fn from_objects_assigns_pods_to_nodes() {
        let nodes = [make_node("n1").obj(), make_node("n2").obj()];
        let pods = [
            make_pod("a").node("n1").obj(),
            make_pod("b").node("n1").pod_anti_affinity_in("app", &["x"], "zone").obj(),
            make_pod("c").node("missing").obj(),
        ];
        let snap = Snapshot::from_objects(&pods, &nodes);
        assert_eq!(snap.num_nodes(), 2);
        assert_eq!(snap.get("n1").unwrap().pods().len(), 2);
        assert_eq!(snap.have_pods_with_affinity().count(), 1);
        assert_eq!(snap.have_pods_with_required_anti_affinity().count(), 1);
        assert_eq!(snap.at(1).name(), "n2");
    }

    #[test]
    fn remove_keeps_index_consistent() {
        let nodes = [make_node("n1").obj(), make_node("n2").obj(), make_node("n3").obj()];
        let mut snap = Snapshot::from_objects(&[], &nodes);
        snap.remove("n1");
        snap.rebuild_lists(&["n2".to_string(), "n3".to_string()]);
        assert_eq!(snap.num_nodes(), 2);
        assert_eq!(snap.get("n3").unwrap().name(), "n3");
        assert!(snap.get("n1").is_none());
    }

    #[test]
    fn handle_readers_keep_old_value() {
        let handle = SnapshotHandle::new(Snapshot::from_objects(&[], &[make_node("n1").obj()]));
        let before = handle.current();
        handle.update(|s| s.remove("n1"));
        assert_eq!(before.num_nodes(), 1);
        assert_eq!(handle.current().num_nodes(), 0);
    }
}
