//! The scheduler cache: the authoritative, mutable view of the cluster.
//!
//! Pods move through three states inside the cache:
//!
//! ```text
//!   AssumePod          AddPod (informer)
//! ───────────▶ Assumed ─────────────────▶ Added ──RemovePod──▶ gone
//!                 │  ▲                      ▲
//!   ForgetPod /   │  │ FinishBinding        │ AddPod after expiry
//!   expiry        ▼  │                      │
//!               gone ─────────────────────────
//! ```
//!
//! Node infos form an MRU list (most recently mutated first), which is what
//! makes [`Cache::update_snapshot`] proportional to the number of changed nodes.

mod node_tree;
mod snapshot;

pub use node_tree::NodeTree;
pub use snapshot::{Snapshot, SnapshotHandle};

use crate::error::{Result, SchedulerError};
use crate::node_info::{pod_key, ImageStateSummary, NodeInfo};
use parking_lot::RwLock;
use placement_core::{Node, Pod, Uid};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, warn};

#[derive(Debug)]
struct PodState {
    pod: Arc<Pod>,
    // Set once binding finished; assumed pods without it never expire.
    deadline: Option<Instant>,
    binding_finished: bool,
}

#[derive(Debug)]
struct NodeItem {
    info: Arc<NodeInfo>,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Default)]
struct ImageState {
    size: i64,
    nodes: HashSet<String>,
}

#[derive(Debug, Default)]
struct Inner {
    slots: Vec<Option<NodeItem>>,
    free: Vec<usize>,
    head: Option<usize>,
    nodes: HashMap<String, usize>,
    node_tree: NodeTree,
    pod_states: HashMap<Uid, PodState>,
    assumed_pods: HashSet<Uid>,
    image_states: HashMap<String, ImageState>,
}

impl Inner {
    fn item(&self, slot: usize) -> &NodeItem {
        self.slots[slot]
            .as_ref()
            .unwrap_or_else(|| unreachable!("node list slot {slot} is vacant"))
    }

    fn item_mut(&mut self, slot: usize) -> &mut NodeItem {
        self.slots[slot]
            .as_mut()
            .unwrap_or_else(|| unreachable!("node list slot {slot} is vacant"))
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let item = self.item(slot);
            (item.prev, item.next)
        };
        match prev {
            Some(p) => self.item_mut(p).next = next,
            None => self.head = next,
        }
        if let Some(n) = next {
            self.item_mut(n).prev = prev;
        }
        let item = self.item_mut(slot);
        item.prev = None;
        item.next = None;
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        {
            let item = self.item_mut(slot);
            item.prev = None;
            item.next = old_head;
        }
        if let Some(h) = old_head {
            self.item_mut(h).prev = Some(slot);
        }
        self.head = Some(slot);
    }

    fn move_to_head(&mut self, name: &str) {
        let Some(&slot) = self.nodes.get(name) else {
            error!(node = %name, "No node info with this name found in the cache");
            return;
        };
        if self.head == Some(slot) {
            return;
        }
        self.unlink(slot);
        self.push_front(slot);
    }

    fn remove_from_list(&mut self, name: &str) {
        let Some(slot) = self.nodes.remove(name) else {
            error!(node = %name, "No node info with this name found in the cache");
            return;
        };
        self.unlink(slot);
        self.slots[slot] = None;
        self.free.push(slot);
    }

    /// Get the node info for `name`, creating an empty one if needed.
    fn node_info_mut(&mut self, name: &str) -> &mut NodeInfo {
        let slot = if let Some(&slot) = self.nodes.get(name) {
            slot
        } else {
            let item = NodeItem {
                info: Arc::new(NodeInfo::new()),
                prev: None,
                next: None,
            };
            let slot = if let Some(slot) = self.free.pop() {
                self.slots[slot] = Some(item);
                slot
            } else {
                self.slots.push(Some(item));
                self.slots.len() - 1
            };
            self.nodes.insert(name.to_string(), slot);
            self.push_front(slot);
            slot
        };
        Arc::make_mut(&mut self.item_mut(slot).info)
    }

    fn node_info(&self, name: &str) -> Option<&Arc<NodeInfo>> {
        self.nodes.get(name).map(|&slot| &self.item(slot).info)
    }

    fn add_pod(&mut self, pod: Arc<Pod>) {
        let node = pod.node_name().to_string();
        self.node_info_mut(&node).add_pod(pod);
        self.move_to_head(&node);
    }

    fn remove_pod(&mut self, pod: &Pod) -> Result<()> {
        let node = pod.node_name();
        if !self.nodes.contains_key(node) {
            error!(node = %node, pod = %pod.full_name(), "Node not found when trying to remove pod");
            return Ok(());
        }
        let info = self.node_info_mut(node);
        info.remove_pod(pod)?;
        if info.is_empty() {
            self.remove_from_list(node);
        } else {
            self.move_to_head(node);
        }
        Ok(())
    }

    fn add_node_image_states(&mut self, node: &Node) -> HashMap<String, ImageStateSummary> {
        let mut summary = HashMap::new();
        for image in &node.status.images {
            for name in &image.names {
                let state = self.image_states.entry(name.clone()).or_insert_with(|| ImageState {
                    size: image.size_bytes,
                    nodes: HashSet::new(),
                });
                state.nodes.insert(node.name().to_string());
                summary.entry(name.clone()).or_insert(ImageStateSummary {
                    size: state.size,
                    num_nodes: state.nodes.len(),
                });
            }
        }
        summary
    }

    fn remove_node_image_states(&mut self, node: Option<&Node>) {
        let Some(node) = node else {
            return;
        };
        for image in &node.status.images {
            for name in &image.names {
                if let Some(state) = self.image_states.get_mut(name) {
                    state.nodes.remove(node.name());
                    if state.nodes.is_empty() {
                        self.image_states.remove(name);
                    }
                }
            }
        }
    }

    fn expire_pod(&mut self, key: &Uid) -> Result<()> {
        if let Some(state) = self.pod_states.remove(key) {
            self.assumed_pods.remove(key);
            self.remove_pod(&state.pod)?;
        }
        Ok(())
    }
}

/// A copy of the cache contents, for debugging.
#[derive(Debug, Clone, Default)]
pub struct Dump {
    /// Node infos by name.
    pub nodes: HashMap<String, NodeInfo>,
    /// Uids of assumed pods.
    pub assumed_pods: HashSet<Uid>,
}

/// The scheduler cache.
#[derive(Debug)]
pub struct Cache {
    ttl: Duration,
    period: Duration,
    inner: RwLock<Inner>,
}

impl Cache {
    /// Create a cache whose finished assumed pods expire after `ttl`, checked
    /// every `period` by [`Cache::run_cleanup`].
    #[must_use]
    pub fn new(ttl: Duration, period: Duration) -> Self {
        Self {
            ttl,
            period,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Assume a pod is placed on `pod.spec.node_name` before it is bound.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::PodAlreadyInCache`] if the pod is already cached.
    pub fn assume_pod(&self, pod: &Pod) -> Result<()> {
        let key = pod_key(pod)?;
        let mut inner = self.inner.write();
        if inner.pod_states.contains_key(&key) {
            return Err(SchedulerError::PodAlreadyInCache {
                pod: pod.full_name(),
            });
        }
        let pod = Arc::new(pod.clone());
        inner.add_pod(Arc::clone(&pod));
        inner.pod_states.insert(
            key.clone(),
            PodState {
                pod,
                deadline: None,
                binding_finished: false,
            },
        );
        inner.assumed_pods.insert(key);
        Ok(())
    }

    /// Mark the binding of an assumed pod as finished, starting its expiry
    /// clock.
    ///
    /// # Errors
    ///
    /// Only fails when the pod has no uid.
    pub fn finish_binding(&self, pod: &Pod) -> Result<()> {
        self.finish_binding_at(pod, Instant::now())
    }

    fn finish_binding_at(&self, pod: &Pod, now: Instant) -> Result<()> {
        let key = pod_key(pod)?;
        let mut inner = self.inner.write();
        let assumed = inner.assumed_pods.contains(&key);
        if let Some(state) = inner.pod_states.get_mut(&key) {
            if assumed {
                state.binding_finished = true;
                state.deadline = Some(now + self.ttl);
            }
        }
        Ok(())
    }

    /// Drop an assumed pod.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NodeMismatch`] if the pod was assumed on another
    /// node and [`SchedulerError::PodNotAssumed`] if it is not assumed.
    pub fn forget_pod(&self, pod: &Pod) -> Result<()> {
        let key = pod_key(pod)?;
        let mut inner = self.inner.write();
        let cached = inner.pod_states.get(&key).map(|s| s.pod.node_name().to_string());
        if let Some(cached) = &cached {
            if cached != pod.node_name() {
                return Err(SchedulerError::NodeMismatch {
                    pod: pod.full_name(),
                    cached: cached.clone(),
                    actual: pod.node_name().to_string(),
                });
            }
        }
        if cached.is_none() || !inner.assumed_pods.contains(&key) {
            return Err(SchedulerError::PodNotAssumed {
                pod: pod.full_name(),
            });
        }
        inner.remove_pod(pod)?;
        inner.assumed_pods.remove(&key);
        inner.pod_states.remove(&key);
        Ok(())
    }

    /// Record a pod observed bound by the informer. Confirms an assumed pod,
    /// or re-adds one that already expired.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::PodAlreadyInCache`] if the pod was already added.
    pub fn add_pod(&self, pod: &Pod) -> Result<()> {
        let key = pod_key(pod)?;
        let mut inner = self.inner.write();
        let assumed = inner.assumed_pods.contains(&key);
        let pod = Arc::new(pod.clone());
        match inner.pod_states.get(&key).map(|s| Arc::clone(&s.pod)) {
            Some(cached) if assumed => {
                if cached.node_name() != pod.node_name() {
                    warn!(
                        pod = %pod.full_name(),
                        assumed = %cached.node_name(),
                        actual = %pod.node_name(),
                        "Pod was assumed on one node but added to another"
                    );
                    if let Err(e) = inner.remove_pod(&cached) {
                        error!(pod = %pod.full_name(), error = %e, "Removing the assumed copy failed");
                    }
                    inner.add_pod(Arc::clone(&pod));
                }
                inner.assumed_pods.remove(&key);
                if let Some(state) = inner.pod_states.get_mut(&key) {
                    state.deadline = None;
                    state.pod = pod;
                }
                Ok(())
            }
            Some(_) => Err(SchedulerError::PodAlreadyInCache {
                pod: pod.full_name(),
            }),
            None => {
                inner.add_pod(Arc::clone(&pod));
                inner.pod_states.insert(
                    key,
                    PodState {
                        pod,
                        deadline: None,
                        binding_finished: false,
                    },
                );
                Ok(())
            }
        }
    }

    /// Replace a bound pod.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::PodMigrated`] if the new copy names another node
    /// (the cache is left untouched), or [`SchedulerError::PodNotInCache`] if the
    /// pod is not added.
    pub fn update_pod(&self, old: &Pod, new: &Pod) -> Result<()> {
        let key = pod_key(old)?;
        let mut inner = self.inner.write();
        let assumed = inner.assumed_pods.contains(&key);
        let Some(cached) = inner.pod_states.get(&key).map(|s| Arc::clone(&s.pod)) else {
            return Err(SchedulerError::PodNotInCache {
                pod: old.full_name(),
            });
        };
        if assumed {
            return Err(SchedulerError::PodNotInCache {
                pod: old.full_name(),
            });
        }
        if cached.node_name() != new.node_name() {
            let err = SchedulerError::PodMigrated {
                pod: new.full_name(),
                from: cached.node_name().to_string(),
                to: new.node_name().to_string(),
            };
            error!(error = %err, "Scheduler cache is corrupted and can badly affect scheduling decisions");
            return Err(err);
        }
        let new = Arc::new(new.clone());
        inner.remove_pod(&cached)?;
        inner.add_pod(Arc::clone(&new));
        if let Some(state) = inner.pod_states.get_mut(&key) {
            state.pod = new;
        }
        Ok(())
    }

    /// Remove a bound pod.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NodeMismatch`] if the pod is cached on another
    /// node and [`SchedulerError::PodNotInCache`] if it is not added.
    pub fn remove_pod(&self, pod: &Pod) -> Result<()> {
        let key = pod_key(pod)?;
        let mut inner = self.inner.write();
        let assumed = inner.assumed_pods.contains(&key);
        let cached = match inner.pod_states.get(&key) {
            Some(state) if !assumed => Arc::clone(&state.pod),
            _ => {
                return Err(SchedulerError::PodNotInCache {
                    pod: pod.full_name(),
                })
            }
        };
        if cached.node_name() != pod.node_name() {
            let err = SchedulerError::NodeMismatch {
                pod: pod.full_name(),
                cached: cached.node_name().to_string(),
                actual: pod.node_name().to_string(),
            };
            error!(error = %err, "Scheduler cache is corrupted and can badly affect scheduling decisions");
            return Err(err);
        }
        inner.remove_pod(&cached)?;
        inner.pod_states.remove(&key);
        Ok(())
    }

    /// Check whether a pod is assumed.
    ///
    /// # Errors
    ///
    /// Only fails when the pod has no uid.
    pub fn is_assumed_pod(&self, pod: &Pod) -> Result<bool> {
        let key = pod_key(pod)?;
        Ok(self.inner.read().assumed_pods.contains(&key))
    }

    /// The cached copy of a pod.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::PodNotInCache`] if the pod is not cached.
    pub fn get_pod(&self, pod: &Pod) -> Result<Arc<Pod>> {
        let key = pod_key(pod)?;
        self.inner
            .read()
            .pod_states
            .get(&key)
            .map(|s| Arc::clone(&s.pod))
            .ok_or_else(|| SchedulerError::PodNotInCache {
                pod: pod.full_name(),
            })
    }

    /// Add a node, or replace its record.
    pub fn add_node(&self, node: &Node) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let previous = inner.node_info(node.name()).and_then(|i| i.node().cloned());
        inner.remove_node_image_states(previous.as_deref());
        match &previous {
            Some(old) => inner.node_tree.update(Some(old.as_ref()), node),
            None => inner.node_tree.add(node),
        }
        let images = inner.add_node_image_states(node);
        let info = inner.node_info_mut(node.name());
        info.set_image_states(images);
        info.set_node(Arc::new(node.clone()));
        inner.move_to_head(node.name());
    }

    /// Update a node.
    pub fn update_node(&self, _old: &Node, new: &Node) {
        // The cached record is the authoritative "old" copy for the tree.
        self.add_node(new);
    }

    /// Remove a node. Pods still on it keep the node info alive until they go.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NodeNotFound`] if the node is unknown.
    pub fn remove_node(&self, node: &Node) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.nodes.contains_key(node.name()) {
            return Err(SchedulerError::NodeNotFound(node.name().to_string()));
        }
        let cached = inner.node_info(node.name()).and_then(|i| i.node().cloned());
        let info = inner.node_info_mut(node.name());
        info.remove_node();
        if info.pods().is_empty() {
            inner.remove_from_list(node.name());
        } else {
            inner.move_to_head(node.name());
        }
        inner.node_tree.remove(cached.as_deref().unwrap_or(node))?;
        inner.remove_node_image_states(cached.as_deref());
        Ok(())
    }

    /// Bring `snapshot` up to date with the cache.
    ///
    /// Only node infos mutated since the snapshot's generation are copied.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::SnapshotInconsistent`] if the snapshot ends up
    /// with a different node count than the cache. The snapshot is fully
    /// rebuilt in that case, so the next cycle sees consistent data.
    pub fn update_snapshot(&self, snapshot: &mut Snapshot) -> Result<()> {
        let inner = self.inner.read();
        let since = snapshot.generation();
        let mut rebuild_lists = false;
        let mut affinity_changed = false;

        let mut cursor = inner.head;
        while let Some(slot) = cursor {
            let item = inner.item(slot);
            if item.info.generation() <= since {
                break;
            }
            if let Some(node) = item.info.node() {
                let is_new = snapshot.get(node.name()).is_none();
                if snapshot.upsert(node.name(), Arc::clone(&item.info)) {
                    if is_new {
                        rebuild_lists = true;
                    } else {
                        affinity_changed = true;
                    }
                }
            }
            cursor = item.next;
        }
        if let Some(head) = inner.head {
            let head_gen = inner.item(head).info.generation();
            snapshot.set_generation(snapshot.generation().max(head_gen));
        }

        if snapshot.len_map() > inner.node_tree.num_nodes() {
            let stale: Vec<String> = snapshot
                .names()
                .iter()
                .filter(|name| inner.node_info(name).map_or(true, |i| i.node().is_none()))
                .cloned()
                .collect();
            for name in stale {
                snapshot.remove(&name);
            }
            rebuild_lists = true;
        }

        if rebuild_lists {
            snapshot.rebuild_lists(&inner.node_tree.list());
        } else if affinity_changed {
            snapshot.rebuild_affinity_lists();
        }

        if snapshot.num_nodes() != inner.node_tree.num_nodes() {
            let err = SchedulerError::SnapshotInconsistent {
                snapshot: snapshot.num_nodes(),
                cache: inner.node_tree.num_nodes(),
            };
            error!(error = %err, "Snapshot is inconsistent with the cache, rebuilding");
            let generation = snapshot.generation();
            *snapshot = Self::full_snapshot(&inner);
            snapshot.set_generation(snapshot.generation().max(generation));
            return Err(err);
        }
        Ok(())
    }

    fn full_snapshot(inner: &Inner) -> Snapshot {
        let mut snapshot = Snapshot::new();
        for (name, &slot) in &inner.nodes {
            let info = &inner.item(slot).info;
            if info.node().is_some() {
                snapshot.upsert(name, Arc::clone(info));
            }
        }
        if let Some(head) = inner.head {
            snapshot.set_generation(inner.item(head).info.generation());
        }
        snapshot.rebuild_lists(&inner.node_tree.list());
        snapshot
    }

    /// Remove every assumed pod whose binding finished more than `ttl` ago.
    pub fn cleanup_assumed_pods(&self, now: Instant) {
        let mut inner = self.inner.write();
        let expired: Vec<Uid> = inner
            .assumed_pods
            .iter()
            .filter(|key| {
                inner.pod_states.get(*key).is_some_and(|s| {
                    s.binding_finished && s.deadline.is_some_and(|d| now > d)
                })
            })
            .cloned()
            .collect();
        for key in expired {
            if let Some(state) = inner.pod_states.get(&key) {
                warn!(pod = %state.pod.full_name(), "Assumed pod expired");
            }
            if let Err(e) = inner.expire_pod(&key) {
                error!(uid = %key, error = %e, "Expiring assumed pod failed");
            }
        }
    }

    /// Run the expiry loop forever, every `period`.
    pub async fn run_cleanup(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.period);
        loop {
            interval.tick().await;
            self.cleanup_assumed_pods(Instant::now());
        }
    }

    /// Copy the cache contents.
    #[must_use]
    pub fn dump(&self) -> Dump {
        let inner = self.inner.read();
        Dump {
            nodes: inner
                .nodes
                .iter()
                .map(|(name, &slot)| (name.clone(), (*inner.item(slot).info).clone()))
                .collect(),
            assumed_pods: inner.assumed_pods.clone(),
        }
    }

    /// Number of pods on all nodes, assumed ones included.
    #[must_use]
    pub fn pod_count(&self) -> usize {
        let inner = self.inner.read();
        inner
            .nodes
            .values()
            .map(|&slot| inner.item(slot).info.pods().len())
            .sum()
    }

    /// Number of node infos, including those kept alive only by pods.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.inner.read().nodes.len()
    }
}
