//! Per-node aggregates: the node record, resident pods and summed requests.
//!
//! A [`NodeInfo`] is owned and mutated by the cache only. Snapshots hold
//! cheap clones: pods are behind `Arc` and never mutated once stored.

use crate::error::{Result, SchedulerError};
use placement_core::{
    LabelSelector, Node, Pod, ResourceList, Uid, RESOURCE_CPU, RESOURCE_EPHEMERAL_STORAGE,
    RESOURCE_MEMORY, RESOURCE_PODS,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// CPU request assumed for a container that does not specify one, in millicores.
pub const DEFAULT_MILLI_CPU_REQUEST: i64 = 100;
/// Memory request assumed for a container that does not specify one, in bytes.
pub const DEFAULT_MEMORY_REQUEST: i64 = 200 * 1024 * 1024;

static GENERATION: AtomicI64 = AtomicI64::new(0);

/// Draw the next value of the process-wide generation counter.
///
/// Every `NodeInfo` mutation takes a fresh value, so generations are strictly
/// increasing across all nodes for the lifetime of the process.
pub fn next_generation() -> i64 {
    GENERATION.fetch_add(1, Ordering::SeqCst) + 1
}

/// A resource vector: CPU in millicores, everything else in whole units.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resource {
    /// CPU in millicores.
    pub milli_cpu: i64,
    /// Memory in bytes.
    pub memory: i64,
    /// Ephemeral storage in bytes.
    pub ephemeral_storage: i64,
    /// Pod slots. Only meaningful for allocatable.
    pub allowed_pod_number: i64,
    /// Every other resource, by name.
    pub scalar_resources: BTreeMap<String, i64>,
}

impl Resource {
    /// Build a resource vector from a resource list.
    #[must_use]
    pub fn from_list(list: &ResourceList) -> Self {
        let mut r = Self::default();
        r.add(list);
        r
    }

    /// Add every entry of a resource list.
    pub fn add(&mut self, list: &ResourceList) {
        for (name, q) in list {
            match name.as_str() {
                RESOURCE_CPU => self.milli_cpu += q.milli_value(),
                RESOURCE_MEMORY => self.memory += q.value(),
                RESOURCE_EPHEMERAL_STORAGE => self.ephemeral_storage += q.value(),
                RESOURCE_PODS => self.allowed_pod_number += q.value(),
                other => *self.scalar_resources.entry(other.to_string()).or_default() += q.value(),
            }
        }
    }

    /// Raise each field to at least the value in the list.
    pub fn set_max(&mut self, list: &ResourceList) {
        for (name, q) in list {
            match name.as_str() {
                RESOURCE_CPU => self.milli_cpu = self.milli_cpu.max(q.milli_value()),
                RESOURCE_MEMORY => self.memory = self.memory.max(q.value()),
                RESOURCE_EPHEMERAL_STORAGE => {
                    self.ephemeral_storage = self.ephemeral_storage.max(q.value());
                }
                RESOURCE_PODS => self.allowed_pod_number = self.allowed_pod_number.max(q.value()),
                other => {
                    let entry = self.scalar_resources.entry(other.to_string()).or_default();
                    *entry = (*entry).max(q.value());
                }
            }
        }
    }

    /// Add another vector into this one.
    pub fn add_resource(&mut self, other: &Self) {
        self.milli_cpu += other.milli_cpu;
        self.memory += other.memory;
        self.ephemeral_storage += other.ephemeral_storage;
        self.allowed_pod_number += other.allowed_pod_number;
        for (name, v) in &other.scalar_resources {
            *self.scalar_resources.entry(name.clone()).or_default() += v;
        }
    }

    /// Subtract another vector from this one.
    pub fn sub_resource(&mut self, other: &Self) {
        self.milli_cpu -= other.milli_cpu;
        self.memory -= other.memory;
        self.ephemeral_storage -= other.ephemeral_storage;
        self.allowed_pod_number -= other.allowed_pod_number;
        for (name, v) in &other.scalar_resources {
            *self.scalar_resources.entry(name.clone()).or_default() -= v;
        }
    }

    /// Amount of a named resource, in the unit the scheduler scores with
    /// (millicores for CPU, whole units otherwise).
    #[must_use]
    pub fn get(&self, name: &str) -> i64 {
        match name {
            RESOURCE_CPU => self.milli_cpu,
            RESOURCE_MEMORY => self.memory,
            RESOURCE_EPHEMERAL_STORAGE => self.ephemeral_storage,
            RESOURCE_PODS => self.allowed_pod_number,
            other => self.scalar_resources.get(other).copied().unwrap_or(0),
        }
    }
}

/// Request of a container, with the non-zero defaults applied to CPU and
/// memory when they are absent.
#[must_use]
pub fn non_zero_requests(requests: &ResourceList) -> (i64, i64) {
    let cpu = requests
        .get(RESOURCE_CPU)
        .map_or(DEFAULT_MILLI_CPU_REQUEST, placement_core::Quantity::milli_value);
    let memory = requests
        .get(RESOURCE_MEMORY)
        .map_or(DEFAULT_MEMORY_REQUEST, placement_core::Quantity::value);
    (cpu, memory)
}

/// Resource contribution of a pod to its node: the sum of container requests
/// plus overhead, and the same with non-zero defaults for CPU and memory.
#[must_use]
pub fn pod_resource(pod: &Pod) -> (Resource, Resource) {
    let mut res = Resource::default();
    let mut non_zero = Resource::default();
    for c in &pod.spec.containers {
        res.add(&c.resources.requests);
        let (cpu, memory) = non_zero_requests(&c.resources.requests);
        non_zero.milli_cpu += cpu;
        non_zero.memory += memory;
    }
    if !pod.spec.overhead.is_empty() {
        res.add(&pod.spec.overhead);
        if let Some(cpu) = pod.spec.overhead.get(RESOURCE_CPU) {
            non_zero.milli_cpu += cpu.milli_value();
        }
        if let Some(memory) = pod.spec.overhead.get(RESOURCE_MEMORY) {
            non_zero.memory += memory.value();
        }
    }
    (res, non_zero)
}

/// A pod affinity term with its namespaces resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityTerm {
    /// Namespaces the term applies to.
    pub namespaces: HashSet<String>,
    /// Selector. `None` matches nothing.
    pub selector: Option<LabelSelector>,
    /// Topology key.
    pub topology_key: String,
}

impl AffinityTerm {
    fn new(owner: &Pod, term: &placement_core::PodAffinityTerm) -> Self {
        let namespaces = if term.namespaces.is_empty() {
            std::iter::once(owner.namespace().to_string()).collect()
        } else {
            term.namespaces.iter().cloned().collect()
        };
        Self {
            namespaces,
            selector: term.label_selector.clone(),
            topology_key: term.topology_key.clone(),
        }
    }

    /// Check whether `pod` is one of the pods this term selects.
    #[must_use]
    pub fn matches(&self, pod: &Pod) -> bool {
        self.namespaces.contains(pod.namespace())
            && placement_core::selector_matches(self.selector.as_ref(), pod.labels())
    }
}

/// An [`AffinityTerm`] with a weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightedAffinityTerm {
    /// The term.
    pub term: AffinityTerm,
    /// Weight.
    pub weight: i32,
}

/// A pod together with its pre-parsed affinity terms.
#[derive(Debug, Clone)]
pub struct PodInfo {
    /// The pod.
    pub pod: Arc<Pod>,
    /// Required affinity terms.
    pub required_affinity_terms: Vec<AffinityTerm>,
    /// Required anti-affinity terms.
    pub required_anti_affinity_terms: Vec<AffinityTerm>,
    /// Preferred affinity terms.
    pub preferred_affinity_terms: Vec<WeightedAffinityTerm>,
    /// Preferred anti-affinity terms.
    pub preferred_anti_affinity_terms: Vec<WeightedAffinityTerm>,
}

impl PodInfo {
    /// Parse the affinity terms of a pod.
    #[must_use]
    pub fn new(pod: Arc<Pod>) -> Self {
        let required = |rules: Option<&placement_core::PodAffinityRules>| {
            rules.map_or_else(Vec::new, |r| {
                r.required.iter().map(|t| AffinityTerm::new(&pod, t)).collect()
            })
        };
        let preferred = |rules: Option<&placement_core::PodAffinityRules>| {
            rules.map_or_else(Vec::new, |r| {
                r.preferred
                    .iter()
                    .map(|w| WeightedAffinityTerm {
                        term: AffinityTerm::new(&pod, &w.pod_affinity_term),
                        weight: w.weight,
                    })
                    .collect()
            })
        };
        Self {
            required_affinity_terms: required(pod.pod_affinity()),
            required_anti_affinity_terms: required(pod.pod_anti_affinity()),
            preferred_affinity_terms: preferred(pod.pod_affinity()),
            preferred_anti_affinity_terms: preferred(pod.pod_anti_affinity()),
            pod,
        }
    }

    /// Check whether the pod carries any affinity or anti-affinity term.
    #[must_use]
    pub fn has_affinity(&self) -> bool {
        !(self.required_affinity_terms.is_empty()
            && self.required_anti_affinity_terms.is_empty()
            && self.preferred_affinity_terms.is_empty()
            && self.preferred_anti_affinity_terms.is_empty())
    }
}

/// Size of an image and how many nodes hold it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageStateSummary {
    /// Image size in bytes.
    pub size: i64,
    /// Number of nodes that have the image.
    pub num_nodes: usize,
}

/// The cache key of a pod.
///
/// # Errors
///
/// Returns [`SchedulerError::MissingUid`] if the pod has no uid.
pub fn pod_key(pod: &Pod) -> Result<Uid> {
    if pod.uid().is_empty() {
        return Err(SchedulerError::MissingUid(pod.full_name()));
    }
    Ok(pod.uid().clone())
}

/// Aggregated information about one node.
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    node: Option<Arc<Node>>,
    pods: Vec<Arc<PodInfo>>,
    pods_with_affinity: Vec<Arc<PodInfo>>,
    pods_with_required_anti_affinity: Vec<Arc<PodInfo>>,
    requested: Resource,
    non_zero_requested: Resource,
    allocatable: Resource,
    image_states: HashMap<String, ImageStateSummary>,
    generation: i64,
}

impl NodeInfo {
    /// Create an empty node info with a fresh generation.
    #[must_use]
    pub fn new() -> Self {
        Self {
            generation: next_generation(),
            ..Self::default()
        }
    }

    /// Create a node info for `node` hosting `pods`.
    #[must_use]
    pub fn with_node(node: Arc<Node>, pods: impl IntoIterator<Item = Arc<Pod>>) -> Self {
        let mut info = Self::new();
        info.set_node(node);
        for pod in pods {
            info.add_pod(pod);
        }
        info
    }

    /// The node record, if it has been observed.
    #[must_use]
    pub fn node(&self) -> Option<&Arc<Node>> {
        self.node.as_ref()
    }

    /// Name of the node, empty when the node record is missing.
    #[must_use]
    pub fn name(&self) -> &str {
        self.node.as_ref().map_or("", |n| n.name())
    }

    /// Resident pods.
    #[must_use]
    pub fn pods(&self) -> &[Arc<PodInfo>] {
        &self.pods
    }

    /// Resident pods that carry any affinity term.
    #[must_use]
    pub fn pods_with_affinity(&self) -> &[Arc<PodInfo>] {
        &self.pods_with_affinity
    }

    /// Resident pods that carry a required anti-affinity term.
    #[must_use]
    pub fn pods_with_required_anti_affinity(&self) -> &[Arc<PodInfo>] {
        &self.pods_with_required_anti_affinity
    }

    /// Summed requests of resident pods.
    #[must_use]
    pub fn requested(&self) -> &Resource {
        &self.requested
    }

    /// Summed requests with CPU and memory defaults applied.
    #[must_use]
    pub fn non_zero_requested(&self) -> &Resource {
        &self.non_zero_requested
    }

    /// Allocatable resources of the node.
    #[must_use]
    pub fn allocatable(&self) -> &Resource {
        &self.allocatable
    }

    /// Image states, keyed by normalized image name.
    #[must_use]
    pub fn image_states(&self) -> &HashMap<String, ImageStateSummary> {
        &self.image_states
    }

    /// Replace the image states. Called by the cache.
    pub fn set_image_states(&mut self, states: HashMap<String, ImageStateSummary>) {
        self.image_states = states;
    }

    /// Generation of the last mutation.
    #[must_use]
    pub fn generation(&self) -> i64 {
        self.generation
    }

    /// Add a pod.
    pub fn add_pod(&mut self, pod: Arc<Pod>) {
        self.add_pod_info(Arc::new(PodInfo::new(pod)));
    }

    /// Add an already parsed pod.
    pub fn add_pod_info(&mut self, info: Arc<PodInfo>) {
        let (res, non_zero) = pod_resource(&info.pod);
        self.requested.add_resource(&res);
        self.non_zero_requested.milli_cpu += non_zero.milli_cpu;
        self.non_zero_requested.memory += non_zero.memory;
        if info.has_affinity() {
            self.pods_with_affinity.push(Arc::clone(&info));
        }
        if !info.required_anti_affinity_terms.is_empty() {
            self.pods_with_required_anti_affinity.push(Arc::clone(&info));
        }
        self.pods.push(info);
        self.generation = next_generation();
    }

    /// Remove a pod, identified by uid.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::PodNotOnNode`] if the pod is not resident and
    /// [`SchedulerError::MissingUid`] if it has no uid.
    pub fn remove_pod(&mut self, pod: &Pod) -> Result<()> {
        let key = pod_key(pod)?;
        let Some(index) = self.pods.iter().position(|p| p.pod.uid() == &key) else {
            return Err(SchedulerError::PodNotOnNode {
                pod: pod.full_name(),
                node: self.name().to_string(),
            });
        };
        let removed = self.pods.swap_remove(index);
        self.pods_with_affinity.retain(|p| p.pod.uid() != &key);
        self.pods_with_required_anti_affinity
            .retain(|p| p.pod.uid() != &key);

        // Use the stored copy so the subtraction mirrors the original addition.
        let (res, non_zero) = pod_resource(&removed.pod);
        self.requested.sub_resource(&res);
        self.non_zero_requested.milli_cpu -= non_zero.milli_cpu;
        self.non_zero_requested.memory -= non_zero.memory;
        self.generation = next_generation();
        Ok(())
    }

    /// Set or replace the node record.
    pub fn set_node(&mut self, node: Arc<Node>) {
        self.allocatable = Resource::from_list(&node.status.allocatable);
        self.node = Some(node);
        self.generation = next_generation();
    }

    /// Drop the node record, keeping resident pods.
    pub fn remove_node(&mut self) {
        self.node = None;
        self.generation = next_generation();
    }

    /// Check whether the node info holds neither a node nor pods.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.node.is_none() && self.pods.is_empty()
    }
}
