//! Pods: the unit of work the scheduler places.

use crate::ids::Uid;
use crate::labels::{LabelSelector, Labels, NodeSelector, NodeSelectorTerm};
use crate::meta::ObjectMeta;
use crate::quantity::Quantity;
use crate::taint::Toleration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// CPU resource name, measured in cores.
pub const RESOURCE_CPU: &str = "cpu";
/// Memory resource name, measured in bytes.
pub const RESOURCE_MEMORY: &str = "memory";
/// Local ephemeral storage resource name, measured in bytes.
pub const RESOURCE_EPHEMERAL_STORAGE: &str = "ephemeral-storage";
/// Pod count resource name.
pub const RESOURCE_PODS: &str = "pods";

/// Resource name to amount.
pub type ResourceList = BTreeMap<String, Quantity>;

/// Requests and limits of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequirements {
    /// Minimum amounts the container needs.
    pub requests: ResourceList,
    /// Maximum amounts the container may use.
    pub limits: ResourceList,
}

/// A container of a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Container {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Resource requirements.
    pub resources: ResourceRequirements,
}

/// The scheduler's view of a volume: its name and the topology labels of the
/// storage backing it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Volume {
    /// Volume name.
    pub name: String,
    /// Zone/region labels of the bound storage. Values may list several
    /// zones joined with `__`.
    pub topology: Labels,
}

/// A weighted preferred node selector term.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferredSchedulingTerm {
    /// Weight in 1-100.
    pub weight: i32,
    /// The term.
    pub preference: NodeSelectorTerm,
}

/// Node affinity of a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeAffinity {
    /// Hard requirement.
    #[serde(rename = "requiredDuringSchedulingIgnoredDuringExecution")]
    pub required: Option<NodeSelector>,
    /// Soft preferences.
    #[serde(rename = "preferredDuringSchedulingIgnoredDuringExecution")]
    pub preferred: Vec<PreferredSchedulingTerm>,
}

/// A set of pods, selected by label in some namespaces, that must or must not
/// be co-located within a topology domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodAffinityTerm {
    /// Pods to match. `None` matches nothing.
    pub label_selector: Option<LabelSelector>,
    /// Namespaces to search. Empty means the namespace of the owning pod.
    pub namespaces: Vec<String>,
    /// Node label defining the topology domain.
    pub topology_key: String,
}

/// A pod affinity term with a weight.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WeightedPodAffinityTerm {
    /// Weight in 1-100.
    pub weight: i32,
    /// The term.
    pub pod_affinity_term: PodAffinityTerm,
}

/// Pod affinity or anti-affinity rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodAffinityRules {
    /// Hard terms.
    #[serde(rename = "requiredDuringSchedulingIgnoredDuringExecution")]
    pub required: Vec<PodAffinityTerm>,
    /// Soft terms.
    #[serde(rename = "preferredDuringSchedulingIgnoredDuringExecution")]
    pub preferred: Vec<WeightedPodAffinityTerm>,
}

impl PodAffinityRules {
    /// Check whether there is any term at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.required.is_empty() && self.preferred.is_empty()
    }
}

/// Scheduling constraints of a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Affinity {
    /// Node affinity.
    pub node_affinity: Option<NodeAffinity>,
    /// Pod affinity.
    pub pod_affinity: Option<PodAffinityRules>,
    /// Pod anti-affinity.
    pub pod_anti_affinity: Option<PodAffinityRules>,
}

/// What to do when a spread constraint cannot be satisfied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnsatisfiableConstraintAction {
    /// Hard constraint.
    #[default]
    DoNotSchedule,
    /// Soft constraint.
    ScheduleAnyway,
}

/// How a group of pods should be spread across topology domains.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TopologySpreadConstraint {
    /// Maximum permitted difference between domains.
    pub max_skew: i32,
    /// Node label defining the domains.
    pub topology_key: String,
    /// Hard or soft.
    pub when_unsatisfiable: UnsatisfiableConstraintAction,
    /// Pods counted in each domain.
    pub label_selector: Option<LabelSelector>,
}

/// The desired state of a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodSpec {
    /// Profile that should schedule the pod.
    pub scheduler_name: String,
    /// Node the pod is bound to. Empty while pending.
    pub node_name: String,
    /// Required node labels.
    pub node_selector: Labels,
    /// Affinity rules.
    pub affinity: Option<Affinity>,
    /// Tolerations.
    pub tolerations: Vec<Toleration>,
    /// Topology spread constraints.
    pub topology_spread_constraints: Vec<TopologySpreadConstraint>,
    /// Priority. `None` is treated as zero.
    pub priority: Option<i32>,
    /// Application containers.
    pub containers: Vec<Container>,
    /// Init containers, run sequentially before the app containers.
    pub init_containers: Vec<Container>,
    /// Fixed per-pod overhead added to the container requests.
    pub overhead: ResourceList,
    /// Volumes.
    pub volumes: Vec<Volume>,
}

/// Lifecycle phase of a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PodPhase {
    /// Accepted but not running yet.
    #[default]
    Pending,
    /// At least one container is running.
    Running,
    /// All containers terminated successfully.
    Succeeded,
    /// At least one container failed.
    Failed,
    /// State cannot be determined.
    Unknown,
}

impl PodPhase {
    /// Check if the pod is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Condition type recorded when a scheduling attempt fails.
pub const POD_SCHEDULED: &str = "PodScheduled";
/// Condition reason for a pod no node can host.
pub const REASON_UNSCHEDULABLE: &str = "Unschedulable";
/// Condition reason for an internal scheduling error.
pub const REASON_SCHEDULER_ERROR: &str = "SchedulerError";

/// An observed condition of a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodCondition {
    /// Condition type, e.g. `PodScheduled`.
    #[serde(rename = "type")]
    pub type_: String,
    /// `True`, `False` or `Unknown`.
    pub status: String,
    /// Machine readable reason.
    pub reason: String,
    /// Human readable message.
    pub message: String,
    /// Last time the status flipped.
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// The observed state of a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodStatus {
    /// Lifecycle phase.
    pub phase: PodPhase,
    /// Conditions.
    pub conditions: Vec<PodCondition>,
    /// Node the pod is nominated for, if any.
    pub nominated_node_name: String,
}

/// A pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pod {
    /// Metadata.
    pub metadata: ObjectMeta,
    /// Desired state.
    pub spec: PodSpec,
    /// Observed state.
    pub status: PodStatus,
}

impl Pod {
    /// Create an empty pod with the given identity.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, uid: impl Into<Uid>) -> Self {
        let mut metadata = ObjectMeta::namespaced(namespace, name);
        metadata.uid = uid.into();
        Self {
            metadata,
            ..Self::default()
        }
    }

    /// The pod uid.
    #[must_use]
    pub fn uid(&self) -> &Uid {
        &self.metadata.uid
    }

    /// The pod name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// The pod namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    /// The pod labels.
    #[must_use]
    pub fn labels(&self) -> &Labels {
        &self.metadata.labels
    }

    /// `namespace/name`.
    #[must_use]
    pub fn full_name(&self) -> String {
        self.metadata.key()
    }

    /// The node the pod is bound to, empty while pending.
    #[must_use]
    pub fn node_name(&self) -> &str {
        &self.spec.node_name
    }

    /// Priority, zero when unset.
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.spec.priority.unwrap_or(0)
    }

    /// Check whether the pod has been placed on a node.
    #[must_use]
    pub fn is_assigned(&self) -> bool {
        !self.spec.node_name.is_empty()
    }

    /// Check whether graceful deletion has started.
    #[must_use]
    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Pod affinity rules, if any.
    #[must_use]
    pub fn pod_affinity(&self) -> Option<&PodAffinityRules> {
        self.spec.affinity.as_ref()?.pod_affinity.as_ref()
    }

    /// Pod anti-affinity rules, if any.
    #[must_use]
    pub fn pod_anti_affinity(&self) -> Option<&PodAffinityRules> {
        self.spec.affinity.as_ref()?.pod_anti_affinity.as_ref()
    }

    /// Node affinity, if any.
    #[must_use]
    pub fn node_affinity(&self) -> Option<&NodeAffinity> {
        self.spec.affinity.as_ref()?.node_affinity.as_ref()
    }

    /// Check whether the pod carries any pod affinity or anti-affinity term.
    #[must_use]
    pub fn has_pod_affinity_constraints(&self) -> bool {
        self.pod_affinity().is_some_and(|a| !a.is_empty())
            || self.pod_anti_affinity().is_some_and(|a| !a.is_empty())
    }

    /// Find a status condition by type.
    #[must_use]
    pub fn condition(&self, type_: &str) -> Option<&PodCondition> {
        self.status.conditions.iter().find(|c| c.type_ == type_)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_a_pending_pod() {
        let pod = Pod::new("default", "web-0", "uid-1");
        assert_eq!(pod.full_name(), "default/web-0");
        assert_eq!(pod.priority(), 0);
        assert!(!pod.is_assigned());
        assert!(!pod.is_terminating());
        assert!(!pod.has_pod_affinity_constraints());
        assert_eq!(pod.status.phase, PodPhase::Pending);
    }

    #[test]
    fn empty_affinity_rules_are_not_constraints() {
        let mut pod = Pod::new("default", "web-0", "uid-1");
        pod.spec.affinity = Some(Affinity {
            pod_anti_affinity: Some(PodAffinityRules::default()),
            ..Affinity::default()
        });
        assert!(!pod.has_pod_affinity_constraints());

        pod.spec.affinity = Some(Affinity {
            pod_affinity: Some(PodAffinityRules {
                required: vec![PodAffinityTerm::default()],
                preferred: vec![],
            }),
            ..Affinity::default()
        });
        assert!(pod.has_pod_affinity_constraints());
    }

    #[test]
    fn deserializes_wire_names() {
        let pod: Pod = serde_json::from_str(
            r#"{
                "metadata": {"name": "db-0", "namespace": "prod", "uid": "u-1", "labels": {"role": "db"}},
                "spec": {
                    "schedulerName": "default-scheduler",
                    "containers": [{"name": "db", "resources": {"requests": {"cpu": "500m", "memory": "1Gi"}}}],
                    "affinity": {"podAntiAffinity": {"requiredDuringSchedulingIgnoredDuringExecution": [
                        {"labelSelector": {"matchLabels": {"role": "db"}}, "topologyKey": "zone"}
                    ]}}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(pod.uid().as_str(), "u-1");
        assert_eq!(pod.spec.containers[0].resources.requests[RESOURCE_CPU].milli_value(), 500);
        assert_eq!(pod.pod_anti_affinity().unwrap().required[0].topology_key, "zone");
    }
}
