//! Nodes: the hosts pods are placed on.

use crate::labels::Labels;
use crate::meta::ObjectMeta;
use crate::pod::ResourceList;
use crate::taint::Taint;
use serde::{Deserialize, Serialize};

/// Node condition type reporting overall health.
pub const NODE_READY: &str = "Ready";

/// An observed condition of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeCondition {
    /// Condition type, e.g. `Ready`.
    #[serde(rename = "type")]
    pub type_: String,
    /// `True`, `False` or `Unknown`.
    pub status: String,
    /// Machine readable reason.
    pub reason: String,
    /// Human readable message.
    pub message: String,
}

/// An image present on a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerImage {
    /// Every name the image is known by.
    pub names: Vec<String>,
    /// Image size in bytes.
    pub size_bytes: i64,
}

/// The desired state of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeSpec {
    /// Cordoned nodes accept no new pods.
    pub unschedulable: bool,
    /// Taints.
    pub taints: Vec<Taint>,
}

/// The observed state of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeStatus {
    /// Total resources.
    pub capacity: ResourceList,
    /// Resources available to pods.
    pub allocatable: ResourceList,
    /// Conditions.
    pub conditions: Vec<NodeCondition>,
    /// Images present on the node.
    pub images: Vec<ContainerImage>,
}

/// A node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Node {
    /// Metadata.
    pub metadata: ObjectMeta,
    /// Desired state.
    pub spec: NodeSpec,
    /// Observed state.
    pub status: NodeStatus,
}

impl Node {
    /// Create an empty node with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::cluster(name),
            ..Self::default()
        }
    }

    /// The node name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// The node labels.
    #[must_use]
    pub fn labels(&self) -> &Labels {
        &self.metadata.labels
    }

    /// Find a condition by type.
    #[must_use]
    pub fn condition(&self, type_: &str) -> Option<&NodeCondition> {
        self.status.conditions.iter().find(|c| c.type_ == type_)
    }
}
