//! Object metadata shared by pods and nodes.

use crate::ids::Uid;
use crate::labels::Labels;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity and bookkeeping fields of a cluster object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    /// Object name, unique within its namespace (or cluster for nodes).
    pub name: String,
    /// Namespace. Empty for cluster-scoped objects.
    pub namespace: String,
    /// Unique identifier.
    pub uid: Uid,
    /// Labels.
    pub labels: Labels,
    /// Opaque version string bumped by the API server on every write.
    pub resource_version: String,
    /// Spec generation.
    pub generation: i64,
    /// Creation time.
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Set once graceful deletion has started.
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Metadata for a namespaced object.
    #[must_use]
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Metadata for a cluster-scoped object.
    #[must_use]
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// `namespace/name`, or just `name` when cluster-scoped.
    #[must_use]
    pub fn key(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }
}
