//! Error types for the scheduler crate.

use crate::generic::FitError;
use thiserror::Error;

/// Errors that can occur while caching, queueing or scheduling pods.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    KubeApi(#[from] kube::Error),

    /// Model parsing error.
    #[error("invalid object: {0}")]
    Core(#[from] placement_core::CoreError),

    /// JSON decoding error (config files, plugin args).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A pod was added to the cache twice.
    #[error("pod {pod} is in the cache, so can't be assumed")]
    PodAlreadyInCache {
        /// Pod key.
        pod: String,
    },

    /// A pod the caller expected to be cached is not.
    #[error("pod {pod} wasn't found in the cache")]
    PodNotInCache {
        /// Pod key.
        pod: String,
    },

    /// A pod was expected to be in the assumed state.
    #[error("pod {pod} wasn't assumed so cannot be forgotten")]
    PodNotAssumed {
        /// Pod key.
        pod: String,
    },

    /// The caller's node for a pod differs from the cached one.
    #[error("pod {pod} was assumed on {cached} but assigned to {actual}")]
    NodeMismatch {
        /// Pod key.
        pod: String,
        /// Node recorded in the cache.
        cached: String,
        /// Node given by the caller.
        actual: String,
    },

    /// An update moved a bound pod to a different node.
    #[error("pod {pod} updated on a different node than previously added to: {from} -> {to}")]
    PodMigrated {
        /// Pod key.
        pod: String,
        /// Node the pod was cached on.
        from: String,
        /// Node in the update.
        to: String,
    },

    /// The node is not known to the cache.
    #[error("node {0} is not found")]
    NodeNotFound(String),

    /// The pod is not a member of the node it claims.
    #[error("no corresponding pod {pod} in pods of node {node}")]
    PodNotOnNode {
        /// Pod key.
        pod: String,
        /// Node name.
        node: String,
    },

    /// The pod carries no uid.
    #[error("pod {0} has no uid")]
    MissingUid(String),

    /// Snapshot and cache diverged.
    #[error("snapshot state is not consistent, length of nodes in snapshot: {snapshot}, length of nodes in cache: {cache}")]
    SnapshotInconsistent {
        /// Node count in the snapshot list.
        snapshot: usize,
        /// Node count in the node tree.
        cache: usize,
    },

    /// The scheduling queue has been closed.
    #[error("scheduling queue is closed")]
    QueueClosed,

    /// The pod is already in one of the sub-queues.
    #[error("pod {pod} is already present in the {queue} queue")]
    PodAlreadyQueued {
        /// Pod key.
        pod: String,
        /// Sub-queue holding it.
        queue: &'static str,
    },

    /// The pod was deleted while it was being scheduled.
    #[error("pod {0} was deleted while being scheduled")]
    PodDeleted(String),

    /// The pod was bound while it was being scheduled.
    #[error("pod {pod} has been assigned to node {node}")]
    PodAssigned {
        /// Pod key.
        pod: String,
        /// Node it is bound to.
        node: String,
    },

    /// The cluster has no nodes.
    #[error("no nodes available to schedule pods")]
    NoNodesAvailable,

    /// No node passed the filters.
    #[error("{0}")]
    Fit(Box<FitError>),

    /// A pod names a profile that does not exist.
    #[error("profile not found for scheduler name {0:?}")]
    ProfileNotFound(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A plugin reported an internal error.
    #[error("{0}")]
    Plugin(String),

    /// A plugin read cycle state that was never written.
    #[error("reading {0:?} from cycle state: not found")]
    StateNotFound(String),

    /// The bind pipeline rejected the pod.
    #[error("Binding rejected: {0}")]
    BindRejected(String),
}

impl SchedulerError {
    /// Check if this error is retriable.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::KubeApi(_)
                | Self::Fit(_)
                | Self::NoNodesAvailable
                | Self::SnapshotInconsistent { .. }
                | Self::Plugin(_)
                | Self::BindRejected(_)
        )
    }

    /// Check if this error means no node can currently host the pod.
    #[must_use]
    pub fn is_unschedulable(&self) -> bool {
        matches!(self, Self::Fit(_) | Self::NoNodesAvailable)
    }
}

impl From<FitError> for SchedulerError {
    fn from(err: FitError) -> Self {
        Self::Fit(Box::new(err))
    }
}

/// A specialized Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;
