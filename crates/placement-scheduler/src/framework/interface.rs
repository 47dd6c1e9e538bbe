//! Plugin capabilities, one trait per extension point.
//!
//! A plugin implements [`Plugin`] and exposes each capability it has through
//! the matching `as_*` accessor; the framework builds its per-extension-point
//! lists by asking every enabled plugin for the capability.

use super::cycle_state::CycleState;
use super::status::{NodeToStatusMap, Status};
use crate::node_info::NodeInfo;
use crate::queue::QueuedPodInfo;
use async_trait::async_trait;
use placement_core::Pod;
use std::sync::Arc;
use std::time::Duration;

/// Lowest score a score plugin may return after normalization.
pub const MIN_NODE_SCORE: i64 = 0;
/// Highest score a score plugin may return after normalization.
pub const MAX_NODE_SCORE: i64 = 100;
/// Upper bound of a weighted total.
pub const MAX_TOTAL_SCORE: i64 = i64::MAX;

/// Score of one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeScore {
    /// Node name.
    pub name: String,
    /// Score.
    pub score: i64,
}

/// Output of a successful post-filter plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostFilterResult {
    /// Node the pod should be nominated to.
    pub nominated_node_name: String,
}

/// Base trait of every plugin.
pub trait Plugin: Send + Sync {
    /// Registered name.
    fn name(&self) -> &str;

    /// Queue ordering.
    fn as_queue_sort(&self) -> Option<&dyn QueueSortPlugin> {
        None
    }
    /// Per-pod pre-computation before filtering.
    fn as_pre_filter(&self) -> Option<&dyn PreFilterPlugin> {
        None
    }
    /// Per-node feasibility.
    fn as_filter(&self) -> Option<&dyn FilterPlugin> {
        None
    }
    /// Runs when no node is feasible.
    fn as_post_filter(&self) -> Option<&dyn PostFilterPlugin> {
        None
    }
    /// Pre-computation over the feasible nodes.
    fn as_pre_score(&self) -> Option<&dyn PreScorePlugin> {
        None
    }
    /// Per-node ranking.
    fn as_score(&self) -> Option<&dyn ScorePlugin> {
        None
    }
    /// Resource accounting before bind.
    fn as_reserve(&self) -> Option<&dyn ReservePlugin> {
        None
    }
    /// Approve, deny or delay the binding.
    fn as_permit(&self) -> Option<&dyn PermitPlugin> {
        None
    }
    /// Work that must happen before bind.
    fn as_pre_bind(&self) -> Option<&dyn PreBindPlugin> {
        None
    }
    /// Commit the pod to a node.
    fn as_bind(&self) -> Option<&dyn BindPlugin> {
        None
    }
    /// Notification after a successful bind.
    fn as_post_bind(&self) -> Option<&dyn PostBindPlugin> {
        None
    }
}

/// Orders the active queue.
pub trait QueueSortPlugin: Send + Sync {
    /// Check whether `a` should be popped before `b`.
    fn less(&self, a: &QueuedPodInfo, b: &QueuedPodInfo) -> bool;
}

/// Incremental updates of pre-filter state, used when simulating the
/// addition or removal of pods on a node.
pub trait PreFilterExtensions: Send + Sync {
    /// `pod_to_add` is added to `node_info`.
    fn add_pod(
        &self,
        state: &CycleState,
        pod_to_schedule: &Pod,
        pod_to_add: &Arc<Pod>,
        node_info: &NodeInfo,
    ) -> Status;

    /// `pod_to_remove` is removed from `node_info`.
    fn remove_pod(
        &self,
        state: &CycleState,
        pod_to_schedule: &Pod,
        pod_to_remove: &Arc<Pod>,
        node_info: &NodeInfo,
    ) -> Status;
}

/// Runs once per cycle before filtering.
pub trait PreFilterPlugin: Send + Sync {
    /// Compute state for the filter stage.
    fn pre_filter(&self, state: &CycleState, pod: &Pod) -> Status;

    /// Incremental update hooks, if supported.
    fn pre_filter_extensions(&self) -> Option<&dyn PreFilterExtensions> {
        None
    }
}

/// Decides whether a node can host the pod.
pub trait FilterPlugin: Send + Sync {
    /// Check one node.
    fn filter(&self, state: &CycleState, pod: &Pod, node_info: &NodeInfo) -> Status;
}

/// Runs after filtering found no feasible node.
pub trait PostFilterPlugin: Send + Sync {
    /// Try to make the pod schedulable, e.g. by nominating a node.
    fn post_filter(
        &self,
        state: &CycleState,
        pod: &Pod,
        statuses: &NodeToStatusMap,
    ) -> (Option<PostFilterResult>, Status);
}

/// Runs once per cycle over the feasible nodes before scoring.
pub trait PreScorePlugin: Send + Sync {
    /// Compute state for the score stage.
    fn pre_score(&self, state: &CycleState, pod: &Pod, nodes: &[Arc<NodeInfo>]) -> Status;
}

/// Normalization of a score plugin's raw scores.
pub trait ScoreExtensions: Send + Sync {
    /// Rewrite `scores` in place into `[MIN_NODE_SCORE, MAX_NODE_SCORE]`.
    fn normalize_score(&self, state: &CycleState, pod: &Pod, scores: &mut [NodeScore]) -> Status;
}

/// Ranks feasible nodes.
pub trait ScorePlugin: Send + Sync {
    /// Score one node.
    ///
    /// # Errors
    ///
    /// Returns a non-success status when the node cannot be scored.
    fn score(&self, state: &CycleState, pod: &Pod, node_info: &NodeInfo) -> Result<i64, Status>;

    /// Normalization, if the raw scores need it.
    fn score_extensions(&self) -> Option<&dyn ScoreExtensions> {
        None
    }
}

/// Reserves resources for the pod before it is bound.
pub trait ReservePlugin: Send + Sync {
    /// Reserve. A failure aborts the cycle.
    fn reserve(&self, state: &CycleState, pod: &Pod, node_name: &str) -> Status;

    /// Undo [`ReservePlugin::reserve`]. Must be idempotent.
    fn unreserve(&self, state: &CycleState, pod: &Pod, node_name: &str);
}

/// Approves, rejects or delays a placement.
pub trait PermitPlugin: Send + Sync {
    /// Decide. With [`super::Code::Wait`] the duration bounds the wait.
    fn permit(&self, state: &CycleState, pod: &Pod, node_name: &str) -> (Status, Duration);
}

/// Work done before the pod is bound.
#[async_trait]
pub trait PreBindPlugin: Send + Sync {
    /// Prepare the bind.
    async fn pre_bind(&self, state: &CycleState, pod: &Pod, node_name: &str) -> Status;
}

/// Commits the pod to a node.
#[async_trait]
pub trait BindPlugin: Send + Sync {
    /// Bind, or return [`super::Code::Skip`] to let the next bind plugin
    /// handle the pod.
    async fn bind(&self, state: &CycleState, pod: &Pod, node_name: &str) -> Status;
}

/// Informational hook after a successful bind.
pub trait PostBindPlugin: Send + Sync {
    /// Observe the bind.
    fn post_bind(&self, state: &CycleState, pod: &Pod, node_name: &str);
}
