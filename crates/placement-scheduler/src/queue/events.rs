//! Cluster events that move pods out of the unschedulable queue.

use std::fmt;

/// Why pods are being moved between sub-queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterEvent {
    /// Unclassified.
    Unknown,
    /// A pending pod was added.
    PodAdd,
    /// A node was added.
    NodeAdd,
    /// A scheduling attempt failed.
    ScheduleAttemptFailure,
    /// A pod finished its backoff.
    BackoffComplete,
    /// A pod sat in the unschedulable queue for too long.
    UnschedulableTimeout,
    /// A bound pod was added.
    AssignedPodAdd,
    /// A bound pod was updated.
    AssignedPodUpdate,
    /// A bound pod was deleted.
    AssignedPodDelete,
    /// A node's `unschedulable` flag changed.
    NodeSpecUnschedulableChange,
    /// A node's allocatable resources changed.
    NodeAllocatableChange,
    /// A node's labels changed.
    NodeLabelChange,
    /// A node's taints changed.
    NodeTaintChange,
    /// A node's conditions changed.
    NodeConditionChange,
}

impl ClusterEvent {
    /// Event name as used in logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::PodAdd => "PodAdd",
            Self::NodeAdd => "NodeAdd",
            Self::ScheduleAttemptFailure => "ScheduleAttemptFailure",
            Self::BackoffComplete => "BackoffComplete",
            Self::UnschedulableTimeout => "UnschedulableTimeout",
            Self::AssignedPodAdd => "AssignedPodAdd",
            Self::AssignedPodUpdate => "AssignedPodUpdate",
            Self::AssignedPodDelete => "AssignedPodDelete",
            Self::NodeSpecUnschedulableChange => "NodeSpecUnschedulableChange",
            Self::NodeAllocatableChange => "NodeAllocatableChange",
            Self::NodeLabelChange => "NodeLabelChange",
            Self::NodeTaintChange => "NodeTaintChange",
            Self::NodeConditionChange => "NodeConditionChange",
        }
    }
}

impl fmt::Display for ClusterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
