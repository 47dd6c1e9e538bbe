//! Resource fit and resource-based scoring.
//!
//! Every scorer here looks at the same two numbers per resource: what the
//! node would have requested with the pod placed on it, and what it can
//! allocate. CPU and memory use the non-zero requests, so pods without
//! requests still count against a node.

mod balanced_allocation;
mod fit;
mod least_allocated;
mod most_allocated;
mod requested_to_capacity_ratio;

pub use balanced_allocation::BalancedAllocation;
pub use fit::{fits, Fit, InsufficientResource, NodeResourcesFitArgs};
pub use least_allocated::{LeastAllocated, NodeResourcesLeastAllocatedArgs};
pub use most_allocated::{MostAllocated, NodeResourcesMostAllocatedArgs};
pub use requested_to_capacity_ratio::{
    RequestedToCapacityRatio, RequestedToCapacityRatioArgs, UtilizationShapePoint,
};

/// Registered plugin names.
pub mod names {
    /// Resource fit filter.
    pub const FIT: &str = "NodeResourcesFit";
    /// Spread scoring.
    pub const LEAST_ALLOCATED: &str = "NodeResourcesLeastAllocated";
    /// Bin-packing scoring.
    pub const MOST_ALLOCATED: &str = "NodeResourcesMostAllocated";
    /// CPU/memory balance scoring.
    pub const BALANCED_ALLOCATION: &str = "NodeResourcesBalancedAllocation";
    /// Shape-based scoring.
    pub const REQUESTED_TO_CAPACITY_RATIO: &str = "RequestedToCapacityRatio";
}

pub use balanced_allocation::new as new_balanced_allocation;
pub use fit::new as new_fit;
pub use least_allocated::new as new_least_allocated;
pub use most_allocated::new as new_most_allocated;
pub use requested_to_capacity_ratio::new as new_requested_to_capacity_ratio;

use crate::error::{Result, SchedulerError};
use crate::node_info::{NodeInfo, DEFAULT_MEMORY_REQUEST, DEFAULT_MILLI_CPU_REQUEST};
use placement_core::{Pod, ResourceList, RESOURCE_CPU, RESOURCE_EPHEMERAL_STORAGE, RESOURCE_MEMORY};
use serde::{Deserialize, Serialize};

/// Lowest accepted resource weight.
pub const MIN_RESOURCE_WEIGHT: i64 = 1;
/// Highest accepted resource weight.
pub const MAX_RESOURCE_WEIGHT: i64 = 100;

/// A resource and its weight in a scorer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Resource name.
    pub name: String,
    /// Weight.
    pub weight: i64,
}

impl ResourceSpec {
    /// Build a spec.
    #[must_use]
    pub fn new(name: &str, weight: i64) -> Self {
        Self {
            name: name.to_string(),
            weight,
        }
    }
}

/// CPU and memory, weight 1 each.
#[must_use]
pub fn default_resources() -> Vec<ResourceSpec> {
    vec![ResourceSpec::new(RESOURCE_CPU, 1), ResourceSpec::new(RESOURCE_MEMORY, 1)]
}

/// Check every weight is within `[1, 100]`.
///
/// # Errors
///
/// Returns [`SchedulerError::Config`] naming the first bad resource.
pub fn validate_resources(resources: &[ResourceSpec]) -> Result<()> {
    for r in resources {
        if !(MIN_RESOURCE_WEIGHT..=MAX_RESOURCE_WEIGHT).contains(&r.weight) {
            return Err(SchedulerError::Config(format!(
                "resources.weight: invalid value {} for resource {:?}: must be in the range [{MIN_RESOURCE_WEIGHT}, {MAX_RESOURCE_WEIGHT}]",
                r.weight, r.name
            )));
        }
    }
    Ok(())
}

/// Requested (with the pod) and allocatable amount of one resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    /// Node requests plus the pod's request.
    pub requested: i64,
    /// Allocatable capacity.
    pub allocatable: i64,
    /// Weight of the resource.
    pub weight: i64,
}

fn non_zero_request_for(requests: &ResourceList, resource: &str) -> i64 {
    match resource {
        RESOURCE_CPU => requests
            .get(RESOURCE_CPU)
            .map_or(DEFAULT_MILLI_CPU_REQUEST, placement_core::Quantity::milli_value),
        RESOURCE_MEMORY => requests
            .get(RESOURCE_MEMORY)
            .map_or(DEFAULT_MEMORY_REQUEST, placement_core::Quantity::value),
        other => requests.get(other).map_or(0, placement_core::Quantity::value),
    }
}

/// The pod's request of `resource`, with non-zero defaults for CPU and
/// memory, plus overhead.
#[must_use]
pub fn pod_request_for(pod: &Pod, resource: &str) -> i64 {
    let containers: i64 = pod
        .spec
        .containers
        .iter()
        .map(|c| non_zero_request_for(&c.resources.requests, resource))
        .sum();
    let overhead = pod.spec.overhead.get(resource).map_or(0, |q| {
        if resource == RESOURCE_CPU {
            q.milli_value()
        } else {
            q.value()
        }
    });
    containers + overhead
}

/// Usage of every configured resource if `pod` were placed on the node.
#[must_use]
pub fn resource_usage(pod: &Pod, node_info: &NodeInfo, resources: &[ResourceSpec]) -> Vec<ResourceUsage> {
    resources
        .iter()
        .map(|r| {
            let pod_request = pod_request_for(pod, &r.name);
            let node_requested = match r.name.as_str() {
                RESOURCE_CPU => node_info.non_zero_requested().milli_cpu,
                RESOURCE_MEMORY => node_info.non_zero_requested().memory,
                RESOURCE_EPHEMERAL_STORAGE => node_info.requested().ephemeral_storage,
                other => node_info.requested().get(other),
            };
            ResourceUsage {
                requested: node_requested + pod_request,
                allocatable: node_info.allocatable().get(&r.name),
                weight: r.weight,
            }
        })
        .collect()
}

/// Weighted mean of `per_resource` over `usage`, integer division.
pub(crate) fn weighted_score(usage: &[ResourceUsage], per_resource: impl Fn(i64, i64) -> i64) -> i64 {
    let weight_sum: i64 = usage.iter().map(|u| u.weight).sum();
    if weight_sum == 0 {
        return 0;
    }
    let total: i64 = usage
        .iter()
        .map(|u| per_resource(u.requested, u.allocatable) * u.weight)
        .sum();
    total / weight_sum
}
