//! Does the pod fit in what the node has left?

use super::names::FIT as NAME;
use crate::error::{Result, SchedulerError};
use crate::framework::{
    decode_args, Code, CycleState, FilterPlugin, FrameworkHandle, Plugin, PreFilterPlugin, Status,
};
use crate::node_info::{pod_resource, NodeInfo, Resource};
use crate::plugins::helper::state_error;
use placement_core::{Pod, RESOURCE_CPU, RESOURCE_EPHEMERAL_STORAGE, RESOURCE_MEMORY, RESOURCE_PODS};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

const PRE_FILTER_STATE_KEY: &str = "PreFilterNodeResourcesFit";

/// Args of [`Fit`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeResourcesFitArgs {
    /// Extended resources the filter does not check.
    pub ignored_resources: Vec<String>,
    /// Resource groups (the part before `/`) the filter does not check.
    pub ignored_resource_groups: Vec<String>,
}

impl NodeResourcesFitArgs {
    /// Reject group names containing `/`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] naming the first bad group.
    pub fn validate(&self) -> Result<()> {
        for (i, group) in self.ignored_resource_groups.iter().enumerate() {
            if group.contains('/') {
                return Err(SchedulerError::Config(format!(
                    "ignoredResourceGroups[{i}]: invalid value {group:?}: resource group name can't contain '/'"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct PreFilterState(Resource);

/// One resource the node is short of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsufficientResource {
    /// Resource name.
    pub resource_name: String,
    /// Human readable reason.
    pub reason: String,
    /// What the pod asks for.
    pub requested: i64,
    /// What the node already has requested.
    pub used: i64,
    /// What the node can allocate.
    pub capacity: i64,
}

/// Filters out nodes without room for the pod's requests.
#[derive(Debug, Default)]
pub struct Fit {
    ignored_resources: HashSet<String>,
    ignored_resource_groups: HashSet<String>,
}

impl Plugin for Fit {
    fn name(&self) -> &str {
        NAME
    }

    fn as_pre_filter(&self) -> Option<&dyn PreFilterPlugin> {
        Some(self)
    }

    fn as_filter(&self) -> Option<&dyn FilterPlugin> {
        Some(self)
    }
}

impl PreFilterPlugin for Fit {
    fn pre_filter(&self, state: &CycleState, pod: &Pod) -> Status {
        state.write(PRE_FILTER_STATE_KEY, PreFilterState(pod_resource(pod).0));
        Status::success()
    }
}

impl FilterPlugin for Fit {
    fn filter(&self, state: &CycleState, _pod: &Pod, node_info: &NodeInfo) -> Status {
        let s = match state.read::<PreFilterState>(PRE_FILTER_STATE_KEY) {
            Ok(s) => s,
            Err(e) => return state_error(PRE_FILTER_STATE_KEY, &e),
        };
        let insufficient = fits_request(&s.0, node_info, &self.ignored_resources, &self.ignored_resource_groups);
        if insufficient.is_empty() {
            Status::success()
        } else {
            Status::with_reasons(
                Code::Unschedulable,
                insufficient.into_iter().map(|r| r.reason).collect(),
            )
        }
    }
}

/// Resources `pod` lacks on the node, ignoring nothing.
#[must_use]
pub fn fits(pod: &Pod, node_info: &NodeInfo) -> Vec<InsufficientResource> {
    fits_request(&pod_resource(pod).0, node_info, &HashSet::new(), &HashSet::new())
}

fn fits_request(
    request: &Resource,
    node_info: &NodeInfo,
    ignored_resources: &HashSet<String>,
    ignored_groups: &HashSet<String>,
) -> Vec<InsufficientResource> {
    let mut out = Vec::with_capacity(4);
    let allocatable = node_info.allocatable();
    let requested = node_info.requested();

    let pods = i64::try_from(node_info.pods().len()).unwrap_or(i64::MAX);
    if pods + 1 > allocatable.allowed_pod_number {
        out.push(InsufficientResource {
            resource_name: RESOURCE_PODS.into(),
            reason: "Too many pods".into(),
            requested: 1,
            used: pods,
            capacity: allocatable.allowed_pod_number,
        });
    }

    if request.milli_cpu == 0
        && request.memory == 0
        && request.ephemeral_storage == 0
        && request.scalar_resources.is_empty()
    {
        return out;
    }

    for (name, want, used, cap) in [
        (RESOURCE_CPU, request.milli_cpu, requested.milli_cpu, allocatable.milli_cpu),
        (RESOURCE_MEMORY, request.memory, requested.memory, allocatable.memory),
        (
            RESOURCE_EPHEMERAL_STORAGE,
            request.ephemeral_storage,
            requested.ephemeral_storage,
            allocatable.ephemeral_storage,
        ),
    ] {
        if cap < want + used {
            out.push(InsufficientResource {
                resource_name: name.into(),
                reason: format!("Insufficient {name}"),
                requested: want,
                used,
                capacity: cap,
            });
        }
    }

    for (name, &want) in &request.scalar_resources {
        let group = name.split('/').next().unwrap_or_default();
        if ignored_resources.contains(name) || ignored_groups.contains(group) {
            continue;
        }
        let used = requested.get(name);
        let cap = allocatable.get(name);
        if cap < want + used {
            out.push(InsufficientResource {
                resource_name: name.clone(),
                reason: format!("Insufficient {name}"),
                requested: want,
                used,
                capacity: cap,
            });
        }
    }
    out
}

/// Factory.
///
/// # Errors
///
/// Returns [`SchedulerError::Config`] when the args do not decode or validate.
pub fn new(args: Option<&serde_json::Value>, _handle: &FrameworkHandle) -> Result<Arc<dyn Plugin>> {
    let args: NodeResourcesFitArgs = decode_args(NAME, args)?;
    args.validate()?;
    Ok(Arc::new(Fit {
        ignored_resources: args.ignored_resources.into_iter().collect(),
        ignored_resource_groups: args.ignored_resource_groups.into_iter().collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Snapshot;
    use crate::testing::{make_node, make_pod, test_handle};
    use serde_json::json;

    fn node_info(capacity: &[(&str, &str)], pods: Vec<Pod>) -> NodeInfo {
        NodeInfo::with_node(
            Arc::new(make_node("n1").capacity(capacity).obj()),
            pods.into_iter().map(Arc::new),
        )
    }

    fn run(plugin: &Fit, pod: &Pod, info: &NodeInfo) -> Status {
        let state = CycleState::new();
        assert!(plugin.pre_filter(&state, pod).is_success());
        plugin.filter(&state, pod, info)
    }

    #[test]
    fn fits_when_room_is_left() {
        let info = node_info(&[("cpu", "2"), ("memory", "2Gi")], vec![]);
        let pod = make_pod("p").req(&[("cpu", "500m"), ("memory", "500Mi")]).obj();
        assert!(run(&Fit::default(), &pod, &info).is_success());
    }

    #[test]
    fn reports_every_insufficient_resource() {
        let existing = make_pod("e").node("n1").req(&[("cpu", "800m")]).obj();
        let info = node_info(&[("cpu", "1"), ("memory", "1Gi")], vec![existing]);
        let pod = make_pod("p").req(&[("cpu", "500m"), ("memory", "2Gi")]).obj();
        let status = run(&Fit::default(), &pod, &info);
        assert_eq!(status.code(), Code::Unschedulable);
        assert_eq!(status.reasons(), ["Insufficient cpu", "Insufficient memory"]);
    }

    #[test]
    fn too_many_pods() {
        let info = node_info(&[("pods", "1")], vec![make_pod("e").node("n1").obj()]);
        let status = run(&Fit::default(), &make_pod("p").obj(), &info);
        assert_eq!(status.reasons(), ["Too many pods"]);
        assert_eq!(fits(&make_pod("p").obj(), &info)[0].capacity, 1);
    }

    #[test]
    fn ignored_extended_resources_are_skipped() {
        let info = node_info(&[("cpu", "1")], vec![]);
        let pod = make_pod("p")
            .req(&[("example.com/gpu", "1"), ("vendor.io/fpga", "1")])
            .obj();
        let status = run(&Fit::default(), &pod, &info);
        assert_eq!(status.reasons().len(), 2);

        let handle = test_handle(Snapshot::new());
        let plugin = new(
            Some(&json!({"ignoredResources": ["example.com/gpu"], "ignoredResourceGroups": ["vendor.io"]})),
            &handle,
        )
        .unwrap();
        let state = CycleState::new();
        plugin.as_pre_filter().unwrap().pre_filter(&state, &pod);
        assert!(plugin.as_filter().unwrap().filter(&state, &pod, &info).is_success());
    }

    #[test]
    fn groups_with_slash_are_rejected() {
        let args = NodeResourcesFitArgs {
            ignored_resource_groups: vec!["example.com/gpu".into()],
            ..NodeResourcesFitArgs::default()
        };
        assert!(matches!(args.validate(), Err(SchedulerError::Config(_))));
    }

    #[test]
    fn missing_pre_filter_state_is_an_error() {
        let info = node_info(&[("cpu", "1")], vec![]);
        let status = Fit::default().filter(&CycleState::new(), &make_pod("p").obj(), &info);
        assert_eq!(status.code(), Code::Error);
    }
}
