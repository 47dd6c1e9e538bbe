//! Keep pods off cordoned nodes.

use crate::error::Result;
use crate::framework::{CycleState, FilterPlugin, FrameworkHandle, Plugin, Status};
use crate::node_info::NodeInfo;
use placement_core::well_known::TAINT_NODE_UNSCHEDULABLE;
use placement_core::{tolerations_tolerate_taint, Pod, Taint, TaintEffect};
use std::sync::Arc;

/// Registered name.
pub const NAME: &str = "NodeUnschedulable";

/// Reason when the node record is missing.
pub const ERR_REASON_UNKNOWN_CONDITION: &str = "node(s) had unknown conditions";
/// Reason when the node is cordoned.
pub const ERR_REASON_UNSCHEDULABLE: &str = "node(s) were unschedulable";

/// Rejects nodes with `spec.unschedulable` unless the pod tolerates the
/// unschedulable taint.
#[derive(Debug, Default)]
pub struct NodeUnschedulable;

impl Plugin for NodeUnschedulable {
    fn name(&self) -> &str {
        NAME
    }

    fn as_filter(&self) -> Option<&dyn FilterPlugin> {
        Some(self)
    }
}

impl FilterPlugin for NodeUnschedulable {
    fn filter(&self, _state: &CycleState, pod: &Pod, node_info: &NodeInfo) -> Status {
        let Some(node) = node_info.node() else {
            return Status::unresolvable(ERR_REASON_UNKNOWN_CONDITION);
        };
        if !node.spec.unschedulable {
            return Status::success();
        }
        let taint = Taint::new(TAINT_NODE_UNSCHEDULABLE, "", TaintEffect::NoSchedule);
        if tolerations_tolerate_taint(&pod.spec.tolerations, &taint) {
            Status::success()
        } else {
            Status::unresolvable(ERR_REASON_UNSCHEDULABLE)
        }
    }
}

/// Factory.
///
/// # Errors
///
/// Never fails.
pub fn new(_args: Option<&serde_json::Value>, _handle: &FrameworkHandle) -> Result<Arc<dyn Plugin>> {
    Ok(Arc::new(NodeUnschedulable))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{make_node, make_pod};
    use placement_core::{Toleration, TolerationOperator};

    #[test]
    fn cordoned_node_needs_toleration() {
        let cordoned = NodeInfo::with_node(Arc::new(make_node("n1").unschedulable().obj()), []);
        let open = NodeInfo::with_node(Arc::new(make_node("n2").obj()), []);
        let state = CycleState::new();
        let pod = make_pod("p").obj();

        assert!(NodeUnschedulable.filter(&state, &pod, &open).is_success());
        let status = NodeUnschedulable.filter(&state, &pod, &cordoned);
        assert_eq!(status.reasons(), [ERR_REASON_UNSCHEDULABLE]);

        let tolerant = make_pod("t")
            .toleration(Toleration {
                key: TAINT_NODE_UNSCHEDULABLE.into(),
                operator: TolerationOperator::Exists,
                effect: Some(TaintEffect::NoSchedule),
                ..Toleration::default()
            })
            .obj();
        assert!(NodeUnschedulable.filter(&state, &tolerant, &cordoned).is_success());
    }

    #[test]
    fn missing_node_is_unknown() {
        let status = NodeUnschedulable.filter(&CycleState::new(), &make_pod("p").obj(), &NodeInfo::new());
        assert_eq!(status.reasons(), [ERR_REASON_UNKNOWN_CONDITION]);
    }
}
