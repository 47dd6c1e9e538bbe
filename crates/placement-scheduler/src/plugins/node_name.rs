//! Honour `spec.nodeName`.

use crate::error::Result;
use crate::framework::{CycleState, FilterPlugin, FrameworkHandle, Plugin, Status};
use crate::node_info::NodeInfo;
use placement_core::Pod;
use std::sync::Arc;

/// Registered name.
pub const NAME: &str = "NodeName";

/// Failure reason.
pub const ERR_REASON: &str = "node(s) didn't match the requested hostname";

/// Filters out every node but the one the pod names, if any.
#[derive(Debug, Default)]
pub struct NodeName;

impl Plugin for NodeName {
    fn name(&self) -> &str {
        NAME
    }

    fn as_filter(&self) -> Option<&dyn FilterPlugin> {
        Some(self)
    }
}

impl FilterPlugin for NodeName {
    fn filter(&self, _state: &CycleState, pod: &Pod, node_info: &NodeInfo) -> Status {
        if node_info.node().is_none() {
            return Status::error("node not found");
        }
        let wanted = pod.node_name();
        if wanted.is_empty() || wanted == node_info.name() {
            Status::success()
        } else {
            Status::unresolvable(ERR_REASON)
        }
    }
}

/// Factory.
///
/// # Errors
///
/// Never fails.
pub fn new(_args: Option<&serde_json::Value>, _handle: &FrameworkHandle) -> Result<Arc<dyn Plugin>> {
    Ok(Arc::new(NodeName))
}
