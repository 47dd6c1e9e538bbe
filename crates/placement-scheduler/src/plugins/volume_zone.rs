//! Zonal volume placement.

use super::helper::node_of;
use crate::error::Result;
use crate::framework::{CycleState, FilterPlugin, FrameworkHandle, Plugin, Status};
use crate::node_info::NodeInfo;
use placement_core::well_known::TOPOLOGY_LABELS;
use placement_core::Pod;
use std::sync::Arc;

/// Registered name.
pub const NAME: &str = "VolumeZone";

/// Failure reason.
pub const ERR_REASON_CONFLICT: &str = "node(s) had no available volume zone";

/// Separator of a multi-zone volume label value.
const MULTI_ZONE_DELIMITER: &str = "__";

/// Rejects nodes whose zone or region labels conflict with the topology of
/// the pod's volumes.
#[derive(Debug, Default)]
pub struct VolumeZone;

impl Plugin for VolumeZone {
    fn name(&self) -> &str {
        NAME
    }

    fn as_filter(&self) -> Option<&dyn FilterPlugin> {
        Some(self)
    }
}

impl FilterPlugin for VolumeZone {
    fn filter(&self, _state: &CycleState, pod: &Pod, node_info: &NodeInfo) -> Status {
        if pod.spec.volumes.is_empty() {
            return Status::success();
        }
        let node = match node_of(node_info) {
            Ok(node) => node,
            Err(status) => return status,
        };
        let labels = node.labels();
        if !TOPOLOGY_LABELS.iter().any(|k| labels.contains_key(*k)) {
            return Status::success();
        }
        for volume in &pod.spec.volumes {
            for (key, value) in &volume.topology {
                if !TOPOLOGY_LABELS.contains(&key.as_str()) {
                    continue;
                }
                let allowed = labels
                    .get(key)
                    .is_some_and(|node_value| value.split(MULTI_ZONE_DELIMITER).any(|v| v == node_value));
                if !allowed {
                    tracing::debug!(
                        pod = %pod.full_name(),
                        node = node.name(),
                        volume = %volume.name,
                        key = %key,
                        "Volume zone conflict"
                    );
                    return Status::unresolvable(ERR_REASON_CONFLICT);
                }
            }
        }
        Status::success()
    }
}

/// Factory.
///
/// # Errors
///
/// Never fails.
pub fn new(_args: Option<&serde_json::Value>, _handle: &FrameworkHandle) -> Result<Arc<dyn Plugin>> {
    Ok(Arc::new(VolumeZone))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{make_node, make_pod};
    use placement_core::well_known::{LABEL_REGION, LABEL_ZONE};

    fn node(zone: Option<&str>) -> NodeInfo {
        let mut n = make_node("n1").label(LABEL_REGION, "r1");
        if let Some(zone) = zone {
            n = n.label(LABEL_ZONE, zone);
        }
        NodeInfo::with_node(Arc::new(n.obj()), [])
    }

    #[test]
    fn volume_zone_must_match_node() {
        let state = CycleState::new();
        let pod = make_pod("p").volume("data", &[(LABEL_ZONE, "z1")]).obj();
        assert!(VolumeZone.filter(&state, &pod, &node(Some("z1"))).is_success());
        let status = VolumeZone.filter(&state, &pod, &node(Some("z2")));
        assert_eq!(status.reasons(), [ERR_REASON_CONFLICT]);
        assert!(!VolumeZone.filter(&state, &pod, &node(None)).is_success());
    }

    #[test]
    fn multi_zone_volumes_accept_any_listed_zone() {
        let pod = make_pod("p").volume("data", &[(LABEL_ZONE, "z1__z2")]).obj();
        assert!(VolumeZone.filter(&CycleState::new(), &pod, &node(Some("z2"))).is_success());
    }

    #[test]
    fn nodes_without_topology_labels_pass() {
        let pod = make_pod("p").volume("data", &[(LABEL_ZONE, "z1")]).obj();
        let bare = NodeInfo::with_node(Arc::new(make_node("bare").obj()), []);
        assert!(VolumeZone.filter(&CycleState::new(), &pod, &bare).is_success());
    }
}
