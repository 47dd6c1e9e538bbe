//! Well-known label and taint keys.

use crate::labels::Labels;

/// Node hostname label.
pub const LABEL_HOSTNAME: &str = "kubernetes.io/hostname";
/// Zone label.
pub const LABEL_ZONE: &str = "topology.kubernetes.io/zone";
/// Region label.
pub const LABEL_REGION: &str = "topology.kubernetes.io/region";
/// Legacy zone label.
pub const LABEL_ZONE_FAILURE_DOMAIN: &str = "failure-domain.beta.kubernetes.io/zone";
/// Legacy region label.
pub const LABEL_ZONE_REGION: &str = "failure-domain.beta.kubernetes.io/region";

/// Taint key placed on nodes whose `spec.unschedulable` is set.
pub const TAINT_NODE_UNSCHEDULABLE: &str = "node.kubernetes.io/unschedulable";

/// Every label key that names a zone or region.
pub const TOPOLOGY_LABELS: [&str; 4] = [
    LABEL_ZONE_FAILURE_DOMAIN,
    LABEL_ZONE_REGION,
    LABEL_ZONE,
    LABEL_REGION,
];

/// Build the zone key of a node from its labels.
///
/// Returns `region:\x00:zone`, or an empty string when the node carries
/// neither a region nor a zone label. Legacy labels take precedence.
#[must_use]
pub fn zone_key(labels: &Labels) -> String {
    let lookup = |legacy: &str, stable: &str| {
        labels
            .get(legacy)
            .or_else(|| labels.get(stable))
            .cloned()
            .unwrap_or_default()
    };
    let zone = lookup(LABEL_ZONE_FAILURE_DOMAIN, LABEL_ZONE);
    let region = lookup(LABEL_ZONE_REGION, LABEL_REGION);
    if zone.is_empty() && region.is_empty() {
        return String::new();
    }
    format!("{region}:\x00:{zone}")
}
