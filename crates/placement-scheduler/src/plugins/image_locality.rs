//! Prefer nodes that already hold the pod's images.

use crate::error::Result;
use crate::framework::{CycleState, FrameworkHandle, Plugin, ScorePlugin, Status, MAX_NODE_SCORE};
use crate::node_info::{ImageStateSummary, NodeInfo};
use placement_core::Pod;
use std::sync::Arc;

/// Registered name.
pub const NAME: &str = "ImageLocality";

const MB: i64 = 1024 * 1024;
const MIN_THRESHOLD: i64 = 23 * MB;
const MAX_CONTAINER_THRESHOLD: i64 = 1000 * MB;

/// Scores the summed size of images already present, scaled by how widely
/// each image is spread across the cluster.
#[derive(Debug)]
pub struct ImageLocality {
    handle: FrameworkHandle,
}

impl Plugin for ImageLocality {
    fn name(&self) -> &str {
        NAME
    }

    fn as_score(&self) -> Option<&dyn ScorePlugin> {
        Some(self)
    }
}

impl ScorePlugin for ImageLocality {
    fn score(&self, _state: &CycleState, pod: &Pod, node_info: &NodeInfo) -> std::result::Result<i64, Status> {
        let total_nodes = self.handle.snapshot().num_nodes();
        let sum = sum_image_scores(node_info, pod, total_nodes);
        Ok(calculate_priority(sum, pod.spec.containers.len()))
    }
}

fn calculate_priority(sum_scores: i64, num_containers: usize) -> i64 {
    let max_threshold =
        MAX_CONTAINER_THRESHOLD.saturating_mul(i64::try_from(num_containers).unwrap_or(i64::MAX));
    if max_threshold <= MIN_THRESHOLD {
        return 0;
    }
    let clamped = sum_scores.clamp(MIN_THRESHOLD, max_threshold);
    MAX_NODE_SCORE * (clamped - MIN_THRESHOLD) / (max_threshold - MIN_THRESHOLD)
}

fn sum_image_scores(node_info: &NodeInfo, pod: &Pod, total_nodes: usize) -> i64 {
    pod.spec
        .containers
        .iter()
        .filter_map(|c| node_info.image_states().get(&normalized_image_name(&c.image)))
        .map(|state| scaled_image_score(*state, total_nodes))
        .sum()
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn scaled_image_score(state: ImageStateSummary, total_nodes: usize) -> i64 {
    if total_nodes == 0 {
        return 0;
    }
    let spread = state.num_nodes as f64 / total_nodes as f64;
    (state.size as f64 * spread) as i64
}

/// Append `:latest` when the image carries no tag.
#[must_use]
pub fn normalized_image_name(name: &str) -> String {
    let colon = name.rfind(':');
    let slash = name.rfind('/');
    if colon <= slash {
        format!("{name}:latest")
    } else {
        name.to_string()
    }
}

/// Factory.
///
/// # Errors
///
/// Never fails.
pub fn new(_args: Option<&serde_json::Value>, handle: &FrameworkHandle) -> Result<Arc<dyn Plugin>> {
    Ok(Arc::new(ImageLocality {
        handle: handle.clone(),
    }))
}
