//! Score by a configurable utilization curve.
//!
//! The shape maps utilization (0..=100) to a score (0..=10) and is linearly
//! interpolated between points. `[{0, 10}, {100, 0}]` behaves like least
//! allocated; `[{0, 0}, {100, 10}]` like most allocated.

use super::names::REQUESTED_TO_CAPACITY_RATIO as NAME;
use super::{default_resources, resource_usage, validate_resources, ResourceSpec};
use crate::error::{Result, SchedulerError};
use crate::framework::{decode_args, CycleState, FrameworkHandle, Plugin, ScorePlugin, Status, MAX_NODE_SCORE};
use crate::node_info::NodeInfo;
use crate::plugins::helper::node_of;
use placement_core::Pod;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Highest utilization in a shape point.
pub const MAX_UTILIZATION: i64 = 100;
/// Highest score in a shape point.
pub const MAX_CUSTOM_PRIORITY_SCORE: i64 = 10;

/// One point of the utilization curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtilizationShapePoint {
    /// Utilization in percent.
    pub utilization: i64,
    /// Score in `[0, 10]`.
    pub score: i64,
}

/// Args of [`RequestedToCapacityRatio`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestedToCapacityRatioArgs {
    /// The curve, with strictly increasing utilization.
    pub shape: Vec<UtilizationShapePoint>,
    /// Scored resources.
    pub resources: Vec<ResourceSpec>,
}

impl Default for RequestedToCapacityRatioArgs {
    fn default() -> Self {
        Self {
            shape: vec![
                UtilizationShapePoint {
                    utilization: 0,
                    score: MAX_CUSTOM_PRIORITY_SCORE,
                },
                UtilizationShapePoint {
                    utilization: MAX_UTILIZATION,
                    score: 0,
                },
            ],
            resources: default_resources(),
        }
    }
}

impl RequestedToCapacityRatioArgs {
    /// Validate the shape and the resource weights.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.shape.is_empty() {
            return Err(SchedulerError::Config("shape: at least one point must be specified".into()));
        }
        for (i, p) in self.shape.iter().enumerate() {
            if !(0..=MAX_UTILIZATION).contains(&p.utilization) {
                return Err(SchedulerError::Config(format!(
                    "shape[{i}].utilization: {} not in [0, {MAX_UTILIZATION}]",
                    p.utilization
                )));
            }
            if !(0..=MAX_CUSTOM_PRIORITY_SCORE).contains(&p.score) {
                return Err(SchedulerError::Config(format!(
                    "shape[{i}].score: {} not in [0, {MAX_CUSTOM_PRIORITY_SCORE}]",
                    p.score
                )));
            }
            if i > 0 && self.shape[i - 1].utilization >= p.utilization {
                return Err(SchedulerError::Config(format!(
                    "shape[{i}].utilization: values must be sorted in increasing order"
                )));
            }
        }
        validate_resources(&self.resources)
    }
}

/// Piecewise-linear curve over `[0, 100]`, scores already scaled to
/// `[0, MAX_NODE_SCORE]`.
#[derive(Debug, Clone)]
struct Shape(Vec<UtilizationShapePoint>);

impl Shape {
    fn at(&self, p: i64) -> i64 {
        let points = &self.0;
        for (i, point) in points.iter().enumerate() {
            if p <= point.utilization {
                if i == 0 {
                    return point.score;
                }
                let prev = points[i - 1];
                return prev.score
                    + (point.score - prev.score) * (p - prev.utilization)
                        / (point.utilization - prev.utilization);
            }
        }
        points.last().map_or(0, |p| p.score)
    }
}

/// Scores by the configured utilization curve.
#[derive(Debug)]
pub struct RequestedToCapacityRatio {
    shape: Shape,
    resources: Vec<ResourceSpec>,
}

impl RequestedToCapacityRatio {
    fn resource_score(&self, requested: i64, capacity: i64) -> i64 {
        if capacity == 0 || requested > capacity {
            return self.shape.at(MAX_UTILIZATION);
        }
        self.shape
            .at(MAX_UTILIZATION - (capacity - requested) * MAX_UTILIZATION / capacity)
    }
}

impl Plugin for RequestedToCapacityRatio {
    fn name(&self) -> &str {
        NAME
    }

    fn as_score(&self) -> Option<&dyn ScorePlugin> {
        Some(self)
    }
}

impl ScorePlugin for RequestedToCapacityRatio {
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn score(&self, _state: &CycleState, pod: &Pod, node_info: &NodeInfo) -> std::result::Result<i64, Status> {
        node_of(node_info)?;
        let mut total = 0i64;
        let mut weights = 0i64;
        for u in resource_usage(pod, node_info, &self.resources) {
            let s = self.resource_score(u.requested, u.allocatable);
            if s > 0 {
                total += s * u.weight;
                weights += u.weight;
            }
        }
        if weights == 0 {
            return Ok(0);
        }
        Ok((total as f64 / weights as f64).round() as i64)
    }
}

/// Factory.
///
/// # Errors
///
/// Returns [`SchedulerError::Config`] when the args do not decode or validate.
pub fn new(args: Option<&serde_json::Value>, _handle: &FrameworkHandle) -> Result<Arc<dyn Plugin>> {
    let args: RequestedToCapacityRatioArgs = decode_args(NAME, args)?;
    args.validate()?;
    let scale = MAX_NODE_SCORE / MAX_CUSTOM_PRIORITY_SCORE;
    let shape = args
        .shape
        .iter()
        .map(|p| UtilizationShapePoint {
            utilization: p.utilization,
            score: p.score * scale,
        })
        .collect();
    Ok(Arc::new(RequestedToCapacityRatio {
        shape: Shape(shape),
        resources: args.resources,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Snapshot;
    use crate::testing::{make_node, make_pod, test_handle};
    use serde_json::json;

    fn node(name: &str, cpu: &str, memory: &str, used: Option<(&str, &str)>) -> NodeInfo {
        let pods = used.map(|(c, m)| {
            Arc::new(make_pod(&format!("{name}-used")).node(name).req(&[("cpu", c), ("memory", m)]).obj())
        });
        NodeInfo::with_node(
            Arc::new(make_node(name).capacity(&[("cpu", cpu), ("memory", memory)]).obj()),
            pods,
        )
    }

    #[test]
    fn interpolates_between_points() {
        let shape = Shape(vec![
            UtilizationShapePoint { utilization: 10, score: 20 },
            UtilizationShapePoint { utilization: 50, score: 100 },
        ]);
        assert_eq!(shape.at(0), 20);
        assert_eq!(shape.at(30), 60);
        assert_eq!(shape.at(90), 100);
    }

    #[test]
    fn default_shape_prefers_idle_nodes() {
        let handle = test_handle(Snapshot::new());
        let plugin = new(None, &handle).unwrap();
        let scorer = plugin.as_score().unwrap();
        let pod = make_pod("p").req(&[("cpu", "1"), ("memory", "1Gi")]).obj();
        let state = CycleState::new();

        let idle = node("idle", "4", "4Gi", None);
        let busy = node("busy", "4", "4Gi", Some(("2", "2Gi")));
        assert_eq!(scorer.score(&state, &pod, &idle).unwrap(), 75);
        assert_eq!(scorer.score(&state, &pod, &busy).unwrap(), 25);
    }

    #[test]
    fn bin_packing_shape() {
        let handle = test_handle(Snapshot::new());
        let args = json!({
            "shape": [{"utilization": 0, "score": 0}, {"utilization": 100, "score": 10}],
            "resources": [{"name": "cpu", "weight": 1}],
        });
        let plugin = new(Some(&args), &handle).unwrap();
        let pod = make_pod("p").req(&[("cpu", "1")]).obj();
        let busy = node("busy", "4", "4Gi", Some(("2", "1Gi")));
        assert_eq!(plugin.as_score().unwrap().score(&CycleState::new(), &pod, &busy).unwrap(), 75);
    }

    #[test]
    fn invalid_shapes_are_rejected() {
        let mut args = RequestedToCapacityRatioArgs::default();
        args.shape.clear();
        assert!(args.validate().is_err());

        let mut args = RequestedToCapacityRatioArgs::default();
        args.shape[1].utilization = 0;
        assert!(args.validate().is_err());

        let mut args = RequestedToCapacityRatioArgs::default();
        args.shape[0].score = 11;
        assert!(args.validate().is_err());

        let mut args = RequestedToCapacityRatioArgs::default();
        args.shape[1].utilization = 101;
        assert!(args.validate().is_err());
    }
}
