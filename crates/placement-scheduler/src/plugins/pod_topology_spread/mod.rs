//! Even spreading of pod groups across topology domains.
//!
//! Hard (`DoNotSchedule`) constraints are enforced in filtering: placing the
//! pod in a domain must not make that domain exceed the emptiest eligible
//! domain by more than `maxSkew`. Soft (`ScheduleAnyway`) constraints are
//! scored, preferring domains with fewer matching pods. Pods without
//! constraints of their own fall back to the configured default
//! constraints, selecting pods by the incoming pod's labels.

mod filtering;
mod scoring;

pub use filtering::{ERR_REASON_CONSTRAINTS_NOT_MATCH, ERR_REASON_NODE_LABEL_NOT_MATCH};

use crate::error::{Result, SchedulerError};
use crate::framework::{
    decode_args, FilterPlugin, FrameworkHandle, Plugin, PreFilterPlugin, PreScorePlugin, ScorePlugin,
};
use crate::node_info::NodeInfo;
use crate::plugins::helper::{count_pods_match_selector, default_selector};
use placement_core::{
    LabelSelector, Labels, Pod, TopologySpreadConstraint, UnsatisfiableConstraintAction,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Registered name.
pub const NAME: &str = "PodTopologySpread";

/// Args of [`PodTopologySpread`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodTopologySpreadArgs {
    /// Constraints applied to pods that carry none. They must not set a
    /// label selector; the pod's own labels are used instead.
    pub default_constraints: Vec<TopologySpreadConstraint>,
}

impl PodTopologySpreadArgs {
    /// Validate the default constraints.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] describing the first bad constraint.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for (i, c) in self.default_constraints.iter().enumerate() {
            if c.max_skew <= 0 {
                return Err(SchedulerError::Config(format!(
                    "defaultConstraints[{i}].maxSkew: invalid value {}: must be greater than zero",
                    c.max_skew
                )));
            }
            if c.topology_key.is_empty() {
                return Err(SchedulerError::Config(format!(
                    "defaultConstraints[{i}].topologyKey: can not be empty"
                )));
            }
            if c.label_selector.is_some() {
                return Err(SchedulerError::Config(format!(
                    "defaultConstraints[{i}].labelSelector: constraints must not define a selector"
                )));
            }
            if !seen.insert((c.topology_key.as_str(), c.when_unsatisfiable)) {
                return Err(SchedulerError::Config(format!(
                    "defaultConstraints[{i}]: duplicate {{{}, {:?}}}",
                    c.topology_key, c.when_unsatisfiable
                )));
            }
        }
        Ok(())
    }
}

/// A constraint with its selector resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Constraint {
    pub(crate) max_skew: i32,
    pub(crate) topology_key: String,
    /// `None` selects nothing.
    pub(crate) selector: Option<LabelSelector>,
}

impl Constraint {
    fn matches(&self, labels: &Labels) -> bool {
        placement_core::selector_matches(self.selector.as_ref(), labels)
    }

    fn count_matching(&self, node_info: &NodeInfo, namespace: &str) -> i64 {
        self.selector.as_ref().map_or(0, |s| {
            i64::try_from(count_pods_match_selector(node_info, s, namespace)).unwrap_or(i64::MAX)
        })
    }
}

fn filter_constraints(
    constraints: &[TopologySpreadConstraint],
    action: UnsatisfiableConstraintAction,
) -> Result<Vec<Constraint>> {
    constraints
        .iter()
        .filter(|c| c.when_unsatisfiable == action)
        .map(|c| {
            if let Some(s) = &c.label_selector {
                s.validate().map_err(|e| {
                    SchedulerError::Config(format!("topology spread constraint on {:?}: {e}", c.topology_key))
                })?;
            }
            Ok(Constraint {
                max_skew: c.max_skew,
                topology_key: c.topology_key.clone(),
                selector: c.label_selector.clone(),
            })
        })
        .collect()
}

fn node_labels_match_constraints(labels: &Labels, constraints: &[Constraint]) -> bool {
    constraints.iter().all(|c| labels.contains_key(&c.topology_key))
}

/// The spread plugin.
#[derive(Debug)]
pub struct PodTopologySpread {
    args: PodTopologySpreadArgs,
    handle: FrameworkHandle,
}

impl PodTopologySpread {
    /// The pod's own constraints of the given kind, or the defaults when it
    /// has none.
    fn constraints_for(&self, pod: &Pod, action: UnsatisfiableConstraintAction) -> Result<Vec<Constraint>> {
        if !pod.spec.topology_spread_constraints.is_empty() {
            return filter_constraints(&pod.spec.topology_spread_constraints, action);
        }
        let mut constraints = filter_constraints(&self.args.default_constraints, action)?;
        if constraints.is_empty() {
            return Ok(constraints);
        }
        let selector = default_selector(pod);
        if selector.is_empty() {
            return Ok(Vec::new());
        }
        for c in &mut constraints {
            c.selector = Some(selector.clone());
        }
        Ok(constraints)
    }
}

impl Plugin for PodTopologySpread {
    fn name(&self) -> &str {
        NAME
    }

    fn as_pre_filter(&self) -> Option<&dyn PreFilterPlugin> {
        Some(self)
    }

    fn as_filter(&self) -> Option<&dyn FilterPlugin> {
        Some(self)
    }

    fn as_pre_score(&self) -> Option<&dyn PreScorePlugin> {
        Some(self)
    }

    fn as_score(&self) -> Option<&dyn ScorePlugin> {
        Some(self)
    }
}

/// Factory.
///
/// # Errors
///
/// Returns [`SchedulerError::Config`] when the args do not decode or validate.
pub fn new(args: Option<&serde_json::Value>, handle: &FrameworkHandle) -> Result<Arc<dyn Plugin>> {
    let args: PodTopologySpreadArgs = decode_args(NAME, args)?;
    args.validate()?;
    Ok(Arc::new(PodTopologySpread {
        args,
        handle: handle.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Snapshot;
    use crate::testing::{make_pod, test_handle};
    use placement_core::well_known::LABEL_ZONE;
    use serde_json::json;

    fn plugin(args: PodTopologySpreadArgs) -> PodTopologySpread {
        PodTopologySpread {
            args,
            handle: test_handle(Snapshot::new()),
        }
    }

    fn zone_default(when: UnsatisfiableConstraintAction) -> TopologySpreadConstraint {
        TopologySpreadConstraint {
            max_skew: 1,
            topology_key: LABEL_ZONE.into(),
            when_unsatisfiable: when,
            label_selector: None,
        }
    }

    #[test]
    fn own_constraints_win_over_defaults() {
        let p = plugin(PodTopologySpreadArgs {
            default_constraints: vec![zone_default(UnsatisfiableConstraintAction::DoNotSchedule)],
        });
        let pod = make_pod("p")
            .label("app", "web")
            .spread_constraint(
                2,
                "rack",
                UnsatisfiableConstraintAction::ScheduleAnyway,
                LabelSelector::with_labels(&[("app", "web")]),
            )
            .obj();
        assert!(p
            .constraints_for(&pod, UnsatisfiableConstraintAction::DoNotSchedule)
            .unwrap()
            .is_empty());
        let soft = p
            .constraints_for(&pod, UnsatisfiableConstraintAction::ScheduleAnyway)
            .unwrap();
        assert_eq!(soft[0].topology_key, "rack");
    }

    #[test]
    fn defaults_select_by_pod_labels() {
        let p = plugin(PodTopologySpreadArgs {
            default_constraints: vec![zone_default(UnsatisfiableConstraintAction::DoNotSchedule)],
        });
        let labelled = make_pod("p").label("app", "web").obj();
        let hard = p
            .constraints_for(&labelled, UnsatisfiableConstraintAction::DoNotSchedule)
            .unwrap();
        assert_eq!(hard[0].selector, Some(LabelSelector::with_labels(&[("app", "web")])));

        let bare = make_pod("q").obj();
        assert!(p
            .constraints_for(&bare, UnsatisfiableConstraintAction::DoNotSchedule)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn bad_defaults_are_rejected() {
        let handle = test_handle(Snapshot::new());
        let bad = [
            json!({"defaultConstraints": [{"maxSkew": 0, "topologyKey": "zone", "whenUnsatisfiable": "DoNotSchedule"}]}),
            json!({"defaultConstraints": [{"maxSkew": 1, "topologyKey": "", "whenUnsatisfiable": "DoNotSchedule"}]}),
            json!({"defaultConstraints": [{"maxSkew": 1, "topologyKey": "zone", "whenUnsatisfiable": "DoNotSchedule",
                "labelSelector": {"matchLabels": {"app": "web"}}}]}),
        ];
        for args in &bad {
            assert!(matches!(new(Some(args), &handle), Err(SchedulerError::Config(_))), "{args}");
        }
        let ok = json!({"defaultConstraints": [{"maxSkew": 3, "topologyKey": "zone", "whenUnsatisfiable": "ScheduleAnyway"}]});
        assert!(new(Some(&ok), &handle).is_ok());
    }
}
