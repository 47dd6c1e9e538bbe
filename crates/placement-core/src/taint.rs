//! Node taints and pod tolerations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Effect of a taint on pods that do not tolerate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaintEffect {
    /// New pods are not scheduled onto the node.
    NoSchedule,
    /// The scheduler tries to avoid the node.
    PreferNoSchedule,
    /// New pods are not scheduled and running pods are evicted.
    NoExecute,
}

impl fmt::Display for TaintEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoSchedule => "NoSchedule",
            Self::PreferNoSchedule => "PreferNoSchedule",
            Self::NoExecute => "NoExecute",
        };
        f.write_str(s)
    }
}

/// A taint attached to a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Taint {
    /// Taint key.
    pub key: String,
    /// Taint value.
    #[serde(default)]
    pub value: String,
    /// Taint effect.
    pub effect: TaintEffect,
}

impl Taint {
    /// Build a taint.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>, effect: TaintEffect) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            effect,
        }
    }
}

/// Toleration operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TolerationOperator {
    /// Matches any value for the key.
    Exists,
    /// Matches when the values are equal.
    #[default]
    Equal,
}

/// A pod toleration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Toleration {
    /// Taint key. Empty with `Exists` tolerates every key.
    pub key: String,
    /// Operator.
    pub operator: TolerationOperator,
    /// Value for `Equal`.
    pub value: String,
    /// Effect to match. `None` matches every effect.
    pub effect: Option<TaintEffect>,
    /// How long a `NoExecute` taint is tolerated. Unused by the scheduler.
    pub toleration_seconds: Option<i64>,
}

impl Toleration {
    /// Check whether this toleration tolerates the taint.
    #[must_use]
    pub fn tolerates(&self, taint: &Taint) -> bool {
        if self.effect.is_some_and(|e| e != taint.effect) {
            return false;
        }
        if !self.key.is_empty() && self.key != taint.key {
            return false;
        }
        match self.operator {
            TolerationOperator::Exists => true,
            TolerationOperator::Equal => self.value == taint.value,
        }
    }
}

/// Check whether any of the tolerations tolerates the taint.
#[must_use]
pub fn tolerations_tolerate_taint(tolerations: &[Toleration], taint: &Taint) -> bool {
    tolerations.iter().any(|t| t.tolerates(taint))
}

/// Return the first taint accepted by `filter` that none of the tolerations
/// tolerate.
#[must_use]
pub fn find_untolerated_taint<'a>(
    taints: &'a [Taint],
    tolerations: &[Toleration],
    filter: impl Fn(&Taint) -> bool,
) -> Option<&'a Taint> {
    taints
        .iter()
        .filter(|t| filter(t))
        .find(|t| !tolerations_tolerate_taint(tolerations, t))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exists_with_empty_key_tolerates_everything() {
        let tol = Toleration {
            operator: TolerationOperator::Exists,
            ..Toleration::default()
        };
        assert!(tol.tolerates(&Taint::new("a", "b", TaintEffect::NoExecute)));
    }

    #[test]
    fn equal_requires_value_and_effect() {
        let tol = Toleration {
            key: "dedicated".into(),
            value: "gpu".into(),
            effect: Some(TaintEffect::NoSchedule),
            ..Toleration::default()
        };
        assert!(tol.tolerates(&Taint::new("dedicated", "gpu", TaintEffect::NoSchedule)));
        assert!(!tol.tolerates(&Taint::new("dedicated", "cpu", TaintEffect::NoSchedule)));
        assert!(!tol.tolerates(&Taint::new("dedicated", "gpu", TaintEffect::NoExecute)));
    }

    #[test]
    fn finds_first_untolerated() {
        let taints = vec![
            Taint::new("soft", "", TaintEffect::PreferNoSchedule),
            Taint::new("hard", "", TaintEffect::NoSchedule),
        ];
        let hard_only = |t: &Taint| t.effect != TaintEffect::PreferNoSchedule;
        assert_eq!(
            find_untolerated_taint(&taints, &[], hard_only).map(|t| t.key.as_str()),
            Some("hard")
        );
        let tol = Toleration {
            key: "hard".into(),
            operator: TolerationOperator::Exists,
            ..Toleration::default()
        };
        assert!(find_untolerated_taint(&taints, &[tol], hard_only).is_none());
    }
}
