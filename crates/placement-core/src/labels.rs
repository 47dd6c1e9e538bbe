//! Labels, label selectors and node selectors.
//!
//! Semantics follow the usual cluster conventions:
//!
//! - an empty [`LabelSelector`] matches every label set;
//! - a missing selector (`None`) matches nothing, see [`selector_matches`];
//! - [`NodeSelector`] terms are ORed, requirements inside a term are ANDed, and
//!   an empty term matches nothing.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A set of key/value labels.
pub type Labels = BTreeMap<String, String>;

/// Operator of a selector requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SelectorOperator {
    /// The label value is one of `values`.
    In,
    /// The label is absent or its value is not one of `values`.
    NotIn,
    /// The label is present.
    Exists,
    /// The label is absent.
    DoesNotExist,
    /// The label value, as an integer, is greater than the single value.
    Gt,
    /// The label value, as an integer, is less than the single value.
    Lt,
}

/// A single `key <op> values` requirement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Requirement {
    /// Label key.
    pub key: String,
    /// Operator.
    pub operator: SelectorOperator,
    /// Operand values.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl Requirement {
    /// Build a requirement.
    #[must_use]
    pub fn new(key: impl Into<String>, operator: SelectorOperator, values: &[&str]) -> Self {
        Self {
            key: key.into(),
            operator,
            values: values.iter().map(ToString::to_string).collect(),
        }
    }

    /// Check the requirement against a label set.
    #[must_use]
    pub fn matches(&self, labels: &Labels) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            SelectorOperator::In => value.is_some_and(|v| self.values.contains(v)),
            SelectorOperator::NotIn => value.map_or(true, |v| !self.values.contains(v)),
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
            SelectorOperator::Gt | SelectorOperator::Lt => {
                let (Some(actual), [bound]) = (value, self.values.as_slice()) else {
                    return false;
                };
                let (Ok(actual), Ok(bound)) = (actual.parse::<i64>(), bound.parse::<i64>()) else {
                    return false;
                };
                if self.operator == SelectorOperator::Gt {
                    actual > bound
                } else {
                    actual < bound
                }
            }
        }
    }

    /// Validate the operator/value combination.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidSelector`] when the values do not fit the
    /// operator.
    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(CoreError::InvalidSelector("empty requirement key".into()));
        }
        let ok = match self.operator {
            SelectorOperator::In | SelectorOperator::NotIn => !self.values.is_empty(),
            SelectorOperator::Exists | SelectorOperator::DoesNotExist => self.values.is_empty(),
            SelectorOperator::Gt | SelectorOperator::Lt => {
                self.values.len() == 1 && self.values[0].parse::<i64>().is_ok()
            }
        };
        if ok {
            Ok(())
        } else {
            Err(CoreError::InvalidSelector(format!(
                "operator {:?} on key {:?} does not accept values {:?}",
                self.operator, self.key, self.values
            )))
        }
    }
}

/// A label query over a set of objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LabelSelector {
    /// Exact key/value matches.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: Labels,
    /// Set-based requirements.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<Requirement>,
}

impl LabelSelector {
    /// A selector that requires every given label to be present with its value.
    #[must_use]
    pub fn from_labels(labels: &Labels) -> Self {
        Self {
            match_labels: labels.clone(),
            match_expressions: Vec::new(),
        }
    }

    /// Convenience constructor from literal pairs.
    #[must_use]
    pub fn with_labels(pairs: &[(&str, &str)]) -> Self {
        Self {
            match_labels: pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            match_expressions: Vec::new(),
        }
    }

    /// Check whether the selector has no requirements at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    /// Check the selector against a label set.
    #[must_use]
    pub fn matches(&self, labels: &Labels) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
            && self.match_expressions.iter().all(|r| r.matches(labels))
    }

    /// Validate every requirement. `Gt`/`Lt` are node-selector only.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidSelector`] on the first bad requirement.
    pub fn validate(&self) -> Result<()> {
        for r in &self.match_expressions {
            if matches!(r.operator, SelectorOperator::Gt | SelectorOperator::Lt) {
                return Err(CoreError::InvalidSelector(format!(
                    "operator {:?} is not valid in a label selector",
                    r.operator
                )));
            }
            r.validate()?;
        }
        Ok(())
    }
}

/// Evaluate an optional selector: `None` matches nothing.
#[must_use]
pub fn selector_matches(selector: Option<&LabelSelector>, labels: &Labels) -> bool {
    selector.is_some_and(|s| s.matches(labels))
}

/// One ANDed term of a node selector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeSelectorTerm {
    /// Requirements on node labels.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<Requirement>,
    /// Requirements on node fields. Only `metadata.name` is supported.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub match_fields: Vec<Requirement>,
}

/// Field key accepted in [`NodeSelectorTerm::match_fields`].
pub const NODE_FIELD_NAME: &str = "metadata.name";

impl NodeSelectorTerm {
    /// Check the term against a node's name and labels.
    #[must_use]
    pub fn matches(&self, node_name: &str, labels: &Labels) -> bool {
        if self.match_expressions.is_empty() && self.match_fields.is_empty() {
            return false;
        }
        let fields: Labels = std::iter::once((NODE_FIELD_NAME.to_string(), node_name.to_string())).collect();
        self.match_expressions.iter().all(|r| r.matches(labels))
            && self.match_fields.iter().all(|r| r.matches(&fields))
    }
}

/// The union of one or more node selector terms.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeSelector {
    /// The ORed terms.
    pub node_selector_terms: Vec<NodeSelectorTerm>,
}

impl NodeSelector {
    /// Check whether any term matches.
    #[must_use]
    pub fn matches(&self, node_name: &str, labels: &Labels) -> bool {
        self.node_selector_terms
            .iter()
            .any(|t| t.matches(node_name, labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn empty_selector_matches_everything() {
        let sel = LabelSelector::default();
        assert!(sel.matches(&labels(&[])));
        assert!(sel.matches(&labels(&[("a", "b")])));
        assert!(selector_matches(Some(&sel), &labels(&[])));
        assert!(!selector_matches(None, &labels(&[("a", "b")])));
    }

    #[test]
    fn match_labels_and_expressions_are_anded() {
        let sel = LabelSelector {
            match_labels: labels(&[("role", "db")]),
            match_expressions: vec![Requirement::new("tier", SelectorOperator::NotIn, &["cache"])],
        };
        assert!(sel.matches(&labels(&[("role", "db")])));
        assert!(sel.matches(&labels(&[("role", "db"), ("tier", "primary")])));
        assert!(!sel.matches(&labels(&[("role", "db"), ("tier", "cache")])));
        assert!(!sel.matches(&labels(&[("role", "web")])));
    }

    #[test]
    fn numeric_operators() {
        let gt = Requirement::new("cores", SelectorOperator::Gt, &["4"]);
        let lt = Requirement::new("cores", SelectorOperator::Lt, &["4"]);
        assert!(gt.matches(&labels(&[("cores", "8")])));
        assert!(!gt.matches(&labels(&[("cores", "4")])));
        assert!(lt.matches(&labels(&[("cores", "2")])));
        assert!(!lt.matches(&labels(&[("cores", "two")])));
        assert!(!lt.matches(&labels(&[])));
    }

    #[test]
    fn validation_rejects_bad_operands() {
        assert!(Requirement::new("k", SelectorOperator::In, &[]).validate().is_err());
        assert!(Requirement::new("k", SelectorOperator::Exists, &["x"]).validate().is_err());
        assert!(Requirement::new("k", SelectorOperator::Gt, &["x"]).validate().is_err());
        let sel = LabelSelector {
            match_labels: Labels::new(),
            match_expressions: vec![Requirement::new("k", SelectorOperator::Gt, &["1"])],
        };
        assert!(sel.validate().is_err());
    }

    #[test]
    fn node_selector_terms_are_ored() {
        let selector = NodeSelector {
            node_selector_terms: vec![
                NodeSelectorTerm {
                    match_expressions: vec![Requirement::new("zone", SelectorOperator::In, &["a"])],
                    match_fields: vec![],
                },
                NodeSelectorTerm {
                    match_expressions: vec![],
                    match_fields: vec![Requirement::new(NODE_FIELD_NAME, SelectorOperator::In, &["n9"])],
                },
            ],
        };
        assert!(selector.matches("n1", &labels(&[("zone", "a")])));
        assert!(selector.matches("n9", &labels(&[("zone", "b")])));
        assert!(!selector.matches("n2", &labels(&[("zone", "b")])));
        assert!(!NodeSelectorTerm::default().matches("n1", &labels(&[])));
    }

    #[test]
    fn selector_wire_format() {
        let sel: LabelSelector = serde_json::from_str(
            r#"{"matchLabels":{"app":"web"},"matchExpressions":[{"key":"env","operator":"In","values":["prod"]}]}"#,
        )
        .unwrap();
        assert!(sel.matches(&labels(&[("app", "web"), ("env", "prod")])));
    }
}
