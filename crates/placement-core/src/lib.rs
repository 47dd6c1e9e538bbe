//! Object model for the placement scheduler.
//!
//! This crate provides the data types shared by every part of the scheduler:
//!
//! - **Identifiers**: the [`Uid`] every pod is keyed by
//! - **Quantities**: Kubernetes-style resource amounts with milli precision
//! - **Labels and selectors**: label, set-based and node selectors
//! - **Pods and nodes**: specs, affinity terms, spread constraints, taints and
//!   tolerations
//!
//! Everything here is plain data plus predicates; there is no runtime.
//!
//! # Example
//!
//! ```
//! use placement_core::{LabelSelector, Pod, Quantity, RESOURCE_CPU};
//!
//! let mut pod = Pod::new("default", "web-0", "uid-1");
//! pod.metadata.labels.insert("app".into(), "web".into());
//!
//! let selector = LabelSelector::with_labels(&[("app", "web")]);
//! assert!(selector.matches(pod.labels()));
//!
//! let cpu: Quantity = "250m".parse().unwrap();
//! assert_eq!(cpu.milli_value(), 250);
//! # let _ = RESOURCE_CPU;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod ids;
pub mod labels;
pub mod meta;
pub mod node;
pub mod pod;
pub mod quantity;
pub mod taint;
pub mod well_known;

pub use error::{CoreError, Result};
pub use ids::{IdError, Uid};
pub use labels::{
    selector_matches, LabelSelector, Labels, NodeSelector, NodeSelectorTerm, Requirement,
    SelectorOperator, NODE_FIELD_NAME,
};
pub use meta::ObjectMeta;
pub use node::{ContainerImage, Node, NodeCondition, NodeSpec, NodeStatus, NODE_READY};
pub use pod::{
    Affinity, Container, NodeAffinity, Pod, PodAffinityRules, PodAffinityTerm, PodCondition,
    PodPhase, PodSpec, PodStatus, PreferredSchedulingTerm, ResourceList, ResourceRequirements,
    TopologySpreadConstraint, UnsatisfiableConstraintAction, Volume, WeightedPodAffinityTerm,
    POD_SCHEDULED, REASON_SCHEDULER_ERROR, REASON_UNSCHEDULABLE, RESOURCE_CPU,
    RESOURCE_EPHEMERAL_STORAGE, RESOURCE_MEMORY, RESOURCE_PODS,
};
pub use quantity::Quantity;
pub use taint::{
    find_untolerated_taint, tolerations_tolerate_taint, Taint, TaintEffect, Toleration,
    TolerationOperator,
};
pub use well_known::zone_key;
