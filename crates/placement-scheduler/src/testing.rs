//! Builders for pods and nodes used by unit tests.

use crate::cache::{Snapshot, SnapshotHandle};
use crate::client::mock::FakeClientSet;
use crate::client::ClientSet;
use crate::framework::{FrameworkHandle, Parallelizer};
use crate::queue::PodNominator;
use placement_core::{
    Affinity, Container, ContainerImage, LabelSelector, Node, NodeAffinity, NodeSelector,
    NodeSelectorTerm, Pod, PodAffinityRules, PodAffinityTerm, PreferredSchedulingTerm, Quantity,
    Requirement, SelectorOperator, Taint, Toleration, TopologySpreadConstraint,
    UnsatisfiableConstraintAction, Volume, WeightedPodAffinityTerm,
};
use placement_core::well_known::{LABEL_HOSTNAME, LABEL_ZONE};
use std::sync::Arc;

fn quantity(s: &str) -> Quantity {
    s.parse().unwrap_or_else(|e| panic!("bad quantity {s:?}: {e}"))
}

/// Start building a pod in the `default` namespace whose uid equals its name.
#[must_use]
pub fn make_pod(name: &str) -> PodWrapper {
    PodWrapper(Pod::new("default", name, name))
}

/// Start building a node with a hostname label and room for 110 pods.
#[must_use]
pub fn make_node(name: &str) -> NodeWrapper {
    let mut node = Node::new(name);
    node.metadata
        .labels
        .insert(LABEL_HOSTNAME.to_string(), name.to_string());
    node.status.allocatable.insert("pods".into(), Quantity::from_value(110));
    NodeWrapper(node)
}

/// Fluent pod builder.
#[derive(Debug, Clone)]
pub struct PodWrapper(pub Pod);

impl PodWrapper {
    /// Finish.
    #[must_use]
    pub fn obj(self) -> Pod {
        self.0
    }

    /// Set the namespace.
    #[must_use]
    pub fn namespace(mut self, ns: &str) -> Self {
        self.0.metadata.namespace = ns.into();
        self
    }

    /// Set the uid.
    #[must_use]
    pub fn uid(mut self, uid: &str) -> Self {
        self.0.metadata.uid = uid.into();
        self
    }

    /// Add a label.
    #[must_use]
    pub fn label(mut self, k: &str, v: &str) -> Self {
        self.0.metadata.labels.insert(k.into(), v.into());
        self
    }

    /// Add a container with the given requests.
    #[must_use]
    pub fn req(mut self, requests: &[(&str, &str)]) -> Self {
        let mut c = Container {
            name: format!("c{}", self.0.spec.containers.len()),
            ..Container::default()
        };
        for (name, q) in requests {
            c.resources.requests.insert((*name).into(), quantity(q));
        }
        self.0.spec.containers.push(c);
        self
    }

    /// Add an init container with the given requests.
    #[must_use]
    pub fn init_req(mut self, requests: &[(&str, &str)]) -> Self {
        let mut c = Container::default();
        for (name, q) in requests {
            c.resources.requests.insert((*name).into(), quantity(q));
        }
        self.0.spec.init_containers.push(c);
        self
    }

    /// Add a container running `image`.
    #[must_use]
    pub fn container_image(mut self, image: &str) -> Self {
        self.0.spec.containers.push(Container {
            name: format!("c{}", self.0.spec.containers.len()),
            image: image.into(),
            ..Container::default()
        });
        self
    }

    /// Set the priority.
    #[must_use]
    pub fn priority(mut self, p: i32) -> Self {
        self.0.spec.priority = Some(p);
        self
    }

    /// Bind to a node.
    #[must_use]
    pub fn node(mut self, name: &str) -> Self {
        self.0.spec.node_name = name.into();
        self
    }

    /// Set the scheduler name.
    #[must_use]
    pub fn scheduler_name(mut self, name: &str) -> Self {
        self.0.spec.scheduler_name = name.into();
        self
    }

    /// Add a node selector entry.
    #[must_use]
    pub fn node_selector(mut self, k: &str, v: &str) -> Self {
        self.0.spec.node_selector.insert(k.into(), v.into());
        self
    }

    /// Add a toleration.
    #[must_use]
    pub fn toleration(mut self, t: Toleration) -> Self {
        self.0.spec.tolerations.push(t);
        self
    }

    /// Add a volume with topology labels.
    #[must_use]
    pub fn volume(mut self, name: &str, topology: &[(&str, &str)]) -> Self {
        self.0.spec.volumes.push(Volume {
            name: name.into(),
            topology: topology
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        });
        self
    }

    /// Mark the pod as terminating.
    #[must_use]
    pub fn terminating(mut self) -> Self {
        self.0.metadata.deletion_timestamp = Some(chrono::Utc::now());
        self
    }

    /// Add a topology spread constraint selecting pods with `key` present.
    #[must_use]
    pub fn spread_constraint(
        mut self,
        max_skew: i32,
        topology_key: &str,
        when: UnsatisfiableConstraintAction,
        selector: LabelSelector,
    ) -> Self {
        self.0
            .spec
            .topology_spread_constraints
            .push(TopologySpreadConstraint {
                max_skew,
                topology_key: topology_key.into(),
                when_unsatisfiable: when,
                label_selector: Some(selector),
            });
        self
    }

    fn affinity_mut(&mut self) -> &mut Affinity {
        self.0.spec.affinity.get_or_insert_with(Affinity::default)
    }

    fn term(key: &str, values: &[&str], topology_key: &str) -> PodAffinityTerm {
        PodAffinityTerm {
            label_selector: Some(LabelSelector {
                match_labels: placement_core::Labels::new(),
                match_expressions: vec![Requirement::new(key, SelectorOperator::In, values)],
            }),
            namespaces: Vec::new(),
            topology_key: topology_key.into(),
        }
    }

    /// Add a required pod affinity term `key in values`.
    #[must_use]
    pub fn pod_affinity_in(mut self, key: &str, values: &[&str], topology_key: &str) -> Self {
        let term = Self::term(key, values, topology_key);
        self.affinity_mut()
            .pod_affinity
            .get_or_insert_with(PodAffinityRules::default)
            .required
            .push(term);
        self
    }

    /// Add a required pod anti-affinity term `key in values`.
    #[must_use]
    pub fn pod_anti_affinity_in(mut self, key: &str, values: &[&str], topology_key: &str) -> Self {
        let term = Self::term(key, values, topology_key);
        self.affinity_mut()
            .pod_anti_affinity
            .get_or_insert_with(PodAffinityRules::default)
            .required
            .push(term);
        self
    }

    /// Add a preferred pod affinity term.
    #[must_use]
    pub fn preferred_pod_affinity(
        mut self,
        weight: i32,
        key: &str,
        values: &[&str],
        topology_key: &str,
    ) -> Self {
        let term = Self::term(key, values, topology_key);
        self.affinity_mut()
            .pod_affinity
            .get_or_insert_with(PodAffinityRules::default)
            .preferred
            .push(WeightedPodAffinityTerm {
                weight,
                pod_affinity_term: term,
            });
        self
    }

    /// Add a preferred pod anti-affinity term.
    #[must_use]
    pub fn preferred_pod_anti_affinity(
        mut self,
        weight: i32,
        key: &str,
        values: &[&str],
        topology_key: &str,
    ) -> Self {
        let term = Self::term(key, values, topology_key);
        self.affinity_mut()
            .pod_anti_affinity
            .get_or_insert_with(PodAffinityRules::default)
            .preferred
            .push(WeightedPodAffinityTerm {
                weight,
                pod_affinity_term: term,
            });
        self
    }

    /// Add a required node affinity term `key in values`.
    #[must_use]
    pub fn node_affinity_in(mut self, key: &str, values: &[&str]) -> Self {
        let term = NodeSelectorTerm {
            match_expressions: vec![Requirement::new(key, SelectorOperator::In, values)],
            match_fields: Vec::new(),
        };
        self.affinity_mut()
            .node_affinity
            .get_or_insert_with(NodeAffinity::default)
            .required
            .get_or_insert_with(NodeSelector::default)
            .node_selector_terms
            .push(term);
        self
    }

    /// Add a preferred node affinity term `key in values`.
    #[must_use]
    pub fn preferred_node_affinity(mut self, weight: i32, key: &str, values: &[&str]) -> Self {
        let term = PreferredSchedulingTerm {
            weight,
            preference: NodeSelectorTerm {
                match_expressions: vec![Requirement::new(key, SelectorOperator::In, values)],
                match_fields: Vec::new(),
            },
        };
        self.affinity_mut()
            .node_affinity
            .get_or_insert_with(NodeAffinity::default)
            .preferred
            .push(term);
        self
    }
}

/// Fluent node builder.
#[derive(Debug, Clone)]
pub struct NodeWrapper(pub Node);

impl NodeWrapper {
    /// Finish.
    #[must_use]
    pub fn obj(self) -> Node {
        self.0
    }

    /// Set allocatable (and capacity) entries.
    #[must_use]
    pub fn capacity(mut self, resources: &[(&str, &str)]) -> Self {
        for (name, q) in resources {
            let q = quantity(q);
            self.0.status.allocatable.insert((*name).into(), q);
            self.0.status.capacity.insert((*name).into(), q);
        }
        self
    }

    /// Add a label.
    #[must_use]
    pub fn label(mut self, k: &str, v: &str) -> Self {
        self.0.metadata.labels.insert(k.into(), v.into());
        self
    }

    /// Set the zone label.
    #[must_use]
    pub fn zone(self, zone: &str) -> Self {
        self.label(LABEL_ZONE, zone)
    }

    /// Add a taint.
    #[must_use]
    pub fn taint(mut self, taint: Taint) -> Self {
        self.0.spec.taints.push(taint);
        self
    }

    /// Cordon the node.
    #[must_use]
    pub fn unschedulable(mut self) -> Self {
        self.0.spec.unschedulable = true;
        self
    }

    /// Add an image.
    #[must_use]
    pub fn image(mut self, names: &[&str], size_bytes: i64) -> Self {
        self.0.status.images.push(ContainerImage {
            names: names.iter().map(ToString::to_string).collect(),
            size_bytes,
        });
        self
    }
}

/// A framework handle over `snapshot` with a fake client and two workers.
#[must_use]
pub fn test_handle(snapshot: Snapshot) -> FrameworkHandle {
    test_handle_with_client(snapshot, Arc::new(FakeClientSet::new()))
}

/// Like [`test_handle`], with the given client.
#[must_use]
pub fn test_handle_with_client(snapshot: Snapshot, client: Arc<dyn ClientSet>) -> FrameworkHandle {
    let parallelizer =
        Parallelizer::new(2).unwrap_or_else(|e| panic!("building test worker pool: {e}"));
    FrameworkHandle::new(
        SnapshotHandle::new(snapshot),
        client,
        Arc::new(PodNominator::new()),
        parallelizer,
    )
}
