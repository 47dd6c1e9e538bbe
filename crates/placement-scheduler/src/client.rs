//! The API boundary used to commit scheduling decisions.

use crate::error::Result;
use async_trait::async_trait;
use placement_core::{Pod, PodCondition, Uid};
use serde::{Deserialize, Serialize};

/// A pod-to-node assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// Pod namespace.
    pub namespace: String,
    /// Pod name.
    pub name: String,
    /// Pod uid.
    pub uid: Uid,
    /// Target node.
    pub node: String,
}

impl Binding {
    /// Binding of `pod` to `node`.
    #[must_use]
    pub fn new(pod: &Pod, node: &str) -> Self {
        Self {
            namespace: pod.namespace().to_string(),
            name: pod.name().to_string(),
            uid: pod.uid().clone(),
            node: node.to_string(),
        }
    }
}

/// Writes to the cluster API.
#[async_trait]
pub trait ClientSet: Send + Sync {
    /// Durably bind a pod to a node. Must be idempotent.
    async fn bind(&self, binding: &Binding) -> Result<()>;

    /// Record a pod condition and, when not empty, the nominated node.
    async fn update_pod_condition(
        &self,
        pod: &Pod,
        condition: &PodCondition,
        nominated_node: &str,
    ) -> Result<()>;
}

/// An in-memory client set for testing.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use crate::error::SchedulerError;
    use crate::informer::InformerEvent;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use tokio::sync::mpsc;

    /// A status update recorded by [`FakeClientSet`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ConditionUpdate {
        /// Pod key.
        pub pod: String,
        /// Condition written.
        pub condition: PodCondition,
        /// Nominated node written.
        pub nominated_node: String,
    }

    /// A client set that records calls instead of talking to a cluster.
    #[derive(Debug, Default)]
    pub struct FakeClientSet {
        bindings: Mutex<Vec<Binding>>,
        conditions: Mutex<Vec<ConditionUpdate>>,
        fail_binds: Mutex<HashSet<String>>,
        fail_all_binds: Mutex<bool>,
        echo: Mutex<Option<mpsc::UnboundedSender<InformerEvent>>>,
        tracked: Mutex<HashMap<Uid, Pod>>,
    }

    impl FakeClientSet {
        /// Create an empty client set.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Send an update event for every successful bind of a tracked pod,
        /// as a watch on the API server would.
        pub fn echo_binds_to(&self, events: mpsc::UnboundedSender<InformerEvent>) {
            *self.echo.lock() = Some(events);
        }

        /// Remember `pod` so binds of it can be echoed.
        pub fn track(&self, pod: &Pod) {
            self.tracked.lock().insert(pod.uid().clone(), pod.clone());
        }

        /// Make binds of the named pod fail.
        pub fn fail_binds_for(&self, pod_name: &str) {
            self.fail_binds.lock().insert(pod_name.to_string());
        }

        /// Make every bind fail, or succeed again.
        pub fn set_fail_all_binds(&self, fail: bool) {
            *self.fail_all_binds.lock() = fail;
        }

        /// Bindings performed so far.
        #[must_use]
        pub fn bindings(&self) -> Vec<Binding> {
            self.bindings.lock().clone()
        }

        /// Node the pod was bound to.
        #[must_use]
        pub fn bound_node(&self, pod_name: &str) -> Option<String> {
            self.bindings
                .lock()
                .iter()
                .rev()
                .find(|b| b.name == pod_name)
                .map(|b| b.node.clone())
        }

        /// Condition updates performed so far.
        #[must_use]
        pub fn condition_updates(&self) -> Vec<ConditionUpdate> {
            self.conditions.lock().clone()
        }
    }

    #[async_trait]
    impl ClientSet for FakeClientSet {
        async fn bind(&self, binding: &Binding) -> Result<()> {
            if *self.fail_all_binds.lock() || self.fail_binds.lock().contains(&binding.name) {
                return Err(SchedulerError::BindRejected(format!(
                    "{}/{} on {}",
                    binding.namespace, binding.name, binding.node
                )));
            }
            self.bindings.lock().push(binding.clone());
            let echo = self.echo.lock().clone();
            if let (Some(tx), Some(old)) = (echo, self.tracked.lock().get(&binding.uid).cloned()) {
                let mut new = old.clone();
                new.spec.node_name.clone_from(&binding.node);
                new.metadata.resource_version = format!("{}-bound", old.metadata.resource_version);
                let _ = tx.send(InformerEvent::PodUpdated { old, new });
            }
            Ok(())
        }

        async fn update_pod_condition(
            &self,
            pod: &Pod,
            condition: &PodCondition,
            nominated_node: &str,
        ) -> Result<()> {
            self.conditions.lock().push(ConditionUpdate {
                pod: pod.full_name(),
                condition: condition.clone(),
                nominated_node: nominated_node.to_string(),
            });
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::FakeClientSet;
    use super::*;
    use crate::error::SchedulerError;
    use crate::testing::make_pod;

    #[tokio::test]
    async fn fake_records_bindings() {
        let client = FakeClientSet::new();
        let pod = make_pod("p").obj();
        client.bind(&Binding::new(&pod, "n1")).await.unwrap();
        assert_eq!(client.bound_node("p").as_deref(), Some("n1"));

        client.fail_binds_for("q");
        let err = client
            .bind(&Binding::new(&make_pod("q").obj(), "n1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::BindRejected(_)));
        assert_eq!(client.bindings().len(), 1);
    }

    #[tokio::test]
    async fn fake_records_conditions() {
        let client = FakeClientSet::new();
        let condition = PodCondition {
            type_: placement_core::POD_SCHEDULED.into(),
            status: "False".into(),
            ..PodCondition::default()
        };
        client
            .update_pod_condition(&make_pod("p").obj(), &condition, "n2")
            .await
            .unwrap();
        let updates = client.condition_updates();
        assert_eq!(updates[0].pod, "default/p");
        assert_eq!(updates[0].nominated_node, "n2");
    }
}
