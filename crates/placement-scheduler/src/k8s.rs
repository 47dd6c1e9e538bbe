//! Kubernetes adapters for the client and informer boundaries.
//!
//! The model types in `placement_core` use the API server's wire names, so
//! objects are converted by passing them through JSON.

use crate::client::{Binding, ClientSet};
use crate::error::Result;
use crate::informer::{EventSender, Informer, InformerEvent};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{
    Binding as K8sBinding, Node as K8sNode, ObjectReference, Pod as K8sPod,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta as K8sObjectMeta;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::watcher::{self, watcher, Config as WatcherConfig};
use kube::Client;
use placement_core::{Node, Pod, PodCondition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// Pods in a terminal phase hold no resources and are never watched.
const NON_TERMINAL_PODS: &str = "status.phase!=Succeeded,status.phase!=Failed";

/// Convert between the API types and the model.
///
/// # Errors
///
/// Returns [`crate::SchedulerError::Json`] if `obj` does not fit the target shape.
pub fn convert<K: Serialize, T: DeserializeOwned>(obj: &K) -> Result<T> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Writes bindings and pod status through the API server.
#[derive(Clone)]
pub struct KubeClientSet {
    client: Client,
}

impl KubeClientSet {
    /// Create a client set over `client`.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<K8sPod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClientSet for KubeClientSet {
    async fn bind(&self, binding: &Binding) -> Result<()> {
        let body = K8sBinding {
            metadata: K8sObjectMeta {
                name: Some(binding.name.clone()),
                namespace: Some(binding.namespace.clone()),
                uid: Some(binding.uid.as_str().to_string()),
                ..K8sObjectMeta::default()
            },
            target: ObjectReference {
                api_version: Some("v1".into()),
                kind: Some("Node".into()),
                name: Some(binding.node.clone()),
                ..ObjectReference::default()
            },
        };
        debug!(
            pod = %format!("{}/{}", binding.namespace, binding.name),
            node = %binding.node,
            "Binding pod"
        );
        self.pods(&binding.namespace)
            .create_subresource::<serde_json::Value>(
                "binding",
                &binding.name,
                &PostParams::default(),
                serde_json::to_vec(&body)?,
            )
            .await?;
        Ok(())
    }

    async fn update_pod_condition(
        &self,
        pod: &Pod,
        condition: &PodCondition,
        nominated_node: &str,
    ) -> Result<()> {
        let mut status = serde_json::json!({ "conditions": [condition] });
        if !nominated_node.is_empty() {
            status["nominatedNodeName"] = nominated_node.into();
        }
        let patch = serde_json::json!({ "status": status });
        self.pods(pod.namespace())
            .patch_status(pod.name(), &PatchParams::default(), &Patch::Strategic(patch))
            .await?;
        Ok(())
    }
}

/// Watches pods and nodes on the API server.
pub struct KubeInformer {
    client: Client,
    synced: AtomicBool,
}

impl KubeInformer {
    /// Create an informer over `client`.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            synced: AtomicBool::new(false),
        }
    }
}

enum Watched {
    Pod(std::result::Result<watcher::Event<K8sPod>, watcher::Error>),
    Node(std::result::Result<watcher::Event<K8sNode>, watcher::Error>),
}

#[async_trait]
impl Informer for KubeInformer {
    async fn run(&self, events: EventSender) -> Result<()> {
        let pods = watcher(
            Api::<K8sPod>::all(self.client.clone()),
            WatcherConfig::default().fields(NON_TERMINAL_PODS),
        )
        .map(Watched::Pod);
        let nodes = watcher(Api::<K8sNode>::all(self.client.clone()), WatcherConfig::default())
            .map(Watched::Node);
        let stream = futures::stream::select(pods, nodes);
        futures::pin_mut!(stream);

        let mut pod_tracker = Tracker::<Pod>::default();
        let mut node_tracker = Tracker::<Node>::default();
        info!("Starting pod and node watchers");

        while let Some(item) = stream.next().await {
            let out = match item {
                Watched::Pod(Ok(event)) => pod_tracker.handle(convert_event(event)),
                Watched::Node(Ok(event)) => node_tracker.handle(convert_event(event)),
                Watched::Pod(Err(e)) | Watched::Node(Err(e)) => {
                    error!(error = %e, "Watcher error, will retry");
                    continue;
                }
            };
            for event in out {
                if events.send(event).is_err() {
                    return Ok(());
                }
            }
            if !self.has_synced() && pod_tracker.listed && node_tracker.listed {
                self.synced.store(true, Ordering::Release);
                info!(
                    pods = pod_tracker.known.len(),
                    nodes = node_tracker.known.len(),
                    "Initial listing complete"
                );
                if events.send(InformerEvent::Synced).is_err() {
                    return Ok(());
                }
            }
        }

        warn!("Watch streams exited unexpectedly");
        Ok(())
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

/// Convert the object of a watch event. Objects that fail to convert are
/// dropped with a warning.
fn convert_event<K: Serialize, T: DeserializeOwned>(event: watcher::Event<K>) -> watcher::Event<Option<T>> {
    let conv = |obj: K| match convert(&obj) {
        Ok(t) => Some(t),
        Err(e) => {
            warn!(error = %e, "Dropping object that does not convert");
            None
        }
    };
    match event {
        watcher::Event::Apply(obj) => watcher::Event::Apply(conv(obj)),
        watcher::Event::Delete(obj) => watcher::Event::Delete(conv(obj)),
        watcher::Event::InitApply(obj) => watcher::Event::InitApply(conv(obj)),
        watcher::Event::Init => watcher::Event::Init,
        watcher::Event::InitDone => watcher::Event::InitDone,
    }
}

/// Objects the informer keeps the last version of.
trait Tracked: Clone + PartialEq {
    fn key(&self) -> String;
    fn added(self) -> InformerEvent;
    fn updated(old: Self, new: Self) -> InformerEvent;
    fn deleted(self) -> InformerEvent;
}

impl Tracked for Pod {
    fn key(&self) -> String {
        self.full_name()
    }
    fn added(self) -> InformerEvent {
        InformerEvent::PodAdded(self)
    }
    fn updated(old: Self, new: Self) -> InformerEvent {
        InformerEvent::PodUpdated { old, new }
    }
    fn deleted(self) -> InformerEvent {
        InformerEvent::PodDeleted(self)
    }
}

impl Tracked for Node {
    fn key(&self) -> String {
        self.name().to_string()
    }
    fn added(self) -> InformerEvent {
        InformerEvent::NodeAdded(self)
    }
    fn updated(old: Self, new: Self) -> InformerEvent {
        InformerEvent::NodeUpdated { old, new }
    }
    fn deleted(self) -> InformerEvent {
        InformerEvent::NodeDeleted(self)
    }
}

/// Turns the watcher's apply/delete stream into add/update/delete events.
/// A relist deletes whatever it did not mention.
struct Tracker<T> {
    known: HashMap<String, T>,
    relisted: Option<HashSet<String>>,
    listed: bool,
}

impl<T> Default for Tracker<T> {
    fn default() -> Self {
        Self {
            known: HashMap::new(),
            relisted: None,
            listed: false,
        }
    }
}

impl<T: Tracked> Tracker<T> {
    fn handle(&mut self, event: watcher::Event<Option<T>>) -> Vec<InformerEvent> {
        match event {
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(Some(obj)) => {
                if let Some(seen) = &mut self.relisted {
                    seen.insert(obj.key());
                }
                self.apply(obj).into_iter().collect()
            }
            watcher::Event::InitDone => {
                let seen = self.relisted.take().unwrap_or_default();
                self.listed = true;
                let stale: Vec<String> = self
                    .known
                    .keys()
                    .filter(|k| !seen.contains(*k))
                    .cloned()
                    .collect();
                stale
                    .iter()
                    .filter_map(|k| self.known.remove(k))
                    .map(T::deleted)
                    .collect()
            }
            watcher::Event::Apply(Some(obj)) => self.apply(obj).into_iter().collect(),
            watcher::Event::Delete(Some(obj)) => {
                let last = self.known.remove(&obj.key()).unwrap_or(obj);
                vec![last.deleted()]
            }
            watcher::Event::InitApply(None) | watcher::Event::Apply(None) | watcher::Event::Delete(None) => {
                Vec::new()
            }
        }
    }

    fn apply(&mut self, obj: T) -> Option<InformerEvent> {
        match self.known.insert(obj.key(), obj.clone()) {
            Some(old) if old == obj => None,
            Some(old) => Some(T::updated(old, obj)),
            None => Some(obj.added()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{make_node, make_pod};
    use placement_core::{TaintEffect, RESOURCE_CPU};

    #[test]
    fn converts_api_pod() {
        let api: K8sPod = serde_json::from_value(serde_json::json!({
            "metadata": {
                "name": "web-0",
                "namespace": "prod",
                "uid": "6f1c",
                "resourceVersion": "12",
                "labels": {"app": "web"}
            },
            "spec": {
                "schedulerName": "default-scheduler",
                "priority": 100,
                "containers": [{
                    "name": "web",
                    "image": "nginx:1.25",
                    "resources": {"requests": {"cpu": "250m", "memory": "64Mi"}}
                }],
                "tolerations": [{"key": "dedicated", "operator": "Exists", "effect": "NoSchedule"}],
                "volumes": [{"name": "data", "persistentVolumeClaim": {"claimName": "data-0"}}]
            },
            "status": {
                "phase": "Pending",
                "conditions": [{
                    "type": "PodScheduled",
                    "status": "False",
                    "reason": "Unschedulable",
                    "lastTransitionTime": "2024-05-01T10:00:00Z"
                }]
            }
        }))
        .unwrap();

        let pod: Pod = convert(&api).unwrap();
        assert_eq!(pod.full_name(), "prod/web-0");
        assert_eq!(pod.uid().as_str(), "6f1c");
        assert_eq!(pod.priority(), 100);
        assert_eq!(pod.spec.containers[0].resources.requests[RESOURCE_CPU].milli_value(), 250);
        assert_eq!(pod.spec.tolerations[0].key, "dedicated");
        assert_eq!(pod.condition("PodScheduled").unwrap().reason, "Unschedulable");
        assert!(!pod.is_assigned());
    }

    #[test]
    fn converts_api_node() {
        let api: K8sNode = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "n1", "labels": {"topology.kubernetes.io/zone": "z1"}},
            "spec": {
                "unschedulable": true,
                "taints": [{"key": "gpu", "effect": "NoSchedule", "timeAdded": "2024-05-01T10:00:00Z"}]
            },
            "status": {
                "allocatable": {"cpu": "4", "memory": "8Gi", "pods": "110"},
                "conditions": [{"type": "Ready", "status": "True"}],
                "images": [{"names": ["nginx:1.25"], "sizeBytes": 50_000_000}]
            }
        }))
        .unwrap();

        let node: Node = convert(&api).unwrap();
        assert_eq!(node.name(), "n1");
        assert!(node.spec.unschedulable);
        assert_eq!(node.spec.taints[0].effect, TaintEffect::NoSchedule);
        assert_eq!(node.status.allocatable[RESOURCE_CPU].milli_value(), 4000);
        assert_eq!(node.status.images[0].size_bytes, 50_000_000);
    }

    #[test]
    fn binding_targets_node() {
        let binding = Binding::new(&make_pod("p").obj(), "n1");
        let body = K8sBinding {
            metadata: K8sObjectMeta {
                name: Some(binding.name.clone()),
                ..K8sObjectMeta::default()
            },
            target: ObjectReference {
                kind: Some("Node".into()),
                name: Some(binding.node.clone()),
                ..ObjectReference::default()
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["target"]["name"], "n1");
        assert_eq!(json["target"]["kind"], "Node");
    }

    #[test]
    fn tracker_turns_applies_into_adds_and_updates() {
        let mut tracker = Tracker::<Pod>::default();
        let pod = make_pod("p").obj();

        let out = tracker.handle(watcher::Event::Apply(Some(pod.clone())));
        assert_eq!(out, [InformerEvent::PodAdded(pod.clone())]);

        // Unchanged objects are not re-delivered.
        assert!(tracker.handle(watcher::Event::Apply(Some(pod.clone()))).is_empty());

        let bound = make_pod("p").node("n1").obj();
        let out = tracker.handle(watcher::Event::Apply(Some(bound.clone())));
        assert_eq!(
            out,
            [InformerEvent::PodUpdated {
                old: pod,
                new: bound.clone()
            }]
        );

        let out = tracker.handle(watcher::Event::Delete(Some(make_pod("p").obj())));
        assert_eq!(out, [InformerEvent::PodDeleted(bound)]);
        assert!(tracker.known.is_empty());
    }

    #[test]
    fn relist_deletes_missing_objects() {
        let mut tracker = Tracker::<Node>::default();
        let a = make_node("a").obj();
        let b = make_node("b").obj();
        tracker.handle(watcher::Event::Apply(Some(a.clone())));
        tracker.handle(watcher::Event::Apply(Some(b.clone())));
        assert!(!tracker.listed);

        tracker.handle(watcher::Event::Init);
        assert!(tracker.handle(watcher::Event::InitApply(Some(a))).is_empty());
        let out = tracker.handle(watcher::Event::InitDone);
        assert_eq!(out, [InformerEvent::NodeDeleted(b)]);
        assert!(tracker.listed);
        assert_eq!(tracker.known.len(), 1);
    }

    #[test]
    fn unconvertible_objects_are_dropped() {
        let mut tracker = Tracker::<Pod>::default();
        assert!(tracker.handle(watcher::Event::Apply(None)).is_empty());
        let event: watcher::Event<Option<Pod>> =
            convert_event(watcher::Event::Apply(serde_json::json!({"metadata": "oops"})));
        assert!(matches!(event, watcher::Event::Apply(None)));
    }
}
