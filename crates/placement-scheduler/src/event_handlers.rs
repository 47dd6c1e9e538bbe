//! Routing of informer events into the cache and the queue.
//!
//! Pods with a node name belong to the cache. Unassigned pods that one of
//! our profiles is responsible for belong to the queue. An update that moves
//! a pod across that line is delivered as a delete on one side and an add on
//! the other.

use crate::informer::{EventReceiver, InformerEvent};
use crate::profile;
use crate::queue::ClusterEvent;
use crate::scheduler::Scheduler;
use placement_core::{Node, Pod};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

impl Scheduler {
    /// Apply events until the sender side is dropped.
    pub async fn run_event_loop(self: Arc<Self>, mut events: EventReceiver) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        debug!("Informer event stream ended");
    }

    /// Apply one informer event.
    pub fn handle_event(&self, event: InformerEvent) {
        match event {
            InformerEvent::PodAdded(pod) => {
                if pod.is_assigned() {
                    self.add_pod_to_cache(&pod);
                } else if self.responsible_for(&pod) {
                    self.add_pod_to_scheduling_queue(pod);
                }
            }
            InformerEvent::PodUpdated { old, new } => self.on_pod_update(old, new),
            InformerEvent::PodDeleted(pod) => {
                if pod.is_assigned() {
                    self.delete_pod_from_cache(&pod);
                } else if self.responsible_for(&pod) {
                    self.delete_pod_from_scheduling_queue(&pod);
                }
            }
            InformerEvent::NodeAdded(node) => self.add_node_to_cache(&node),
            InformerEvent::NodeUpdated { old, new } => self.update_node_in_cache(&old, &new),
            InformerEvent::NodeDeleted(node) => self.delete_node_from_cache(&node),
            InformerEvent::Synced => {
                info!("Informer caches are synced");
                self.mark_synced();
            }
        }
    }

    fn responsible_for(&self, pod: &Pod) -> bool {
        self.profiles().handles_scheduler_name(profile::scheduler_name(pod))
    }

    fn queued(&self, pod: &Pod) -> bool {
        !pod.is_assigned() && self.responsible_for(pod)
    }

    fn on_pod_update(&self, old: Pod, new: Pod) {
        match (old.is_assigned(), new.is_assigned()) {
            (true, true) => self.update_pod_in_cache(&old, &new),
            (false, true) => {
                if self.queued(&old) {
                    self.delete_pod_from_scheduling_queue(&old);
                }
                self.add_pod_to_cache(&new);
            }
            (true, false) => {
                self.delete_pod_from_cache(&old);
                if self.queued(&new) {
                    self.add_pod_to_scheduling_queue(new);
                }
            }
            (false, false) => match (self.queued(&old), self.queued(&new)) {
                (true, true) => self.update_pod_in_scheduling_queue(&old, new),
                (true, false) => self.delete_pod_from_scheduling_queue(&old),
                (false, true) => self.add_pod_to_scheduling_queue(new),
                (false, false) => {}
            },
        }
    }

    fn add_pod_to_cache(&self, pod: &Pod) {
        debug!(pod = %pod.full_name(), node = %pod.node_name(), "Add event for scheduled pod");
        if let Err(e) = self.cache().add_pod(pod) {
            error!(pod = %pod.full_name(), error = %e, "Scheduler cache AddPod failed");
        }
        self.queue().assigned_pod_added(pod);
    }

    fn update_pod_in_cache(&self, old: &Pod, new: &Pod) {
        // A delete and re-create under the same name can be folded into one
        // update by the watch.
        if old.uid() != new.uid() {
            self.delete_pod_from_cache(old);
            self.add_pod_to_cache(new);
            return;
        }
        if let Err(e) = self.cache().update_pod(old, new) {
            error!(pod = %new.full_name(), error = %e, "Scheduler cache UpdatePod failed");
        }
        self.queue().assigned_pod_updated(new);
    }

    fn delete_pod_from_cache(&self, pod: &Pod) {
        debug!(pod = %pod.full_name(), "Delete event for scheduled pod");
        if let Err(e) = self.cache().remove_pod(pod) {
            error!(pod = %pod.full_name(), error = %e, "Scheduler cache RemovePod failed");
        }
        self.queue()
            .move_all_to_active_or_backoff_queue(ClusterEvent::AssignedPodDelete);
    }

    fn add_pod_to_scheduling_queue(&self, pod: Pod) {
        debug!(pod = %pod.full_name(), "Add event for unscheduled pod");
        self.queue().add(Arc::new(pod));
    }

    fn update_pod_in_scheduling_queue(&self, old: &Pod, new: Pod) {
        if self.skip_pod_update(&new) {
            return;
        }
        self.queue().update(Some(old), Arc::new(new));
    }

    fn delete_pod_from_scheduling_queue(&self, pod: &Pod) {
        debug!(pod = %pod.full_name(), "Delete event for unscheduled pod");
        self.queue().delete(pod);
        if let Some(framework) = self.profiles().for_pod(pod) {
            framework.reject_waiting_pod(pod.uid());
        }
    }

    /// Check whether `pod` is only our own assumption echoed back: the cache
    /// holds an assumed copy equal to it apart from the node name and the
    /// resource version.
    pub(crate) fn skip_pod_update(&self, pod: &Pod) -> bool {
        if !self.cache().is_assumed_pod(pod).unwrap_or(false) {
            return false;
        }
        let Ok(assumed) = self.cache().get_pod(pod) else {
            return false;
        };
        let strip = |p: &Pod| {
            let mut p = p.clone();
            p.metadata.resource_version.clear();
            p.spec.node_name.clear();
            p
        };
        if strip(&assumed) != strip(pod) {
            return false;
        }
        debug!(pod = %pod.full_name(), "Skipping pod update of assumed pod");
        true
    }

    fn add_node_to_cache(&self, node: &Node) {
        debug!(node = %node.name(), "Add event for node");
        self.cache().add_node(node);
        self.queue()
            .move_all_to_active_or_backoff_queue(ClusterEvent::NodeAdd);
    }

    fn update_node_in_cache(&self, old: &Node, new: &Node) {
        self.cache().update_node(old, new);
        // With nothing parked there is no point comparing; the move still
        // covers a pod whose failing cycle is in flight.
        if self.queue().num_unschedulable_pods() == 0 {
            self.queue()
                .move_all_to_active_or_backoff_queue(ClusterEvent::Unknown);
        } else if let Some(event) = node_scheduling_properties_change(new, old) {
            self.queue().move_all_to_active_or_backoff_queue(event);
        }
    }

    fn delete_node_from_cache(&self, node: &Node) {
        debug!(node = %node.name(), "Delete event for node");
        if let Err(e) = self.cache().remove_node(node) {
            error!(node = %node.name(), error = %e, "Scheduler cache RemoveNode failed");
        }
    }
}

/// The first property change that can make pods schedulable on `new`.
fn node_scheduling_properties_change(new: &Node, old: &Node) -> Option<ClusterEvent> {
    if old.spec.unschedulable && !new.spec.unschedulable {
        return Some(ClusterEvent::NodeSpecUnschedulableChange);
    }
    if old.status.allocatable != new.status.allocatable {
        return Some(ClusterEvent::NodeAllocatableChange);
    }
    if old.metadata.labels != new.metadata.labels {
        return Some(ClusterEvent::NodeLabelChange);
    }
    if old.spec.taints != new.spec.taints {
        return Some(ClusterEvent::NodeTaintChange);
    }
    if condition_statuses(old) != condition_statuses(new) {
        return Some(ClusterEvent::NodeConditionChange);
    }
    None
}

fn condition_statuses(node: &Node) -> HashMap<&str, &str> {
    node.status
        .conditions
        .iter()
        .map(|c| (c.type_.as_str(), c.status.as_str()))
        .collect()
}
