//! In-tree plugins and the default plugin sets.

pub mod default_binder;
pub mod helper;
pub mod image_locality;
pub mod inter_pod_affinity;
pub mod node_affinity;
pub mod node_name;
pub mod node_resources;
pub mod node_unschedulable;
pub mod pod_topology_spread;
pub mod queue_sort;
pub mod selector_spread;
pub mod taint_toleration;
pub mod volume_zone;

use crate::config::{AlgorithmProvider, PluginEntry, PluginSet, Plugins};
use crate::error::Result;
use crate::framework::{FrameworkHandle, Plugin, PluginFactory, Registry};
use node_resources::names as resources;
use std::sync::Arc;

type FactoryFn = fn(Option<&serde_json::Value>, &FrameworkHandle) -> Result<Arc<dyn Plugin>>;

/// Every plugin shipped with the scheduler.
#[must_use]
pub fn new_in_tree_registry() -> Registry {
    let factories: [(&str, FactoryFn); 16] = [
        (queue_sort::NAME, queue_sort::new),
        (default_binder::NAME, default_binder::new),
        (image_locality::NAME, image_locality::new),
        (inter_pod_affinity::NAME, inter_pod_affinity::new),
        (node_affinity::NAME, node_affinity::new),
        (node_name::NAME, node_name::new),
        (resources::FIT, node_resources::new_fit),
        (resources::BALANCED_ALLOCATION, node_resources::new_balanced_allocation),
        (resources::LEAST_ALLOCATED, node_resources::new_least_allocated),
        (resources::MOST_ALLOCATED, node_resources::new_most_allocated),
        (resources::REQUESTED_TO_CAPACITY_RATIO, node_resources::new_requested_to_capacity_ratio),
        (node_unschedulable::NAME, node_unschedulable::new),
        (pod_topology_spread::NAME, pod_topology_spread::new),
        (selector_spread::NAME, selector_spread::new),
        (taint_toleration::NAME, taint_toleration::new),
        (volume_zone::NAME, volume_zone::new),
    ];
    factories
        .into_iter()
        .map(|(name, f)| (name, Arc::new(f) as PluginFactory))
        .collect()
}

/// The plugins enabled by `provider`.
#[must_use]
pub fn default_plugins(provider: AlgorithmProvider) -> Plugins {
    let allocation = match provider {
        AlgorithmProvider::DefaultProvider => resources::LEAST_ALLOCATED,
        AlgorithmProvider::ClusterAutoscalerProvider => resources::MOST_ALLOCATED,
    };
    let weighted = |entries: &[(&str, i32)]| PluginSet {
        enabled: entries.iter().map(|(n, w)| PluginEntry::weighted(n, *w)).collect(),
        disabled: Vec::new(),
    };
    Plugins {
        queue_sort: PluginSet::enable(&[queue_sort::NAME]),
        pre_filter: PluginSet::enable(&[
            resources::FIT,
            pod_topology_spread::NAME,
            inter_pod_affinity::NAME,
        ]),
        filter: PluginSet::enable(&[
            node_unschedulable::NAME,
            resources::FIT,
            node_name::NAME,
            node_affinity::NAME,
            taint_toleration::NAME,
            volume_zone::NAME,
            pod_topology_spread::NAME,
            inter_pod_affinity::NAME,
        ]),
        pre_score: PluginSet::enable(&[
            inter_pod_affinity::NAME,
            pod_topology_spread::NAME,
            taint_toleration::NAME,
            selector_spread::NAME,
        ]),
        score: weighted(&[
            (resources::BALANCED_ALLOCATION, 1),
            (image_locality::NAME, 1),
            (inter_pod_affinity::NAME, 1),
            (allocation, 1),
            (node_affinity::NAME, 1),
            // Spreading across domains outweighs most single signals.
            (pod_topology_spread::NAME, 2),
            (taint_toleration::NAME, 1),
            (selector_spread::NAME, 1),
        ]),
        bind: PluginSet::enable(&[default_binder::NAME]),
        ..Plugins::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Snapshot;
    use crate::testing::test_handle;

    #[test]
    fn every_default_plugin_is_registered_and_builds() {
        let registry = new_in_tree_registry();
        let handle = test_handle(Snapshot::new());
        for provider in [AlgorithmProvider::DefaultProvider, AlgorithmProvider::ClusterAutoscalerProvider] {
            let plugins = default_plugins(provider);
            for (point, set) in plugins.extension_points() {
                for entry in &set.enabled {
                    let factory = registry
                        .get(&entry.name)
                        .unwrap_or_else(|| panic!("{point}: {} not registered", entry.name));
                    let plugin = factory(None, &handle).unwrap();
                    assert_eq!(plugin.name(), entry.name);
                }
            }
        }
        assert!(registry.get(resources::REQUESTED_TO_CAPACITY_RATIO).is_some());
    }

    #[test]
    fn provider_picks_allocation_scorer() {
        let names = |p| {
            default_plugins(p)
                .score
                .enabled
                .into_iter()
                .map(|e| e.name)
                .collect::<Vec<_>>()
        };
        assert!(names(AlgorithmProvider::DefaultProvider).contains(&resources::LEAST_ALLOCATED.to_string()));
        assert!(names(AlgorithmProvider::ClusterAutoscalerProvider).contains(&resources::MOST_ALLOCATED.to_string()));
        let spread = default_plugins(AlgorithmProvider::DefaultProvider)
            .score
            .enabled
            .into_iter()
            .find(|e| e.name == pod_topology_spread::NAME)
            .unwrap();
        assert_eq!(spread.weight, 2);
    }
}
