//! Scheduling profiles: one framework per scheduler name.

use crate::config::{ProfileConfig, SchedulerConfig, DEFAULT_SCHEDULER_NAME};
use crate::error::{Result, SchedulerError};
use crate::framework::{Framework, FrameworkHandle, Registry};
use crate::plugins::default_plugins;
use placement_core::Pod;
use std::collections::HashMap;
use std::sync::Arc;

/// Frameworks keyed by scheduler name.
#[derive(Debug, Default)]
pub struct Map(HashMap<String, Arc<Framework>>);

impl Map {
    /// Build every profile of `config`. Each framework gets the handle
    /// returned by `new_handle`, so each has its own waiting pods.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] if a profile has no name, two
    /// profiles share a name, profiles disagree on the queue sort plugin or
    /// its args, or a framework cannot be built.
    pub fn new(
        config: &SchedulerConfig,
        registry: &Registry,
        mut new_handle: impl FnMut() -> FrameworkHandle,
    ) -> Result<Self> {
        let defaults = default_plugins(config.algorithm_provider);
        let mut validator = Validator::default();
        let mut map = HashMap::new();
        for profile in &config.profiles {
            let plugins = match &profile.plugins {
                Some(custom) => defaults.merge(custom),
                None => defaults.clone(),
            };
            if map.contains_key(&profile.scheduler_name) {
                return Err(SchedulerError::Config(format!(
                    "duplicate profile with scheduler name {:?}",
                    profile.scheduler_name
                )));
            }
            validator.check(profile, plugins.queue_sort.enabled.iter().map(|p| p.name.as_str()))?;

            let framework = Framework::new(registry, profile, &plugins, new_handle(), config.run_all_filters)
                .map_err(|e| {
                    SchedulerError::Config(format!(
                        "creating profile for scheduler name {}: {e}",
                        profile.scheduler_name
                    ))
                })?;
            map.insert(profile.scheduler_name.clone(), Arc::new(framework));
        }
        Ok(Self(map))
    }

    /// The framework for a scheduler name.
    #[must_use]
    pub fn get(&self, scheduler_name: &str) -> Option<&Arc<Framework>> {
        self.0.get(scheduler_name)
    }

    /// The framework responsible for `pod`. Pods without a scheduler name
    /// belong to [`DEFAULT_SCHEDULER_NAME`].
    #[must_use]
    pub fn for_pod(&self, pod: &Pod) -> Option<&Arc<Framework>> {
        self.get(scheduler_name(pod))
    }

    /// Check whether some profile handles `scheduler_name`.
    #[must_use]
    pub fn handles_scheduler_name(&self, scheduler_name: &str) -> bool {
        self.0.contains_key(scheduler_name)
    }

    /// Any profile; all share the same queue sort.
    #[must_use]
    pub fn first(&self) -> Option<&Arc<Framework>> {
        self.0.values().next()
    }

    /// Every framework.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<Framework>)> + '_ {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of profiles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check whether there are no profiles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The scheduler name a pod asks for.
#[must_use]
pub fn scheduler_name(pod: &Pod) -> &str {
    if pod.spec.scheduler_name.is_empty() {
        DEFAULT_SCHEDULER_NAME
    } else {
        &pod.spec.scheduler_name
    }
}

#[derive(Default)]
struct Validator {
    queue_sort: Option<(String, Option<serde_json::Value>)>,
}

impl Validator {
    fn check<'a>(&mut self, profile: &ProfileConfig, mut queue_sort: impl Iterator<Item = &'a str>) -> Result<()> {
        let name = &profile.scheduler_name;
        if name.is_empty() {
            return Err(SchedulerError::Config("scheduler name is needed".into()));
        }
        let (Some(sort), None) = (queue_sort.next(), queue_sort.next()) else {
            return Err(SchedulerError::Config(format!(
                "one queue sort plugin required for profile with scheduler name {name:?}"
            )));
        };
        let args = profile
            .plugin_config
            .iter()
            .find(|c| c.name == sort)
            .map(|c| c.args.clone());

        match &self.queue_sort {
            None => {
                self.queue_sort = Some((sort.to_string(), args));
                Ok(())
            }
            Some((first, _)) if first != sort => Err(SchedulerError::Config(format!(
                "different queue sort plugins for profile {name:?}: {sort:?}, first: {first:?}"
            ))),
            Some((_, first_args)) if *first_args != args => Err(SchedulerError::Config(format!(
                "different queue sort plugin args for profile {name:?}"
            ))),
            Some(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Snapshot;
    use crate::config::{PluginConfig, PluginEntry, PluginSet, Plugins};
    use crate::plugins::{new_in_tree_registry, node_resources, queue_sort};
    use crate::testing::test_handle;

    fn build(profiles: Vec<ProfileConfig>) -> Result<Map> {
        let config = SchedulerConfig {
            profiles,
            ..SchedulerConfig::default()
        };
        Map::new(&config, &new_in_tree_registry(), || test_handle(Snapshot::new()))
    }

    fn profile(name: &str) -> ProfileConfig {
        ProfileConfig {
            scheduler_name: name.into(),
            ..ProfileConfig::default()
        }
    }

    fn config_error(result: Result<Map>) -> String {
        match result {
            Err(SchedulerError::Config(msg)) => msg,
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn builds_default_profile() {
        let map = build(vec![ProfileConfig::default()]).unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.handles_scheduler_name(crate::config::DEFAULT_SCHEDULER_NAME));
        assert!(!map.handles_scheduler_name("other"));
        assert!(map.for_pod(&crate::testing::make_pod("p").obj()).is_some());
        assert!(map.for_pod(&crate::testing::make_pod("p").scheduler_name("other").obj()).is_none());
        let framework = map.first().unwrap();
        assert!(framework.has_filter_plugins());
        assert!(framework.has_score_plugins());
    }

    #[test]
    fn custom_plugins_merge_onto_defaults() {
        let mut p = profile("packer");
        p.plugins = Some(Plugins {
            score: PluginSet {
                enabled: vec![PluginEntry::weighted(node_resources::names::MOST_ALLOCATED, 5)],
                disabled: vec![PluginEntry::new(node_resources::names::LEAST_ALLOCATED)],
            },
            ..Plugins::default()
        });
        let map = build(vec![profile("spreader"), p]).unwrap();
        assert_eq!(map.len(), 2);

        let score = &map.get("packer").unwrap().list_plugins()["Score"];
        assert!(score.iter().any(|e| e.name == node_resources::names::MOST_ALLOCATED && e.weight == 5));
        assert!(!score.iter().any(|e| e.name == node_resources::names::LEAST_ALLOCATED));

        let score = &map.get("spreader").unwrap().list_plugins()["Score"];
        assert!(score.iter().any(|e| e.name == node_resources::names::LEAST_ALLOCATED));
    }

    #[test]
    fn rejects_bad_profiles() {
        assert_eq!(config_error(build(vec![profile("")])), "scheduler name is needed");
        assert!(config_error(build(vec![profile("a"), profile("a")])).contains("duplicate profile"));

        let mut two_sorts = profile("b");
        two_sorts.plugins = Some(Plugins {
            queue_sort: PluginSet::enable(&["Other"]),
            ..Plugins::default()
        });
        assert!(config_error(build(vec![two_sorts])).contains("one queue sort plugin required"));

        let mut replaced = profile("b");
        replaced.plugins = Some(Plugins {
            queue_sort: PluginSet {
                enabled: vec![PluginEntry::new("Other")],
                disabled: vec![PluginEntry::new("*")],
            },
            ..Plugins::default()
        });
        assert!(config_error(build(vec![profile("a"), replaced])).contains("different queue sort plugins"));

        let mut with_args = profile("b");
        with_args.plugin_config = vec![PluginConfig {
            name: queue_sort::NAME.into(),
            args: serde_json::json!({"x": 1}),
        }];
        assert!(config_error(build(vec![profile("a"), with_args])).contains("different queue sort plugin args"));
    }

    #[test]
    fn profiles_have_separate_waiting_pods() {
        let map = build(vec![profile("a"), profile("b")]).unwrap();
        let a = map.get("a").unwrap().handle().waiting_pods();
        let b = map.get("b").unwrap().handle().waiting_pods();
        assert!(!Arc::ptr_eq(a, b));
    }
}
