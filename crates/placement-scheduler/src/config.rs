//! Scheduler configuration.
//!
//! Values come from, in increasing precedence: [`SchedulerConfig::default`],
//! the JSON file named by `PLACEMENT_CONFIG`, and the individual
//! `PLACEMENT_*` environment variables.

use crate::error::{Result, SchedulerError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Scheduler name used by pods that do not set one.
pub const DEFAULT_SCHEDULER_NAME: &str = "default-scheduler";

/// Set of default plugins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlgorithmProvider {
    /// Spread pods: least-allocated scoring.
    #[default]
    DefaultProvider,
    /// Pack pods: most-allocated scoring.
    ClusterAutoscalerProvider,
}

impl FromStr for AlgorithmProvider {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DefaultProvider" => Ok(Self::DefaultProvider),
            "ClusterAutoscalerProvider" => Ok(Self::ClusterAutoscalerProvider),
            other => Err(SchedulerError::Config(format!(
                "unknown algorithm provider {other:?}"
            ))),
        }
    }
}

/// A plugin named in a plugin set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginEntry {
    /// Registered plugin name.
    pub name: String,
    /// Score weight; only meaningful for score plugins.
    pub weight: i32,
}

impl PluginEntry {
    /// An entry with weight 0.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self::weighted(name, 0)
    }

    /// An entry with a score weight.
    #[must_use]
    pub fn weighted(name: &str, weight: i32) -> Self {
        Self {
            name: name.to_string(),
            weight,
        }
    }
}

/// Plugins enabled and disabled at one extension point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSet {
    /// Plugins to run, in order.
    pub enabled: Vec<PluginEntry>,
    /// Default plugins to drop; `"*"` drops all of them.
    pub disabled: Vec<PluginEntry>,
}

impl PluginSet {
    /// A set enabling the named plugins.
    #[must_use]
    pub fn enable(names: &[&str]) -> Self {
        Self {
            enabled: names.iter().map(|n| PluginEntry::new(n)).collect(),
            disabled: Vec::new(),
        }
    }

    /// Apply `custom` on top of this default set.
    #[must_use]
    pub fn merge(&self, custom: &Self) -> Self {
        let disabled: HashSet<&str> = custom.disabled.iter().map(|p| p.name.as_str()).collect();
        let mut enabled = Vec::new();
        if !disabled.contains("*") {
            enabled.extend(
                self.enabled
                    .iter()
                    .filter(|p| !disabled.contains(p.name.as_str()))
                    .cloned(),
            );
        }
        enabled.extend(custom.enabled.iter().cloned());
        Self {
            enabled,
            disabled: Vec::new(),
        }
    }
}

/// Plugin sets for every extension point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Plugins {
    /// Queue ordering.
    pub queue_sort: PluginSet,
    /// Pre-filter.
    pub pre_filter: PluginSet,
    /// Filter.
    pub filter: PluginSet,
    /// Post-filter.
    pub post_filter: PluginSet,
    /// Pre-score.
    pub pre_score: PluginSet,
    /// Score.
    pub score: PluginSet,
    /// Reserve.
    pub reserve: PluginSet,
    /// Permit.
    pub permit: PluginSet,
    /// Pre-bind.
    pub pre_bind: PluginSet,
    /// Bind.
    pub bind: PluginSet,
    /// Post-bind.
    pub post_bind: PluginSet,
}

impl Plugins {
    /// Apply `custom` on top of these defaults, point by point.
    #[must_use]
    pub fn merge(&self, custom: &Self) -> Self {
        Self {
            queue_sort: self.queue_sort.merge(&custom.queue_sort),
            pre_filter: self.pre_filter.merge(&custom.pre_filter),
            filter: self.filter.merge(&custom.filter),
            post_filter: self.post_filter.merge(&custom.post_filter),
            pre_score: self.pre_score.merge(&custom.pre_score),
            score: self.score.merge(&custom.score),
            reserve: self.reserve.merge(&custom.reserve),
            permit: self.permit.merge(&custom.permit),
            pre_bind: self.pre_bind.merge(&custom.pre_bind),
            bind: self.bind.merge(&custom.bind),
            post_bind: self.post_bind.merge(&custom.post_bind),
        }
    }

    /// Every extension point with its set, in framework order.
    #[must_use]
    pub fn extension_points(&self) -> [(&'static str, &PluginSet); 11] {
        [
            ("QueueSort", &self.queue_sort),
            ("PreFilter", &self.pre_filter),
            ("Filter", &self.filter),
            ("PostFilter", &self.post_filter),
            ("PreScore", &self.pre_score),
            ("Score", &self.score),
            ("Reserve", &self.reserve),
            ("Permit", &self.permit),
            ("PreBind", &self.pre_bind),
            ("Bind", &self.bind),
            ("PostBind", &self.post_bind),
        ]
    }
}

/// Args for one plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Plugin name.
    pub name: String,
    /// Plugin-specific args.
    pub args: serde_json::Value,
}

/// A named bundle of plugins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProfileConfig {
    /// Pods with this `spec.schedulerName` are handled by the profile.
    pub scheduler_name: String,
    /// Changes to the provider's default plugins.
    pub plugins: Option<Plugins>,
    /// Per-plugin args.
    pub plugin_config: Vec<PluginConfig>,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            scheduler_name: DEFAULT_SCHEDULER_NAME.to_string(),
            plugins: None,
            plugin_config: Vec::new(),
        }
    }
}

mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    /// Share of nodes to evaluate once the cluster has at least 100 nodes;
    /// 0 selects the adaptive default.
    pub percentage_of_nodes_to_score: u32,
    /// Backoff after the first failure.
    #[serde(with = "seconds")]
    pub pod_initial_backoff: Duration,
    /// Upper bound of the backoff.
    #[serde(with = "seconds")]
    pub pod_max_backoff: Duration,
    /// How long an assumed pod lives after binding finished without being
    /// confirmed.
    #[serde(with = "seconds")]
    pub assumed_pod_ttl: Duration,
    /// Period of the assumed-pod cleanup.
    #[serde(with = "seconds")]
    pub cache_cleanup_period: Duration,
    /// Worker threads for filtering and scoring.
    pub parallelism: usize,
    /// Evaluate every filter even after one failed.
    pub run_all_filters: bool,
    /// Default plugin sets.
    pub algorithm_provider: AlgorithmProvider,
    /// Profiles, at least one.
    pub profiles: Vec<ProfileConfig>,
    /// HTTP listen address of the binary.
    pub listen_addr: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            percentage_of_nodes_to_score: 0,
            pod_initial_backoff: Duration::from_secs(1),
            pod_max_backoff: Duration::from_secs(10),
            assumed_pod_ttl: Duration::from_secs(30),
            cache_cleanup_period: Duration::from_secs(1),
            parallelism: 16,
            run_all_filters: false,
            algorithm_provider: AlgorithmProvider::DefaultProvider,
            profiles: vec![ProfileConfig::default()],
            listen_addr: "0.0.0.0:10251".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if `PLACEMENT_CONFIG` names an unreadable or invalid
    /// file, or if the result fails [`SchedulerConfig::validate`].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load a JSON config file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match lookup("PLACEMENT_CONFIG") {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(val) = lookup("PLACEMENT_PERCENTAGE_OF_NODES_TO_SCORE") {
            if let Some(n) = parse_env("PLACEMENT_PERCENTAGE_OF_NODES_TO_SCORE", &val) {
                config.percentage_of_nodes_to_score = n;
            }
        }
        if let Some(val) = lookup("PLACEMENT_POD_INITIAL_BACKOFF_SECONDS") {
            if let Some(n) = parse_env("PLACEMENT_POD_INITIAL_BACKOFF_SECONDS", &val) {
                config.pod_initial_backoff = Duration::from_secs(n);
            }
        }
        if let Some(val) = lookup("PLACEMENT_POD_MAX_BACKOFF_SECONDS") {
            if let Some(n) = parse_env("PLACEMENT_POD_MAX_BACKOFF_SECONDS", &val) {
                config.pod_max_backoff = Duration::from_secs(n);
            }
        }
        if let Some(val) = lookup("PLACEMENT_ASSUMED_POD_TTL_SECONDS") {
            if let Some(n) = parse_env("PLACEMENT_ASSUMED_POD_TTL_SECONDS", &val) {
                config.assumed_pod_ttl = Duration::from_secs(n);
            }
        }
        if let Some(val) = lookup("PLACEMENT_PARALLELISM") {
            if let Some(n) = parse_env("PLACEMENT_PARALLELISM", &val) {
                config.parallelism = n;
            }
        }
        if let Some(val) = lookup("PLACEMENT_ALGORITHM_PROVIDER") {
            config.algorithm_provider = val.parse()?;
        }
        if let Some(val) = lookup("PLACEMENT_LISTEN_ADDR") {
            config.listen_addr = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.percentage_of_nodes_to_score > 100 {
            return Err(SchedulerError::Config(format!(
                "percentageOfNodesToScore must be in [0, 100], got {}",
                self.percentage_of_nodes_to_score
            )));
        }
        if self.parallelism == 0 {
            return Err(SchedulerError::Config("parallelism must be greater than 0".into()));
        }
        if self.pod_initial_backoff.is_zero() {
            return Err(SchedulerError::Config("podInitialBackoff must be greater than 0".into()));
        }
        if self.pod_max_backoff < self.pod_initial_backoff {
            return Err(SchedulerError::Config(
                "podMaxBackoff must be at least podInitialBackoff".into(),
            ));
        }
        if self.profiles.is_empty() {
            return Err(SchedulerError::Config("at least one profile is required".into()));
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(key: &str, val: &str) -> Option<T> {
    match val.parse() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!(key, value = val, "Ignoring unparsable environment variable");
            None
        }
    }
}
