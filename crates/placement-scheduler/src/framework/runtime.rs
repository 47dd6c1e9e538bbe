//! The per-profile plugin runner.

use super::cycle_state::CycleState;
use super::handle::FrameworkHandle;
use super::interface::{
    NodeScore, Plugin, PostFilterResult, MAX_NODE_SCORE, MAX_TOTAL_SCORE, MIN_NODE_SCORE,
};
use super::parallelize::ErrorChannel;
use super::registry::Registry;
use super::status::{merge_statuses, Code, NodeToStatusMap, PluginToStatus, Status};
use super::waiting_pods::WaitingPod;
use crate::config::{PluginEntry, PluginSet, Plugins, ProfileConfig};
use crate::error::{Result, SchedulerError};
use crate::node_info::NodeInfo;
use crate::queue::{QueueLessFn, QueuedPodInfo};
use placement_core::{Pod, Uid};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Longest a permit plugin may hold a pod.
pub const MAX_PERMIT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Weighted scores per score plugin, in plugin order.
pub type PluginToNodeScores = Vec<(String, Vec<NodeScore>)>;

type PluginList = Vec<Arc<dyn Plugin>>;

/// Runs the enabled plugins of one profile at every extension point.
pub struct Framework {
    profile_name: String,
    handle: FrameworkHandle,
    weights: HashMap<String, i64>,
    run_all_filters: bool,
    queue_sort: PluginList,
    pre_filter: PluginList,
    filter: PluginList,
    post_filter: PluginList,
    pre_score: PluginList,
    score: PluginList,
    reserve: PluginList,
    permit: PluginList,
    pre_bind: PluginList,
    bind: PluginList,
    post_bind: PluginList,
}

impl fmt::Debug for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Framework")
            .field("profile_name", &self.profile_name)
            .field("plugins", &self.list_plugins())
            .finish_non_exhaustive()
    }
}

fn names(list: &PluginList) -> impl Iterator<Item = &str> + '_ {
    list.iter().map(|p| p.name())
}

impl Framework {
    /// Instantiate the plugins of `profile`. `plugins` is the profile's
    /// effective plugin configuration (provider defaults already merged).
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] when a plugin is unknown, lacks the
    /// capability of the extension point it is enabled at, is enabled twice at
    /// one point, has repeated args, or fails to build; when the score weights
    /// could overflow; and when the profile does not have exactly one queue
    /// sort plugin and at least one bind plugin.
    pub fn new(
        registry: &Registry,
        profile: &ProfileConfig,
        plugins: &Plugins,
        handle: FrameworkHandle,
        run_all_filters: bool,
    ) -> Result<Self> {
        let mut args: HashMap<&str, &serde_json::Value> = HashMap::new();
        for cfg in &profile.plugin_config {
            if args.insert(cfg.name.as_str(), &cfg.args).is_some() {
                return Err(SchedulerError::Config(format!(
                    "repeated config for plugin {}",
                    cfg.name
                )));
            }
        }

        let mut needed: BTreeMap<&str, i32> = BTreeMap::new();
        for (_, set) in plugins.extension_points() {
            for entry in &set.enabled {
                let weight = needed.entry(entry.name.as_str()).or_insert(0);
                *weight = (*weight).max(entry.weight);
            }
        }

        let mut instances: HashMap<String, Arc<dyn Plugin>> = HashMap::new();
        let mut weights = HashMap::new();
        for (&name, &weight) in &needed {
            let factory = registry.get(name).ok_or_else(|| {
                SchedulerError::Config(format!("plugin {name:?} does not exist"))
            })?;
            let plugin = factory(args.get(name).copied(), &handle).map_err(|e| {
                SchedulerError::Config(format!("error initializing plugin {name:?}: {e}"))
            })?;
            instances.insert(name.to_string(), plugin);
            if weight < 0 {
                return Err(SchedulerError::Config(format!(
                    "plugin {name:?} has negative weight {weight}"
                )));
            }
            weights.insert(name.to_string(), i64::from(weight.max(1)));
        }

        let build = |point: &str, set: &PluginSet, has: fn(&dyn Plugin) -> bool| -> Result<PluginList> {
            let mut seen = HashSet::new();
            let mut list = Vec::with_capacity(set.enabled.len());
            for PluginEntry { name, .. } in &set.enabled {
                let plugin = instances.get(name).ok_or_else(|| {
                    SchedulerError::Config(format!("{point} plugin {name:?} does not exist"))
                })?;
                if !has(plugin.as_ref()) {
                    return Err(SchedulerError::Config(format!(
                        "plugin {name:?} does not extend {point} plugin"
                    )));
                }
                if !seen.insert(name.as_str()) {
                    return Err(SchedulerError::Config(format!(
                        "plugin {name:?} already registered as {point} plugin"
                    )));
                }
                list.push(Arc::clone(plugin));
            }
            Ok(list)
        };

        let framework = Self {
            profile_name: profile.scheduler_name.clone(),
            queue_sort: build("QueueSort", &plugins.queue_sort, |p| p.as_queue_sort().is_some())?,
            pre_filter: build("PreFilter", &plugins.pre_filter, |p| p.as_pre_filter().is_some())?,
            filter: build("Filter", &plugins.filter, |p| p.as_filter().is_some())?,
            post_filter: build("PostFilter", &plugins.post_filter, |p| p.as_post_filter().is_some())?,
            pre_score: build("PreScore", &plugins.pre_score, |p| p.as_pre_score().is_some())?,
            score: build("Score", &plugins.score, |p| p.as_score().is_some())?,
            reserve: build("Reserve", &plugins.reserve, |p| p.as_reserve().is_some())?,
            permit: build("Permit", &plugins.permit, |p| p.as_permit().is_some())?,
            pre_bind: build("PreBind", &plugins.pre_bind, |p| p.as_pre_bind().is_some())?,
            bind: build("Bind", &plugins.bind, |p| p.as_bind().is_some())?,
            post_bind: build("PostBind", &plugins.post_bind, |p| p.as_post_bind().is_some())?,
            handle,
            weights,
            run_all_filters,
        };

        let mut total: i64 = 0;
        for name in names(&framework.score) {
            let weight = framework.weight(name);
            if weight * MAX_NODE_SCORE > MAX_TOTAL_SCORE - total {
                return Err(SchedulerError::Config(
                    "total score of Score plugins could overflow".into(),
                ));
            }
            total += weight * MAX_NODE_SCORE;
        }

        match framework.queue_sort.len() {
            0 => return Err(SchedulerError::Config("no queue sort plugin is enabled".into())),
            1 => {}
            _ => {
                return Err(SchedulerError::Config(
                    "only one queue sort plugin can be enabled".into(),
                ))
            }
        }
        if framework.bind.is_empty() {
            return Err(SchedulerError::Config("at least one bind plugin is needed".into()));
        }

        info!(
            profile = %framework.profile_name,
            filters = framework.filter.len(),
            scores = framework.score.len(),
            "Built scheduling framework"
        );
        Ok(framework)
    }

    /// Scheduler name of the profile.
    #[must_use]
    pub fn profile_name(&self) -> &str {
        &self.profile_name
    }

    /// Shared services.
    #[must_use]
    pub fn handle(&self) -> &FrameworkHandle {
        &self.handle
    }

    fn weight(&self, plugin: &str) -> i64 {
        self.weights.get(plugin).copied().unwrap_or(1)
    }

    /// Ordering of the active queue.
    #[must_use]
    pub fn queue_sort_func(&self) -> QueueLessFn {
        let plugin = self.queue_sort.first().cloned();
        Arc::new(move |a: &QueuedPodInfo, b: &QueuedPodInfo| {
            plugin
                .as_ref()
                .and_then(|p| p.as_queue_sort())
                .is_some_and(|q| q.less(a, b))
        })
    }

    /// Run pre-filter plugins until one fails.
    pub fn run_pre_filter_plugins(&self, state: &CycleState, pod: &Pod) -> Status {
        for plugin in &self.pre_filter {
            let Some(pf) = plugin.as_pre_filter() else { continue };
            let status = pf.pre_filter(state, pod);
            if status.is_success() {
                continue;
            }
            if status.is_unschedulable() {
                return status;
            }
            let msg = format!(
                "prefilter plugin {:?} failed for pod {:?}: {}",
                plugin.name(),
                pod.name(),
                status.message()
            );
            error!(profile = %self.profile_name, "{msg}");
            return Status::error(msg);
        }
        Status::success()
    }

    /// Tell every pre-filter extension that `pod_to_add` joined `node_info`.
    pub fn run_pre_filter_extension_add_pod(
        &self,
        state: &CycleState,
        pod: &Pod,
        pod_to_add: &Arc<Pod>,
        node_info: &NodeInfo,
    ) -> Status {
        for plugin in &self.pre_filter {
            let Some(ext) = plugin.as_pre_filter().and_then(|p| p.pre_filter_extensions()) else {
                continue;
            };
            let status = ext.add_pod(state, pod, pod_to_add, node_info);
            if !status.is_success() {
                let msg = format!(
                    "error while running AddPod for plugin {:?} while scheduling pod {:?}: {}",
                    plugin.name(),
                    pod.name(),
                    status.message()
                );
                error!("{msg}");
                return Status::error(msg);
            }
        }
        Status::success()
    }

    /// Tell every pre-filter extension that `pod_to_remove` left `node_info`.
    pub fn run_pre_filter_extension_remove_pod(
        &self,
        state: &CycleState,
        pod: &Pod,
        pod_to_remove: &Arc<Pod>,
        node_info: &NodeInfo,
    ) -> Status {
        for plugin in &self.pre_filter {
            let Some(ext) = plugin.as_pre_filter().and_then(|p| p.pre_filter_extensions()) else {
                continue;
            };
            let status = ext.remove_pod(state, pod, pod_to_remove, node_info);
            if !status.is_success() {
                let msg = format!(
                    "error while running RemovePod for plugin {:?} while scheduling pod {:?}: {}",
                    plugin.name(),
                    pod.name(),
                    status.message()
                );
                error!("{msg}");
                return Status::error(msg);
            }
        }
        Status::success()
    }

    /// Run the filters on one node. Stops at the first failure unless the
    /// framework runs all filters; an error status always stops.
    pub fn run_filter_plugins(&self, state: &CycleState, pod: &Pod, node_info: &NodeInfo) -> PluginToStatus {
        let mut statuses = PluginToStatus::new();
        for plugin in &self.filter {
            let Some(filter) = plugin.as_filter() else { continue };
            let status = filter.filter(state, pod, node_info);
            if status.is_success() {
                continue;
            }
            if !status.is_unschedulable() {
                let err = Status::error(format!(
                    "running {:?} filter plugin for pod {:?}: {}",
                    plugin.name(),
                    pod.name(),
                    status.message()
                ));
                return PluginToStatus::from([(plugin.name().to_string(), err)]);
            }
            statuses.insert(plugin.name().to_string(), status);
            if !self.run_all_filters {
                break;
            }
        }
        statuses
    }

    /// Run post-filter plugins until one succeeds.
    pub fn run_post_filter_plugins(
        &self,
        state: &CycleState,
        pod: &Pod,
        statuses: &NodeToStatusMap,
    ) -> (Option<PostFilterResult>, Status) {
        let mut failures = Vec::new();
        for plugin in &self.post_filter {
            let Some(pf) = plugin.as_post_filter() else { continue };
            let (result, status) = pf.post_filter(state, pod, statuses);
            if status.is_success() {
                return (result, status);
            }
            if !status.is_unschedulable() {
                return (None, Status::error(status.message()));
            }
            failures.push(status);
        }
        (None, merge_statuses(&failures))
    }

    /// Run pre-score plugins until one fails.
    pub fn run_pre_score_plugins(&self, state: &CycleState, pod: &Pod, nodes: &[Arc<NodeInfo>]) -> Status {
        for plugin in &self.pre_score {
            let Some(ps) = plugin.as_pre_score() else { continue };
            let status = ps.pre_score(state, pod, nodes);
            if !status.is_success() {
                let msg = format!(
                    "error while running {:?} prescore plugin for pod {:?}: {}",
                    plugin.name(),
                    pod.name(),
                    status.message()
                );
                error!("{msg}");
                return Status::error(msg);
            }
        }
        Status::success()
    }

    /// Score every node with every score plugin, normalize, validate the
    /// range and apply the weights.
    ///
    /// # Errors
    ///
    /// Returns an error status naming the first plugin that failed or
    /// produced an out-of-range score.
    pub fn run_score_plugins(
        &self,
        state: &CycleState,
        pod: &Pod,
        nodes: &[Arc<NodeInfo>],
    ) -> std::result::Result<PluginToNodeScores, Status> {
        let parallelizer = self.handle.parallelizer();
        let errors = ErrorChannel::new();

        let per_node = parallelizer.map(&errors, nodes.len(), |i| {
            let node = &nodes[i];
            let mut scores = Vec::with_capacity(self.score.len());
            for plugin in &self.score {
                let Some(sp) = plugin.as_score() else { continue };
                match sp.score(state, pod, node) {
                    Ok(s) => scores.push(s),
                    Err(status) => {
                        errors.send_error_with_cancel(Status::error(format!(
                            "plugin {:?}: {}",
                            plugin.name(),
                            status.message()
                        )));
                        return None;
                    }
                }
            }
            Some(scores)
        });
        if let Some(status) = errors.receive_error() {
            let msg = format!("error while running score plugin for pod {:?}: {}", pod.name(), status.message());
            error!("{msg}");
            return Err(Status::error(msg));
        }

        let mut result: PluginToNodeScores = self
            .score
            .iter()
            .enumerate()
            .map(|(k, plugin)| {
                let list = per_node
                    .iter()
                    .zip(nodes)
                    .map(|(scores, node)| NodeScore {
                        name: node.name().to_string(),
                        score: scores.as_ref().and_then(|s| s.get(k)).copied().unwrap_or(0),
                    })
                    .collect();
                (plugin.name().to_string(), list)
            })
            .collect();

        parallelizer.for_each_mut(&errors, &mut result, |k, (name, list)| {
            let Some(ext) = self.score[k].as_score().and_then(|s| s.score_extensions()) else {
                return;
            };
            let status = ext.normalize_score(state, pod, list);
            if !status.is_success() {
                errors.send_error_with_cancel(Status::error(format!(
                    "normalize score plugin {name:?} failed with error {}",
                    status.message()
                )));
            }
        });
        if let Some(status) = errors.receive_error() {
            let msg = format!(
                "error while running normalize score plugin for pod {:?}: {}",
                pod.name(),
                status.message()
            );
            error!("{msg}");
            return Err(Status::error(msg));
        }

        parallelizer.for_each_mut(&errors, &mut result, |_, (name, list)| {
            let weight = self.weight(name);
            for node_score in list.iter_mut() {
                if !(MIN_NODE_SCORE..=MAX_NODE_SCORE).contains(&node_score.score) {
                    errors.send_error_with_cancel(Status::error(format!(
                        "score plugin {name:?} returns an invalid score {}, it should in the range of [{MIN_NODE_SCORE}, {MAX_NODE_SCORE}] after normalizing",
                        node_score.score
                    )));
                    return;
                }
                node_score.score *= weight;
            }
        });
        if let Some(status) = errors.receive_error() {
            let msg = format!(
                "error while applying score weights for pod {:?}: {}",
                pod.name(),
                status.message()
            );
            error!("{msg}");
            return Err(Status::error(msg));
        }

        Ok(result)
    }

    /// Run reserve plugins until one fails.
    pub fn run_reserve_plugins_reserve(&self, state: &CycleState, pod: &Pod, node_name: &str) -> Status {
        for plugin in &self.reserve {
            let Some(r) = plugin.as_reserve() else { continue };
            let status = r.reserve(state, pod, node_name);
            if !status.is_success() {
                let msg = format!(
                    "error while running Reserve in {:?} reserve plugin for pod {:?}: {}",
                    plugin.name(),
                    pod.name(),
                    status.message()
                );
                error!("{msg}");
                return Status::error(msg);
            }
        }
        Status::success()
    }

    /// Unreserve in reverse registration order.
    pub fn run_reserve_plugins_unreserve(&self, state: &CycleState, pod: &Pod, node_name: &str) {
        for plugin in self.reserve.iter().rev() {
            if let Some(r) = plugin.as_reserve() {
                r.unreserve(state, pod, node_name);
            }
        }
    }

    /// Run permit plugins. If any asks to wait and none rejects, the pod is
    /// parked in the waiting-pods map and [`Code::Wait`] is returned.
    pub fn run_permit_plugins(&self, state: &CycleState, pod: &Arc<Pod>, node_name: &str) -> Status {
        let mut wait_times = HashMap::new();
        for plugin in &self.permit {
            let Some(p) = plugin.as_permit() else { continue };
            let (status, timeout) = p.permit(state, pod, node_name);
            if status.is_success() {
                continue;
            }
            if status.is_unschedulable() {
                let msg = format!(
                    "rejected pod {:?} by permit plugin {:?}: {}",
                    pod.name(),
                    plugin.name(),
                    status.message()
                );
                info!("{msg}");
                return Status::new(status.code(), msg);
            }
            if status.code() == Code::Wait {
                wait_times.insert(plugin.name().to_string(), timeout.min(MAX_PERMIT_TIMEOUT));
                continue;
            }
            let msg = format!(
                "error while running {:?} permit plugin for pod {:?}: {}",
                plugin.name(),
                pod.name(),
                status.message()
            );
            error!("{msg}");
            return Status::error(msg);
        }
        if wait_times.is_empty() {
            return Status::success();
        }
        self.handle
            .waiting_pods()
            .add(WaitingPod::new(Arc::clone(pod), wait_times));
        let msg = format!(
            "one or more plugins asked to wait and no plugin rejected pod {:?}",
            pod.name()
        );
        debug!("{msg}");
        Status::new(Code::Wait, msg)
    }

    /// Block until every permit plugin allowed the pod, or one rejected it.
    /// Returns success at once if the pod is not waiting.
    pub async fn wait_on_permit(&self, pod: &Pod) -> Status {
        let Some(wp) = self.handle.get_waiting_pod(pod.uid()) else {
            return Status::success();
        };
        debug!(pod = %pod.full_name(), "Pod waiting on permit");
        let status = wp.wait().await;
        self.handle.waiting_pods().remove(pod.uid());
        if status.is_success() {
            return status;
        }
        if status.is_unschedulable() {
            let msg = format!(
                "pod {:?} rejected while waiting on permit: {}",
                pod.name(),
                status.message()
            );
            info!("{msg}");
            return Status::new(status.code(), msg);
        }
        let msg = format!(
            "error received while waiting on permit for pod {:?}: {}",
            pod.name(),
            status.message()
        );
        error!("{msg}");
        Status::error(msg)
    }

    /// Run pre-bind plugins until one fails.
    pub async fn run_pre_bind_plugins(&self, state: &CycleState, pod: &Pod, node_name: &str) -> Status {
        for plugin in &self.pre_bind {
            let Some(pb) = plugin.as_pre_bind() else { continue };
            let status = pb.pre_bind(state, pod, node_name).await;
            if !status.is_success() {
                let msg = format!(
                    "error while running {:?} prebind plugin for pod {:?}: {}",
                    plugin.name(),
                    pod.name(),
                    status.message()
                );
                error!("{msg}");
                return Status::error(msg);
            }
        }
        Status::success()
    }

    /// Try bind plugins in order until one does not skip.
    pub async fn run_bind_plugins(&self, state: &CycleState, pod: &Pod, node_name: &str) -> Status {
        let mut status = Status::new(Code::Skip, "");
        for plugin in &self.bind {
            let Some(b) = plugin.as_bind() else { continue };
            status = b.bind(state, pod, node_name).await;
            if status.code() == Code::Skip {
                continue;
            }
            if !status.is_success() {
                let msg = format!(
                    "plugin {:?} failed to bind pod \"{}\": {}",
                    plugin.name(),
                    pod.full_name(),
                    status.message()
                );
                error!("{msg}");
                return Status::error(msg);
            }
            return status;
        }
        status
    }

    /// Notify post-bind plugins.
    pub fn run_post_bind_plugins(&self, state: &CycleState, pod: &Pod, node_name: &str) {
        for plugin in &self.post_bind {
            if let Some(pb) = plugin.as_post_bind() {
                pb.post_bind(state, pod, node_name);
            }
        }
    }

    /// Reject a waiting pod, if there is one.
    pub fn reject_waiting_pod(&self, uid: &Uid) {
        self.handle.reject_waiting_pod(uid);
    }

    /// Check for filter plugins.
    #[must_use]
    pub fn has_filter_plugins(&self) -> bool {
        !self.filter.is_empty()
    }

    /// Check for post-filter plugins.
    #[must_use]
    pub fn has_post_filter_plugins(&self) -> bool {
        !self.post_filter.is_empty()
    }

    /// Check for score plugins.
    #[must_use]
    pub fn has_score_plugins(&self) -> bool {
        !self.score.is_empty()
    }

    /// Enabled plugins per extension point; score entries carry their weight.
    #[must_use]
    pub fn list_plugins(&self) -> BTreeMap<&'static str, Vec<PluginEntry>> {
        let points: [(&'static str, &PluginList); 11] = [
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
        ];
        points
            .into_iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(point, list)| {
                let entries = names(list)
                    .map(|name| {
                        if point == "Score" {
                            PluginEntry::weighted(name, i32::try_from(self.weight(name)).unwrap_or(i32::MAX))
                        } else {
                            PluginEntry::new(name)
                        }
                    })
                    .collect();
                (point, entries)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Snapshot;
    use crate::framework::interface::{
        BindPlugin, FilterPlugin, PermitPlugin, QueueSortPlugin, ReservePlugin, ScoreExtensions,
        ScorePlugin,
    };
    use crate::framework::registry::PluginFactory;
    use crate::testing::{make_node, make_pod, test_handle};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default, Clone)]
    struct Fake {
        name: &'static str,
        queue_sort: bool,
        filter: Option<Status>,
        score: Option<i64>,
        normalize_to: Option<i64>,
        reserve: Option<Status>,
        permit: Option<(Status, Duration)>,
        bind: Option<Code>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Plugin for Fake {
        fn name(&self) -> &str {
            self.name
        }
        fn as_queue_sort(&self) -> Option<&dyn QueueSortPlugin> {
            self.queue_sort.then_some(self as &dyn QueueSortPlugin)
        }
        fn as_filter(&self) -> Option<&dyn FilterPlugin> {
            self.filter.as_ref().map(|_| self as &dyn FilterPlugin)
        }
        fn as_score(&self) -> Option<&dyn ScorePlugin> {
            self.score.map(|_| self as &dyn ScorePlugin)
        }
        fn as_reserve(&self) -> Option<&dyn ReservePlugin> {
            self.reserve.as_ref().map(|_| self as &dyn ReservePlugin)
        }
        fn as_permit(&self) -> Option<&dyn PermitPlugin> {
            self.permit.as_ref().map(|_| self as &dyn PermitPlugin)
        }
        fn as_bind(&self) -> Option<&dyn BindPlugin> {
            self.bind.map(|_| self as &dyn BindPlugin)
        }
    }

    impl QueueSortPlugin for Fake {
        fn less(&self, a: &QueuedPodInfo, b: &QueuedPodInfo) -> bool {
            a.pod.priority() > b.pod.priority()
        }
    }

    impl FilterPlugin for Fake {
        fn filter(&self, _: &CycleState, _: &Pod, _: &NodeInfo) -> Status {
            self.log.lock().push(format!("filter:{}", self.name));
            self.filter.clone().unwrap_or_default()
        }
    }

    impl ScorePlugin for Fake {
        fn score(&self, _: &CycleState, _: &Pod, node: &NodeInfo) -> std::result::Result<i64, Status> {
            let base = self.score.unwrap_or(0);
            Ok(if node.name() == "n1" { base } else { base / 2 })
        }
        fn score_extensions(&self) -> Option<&dyn ScoreExtensions> {
            self.normalize_to.map(|_| self as &dyn ScoreExtensions)
        }
    }

    impl ScoreExtensions for Fake {
        fn normalize_score(&self, _: &CycleState, _: &Pod, scores: &mut [NodeScore]) -> Status {
            let max = scores.iter().map(|s| s.score).max().unwrap_or(0).max(1);
            let target = self.normalize_to.unwrap_or(MAX_NODE_SCORE);
            for s in scores {
                s.score = s.score * target / max;
            }
            Status::success()
        }
    }

    impl ReservePlugin for Fake {
        fn reserve(&self, _: &CycleState, _: &Pod, _: &str) -> Status {
            self.log.lock().push(format!("reserve:{}", self.name));
            self.reserve.clone().unwrap_or_default()
        }
        fn unreserve(&self, _: &CycleState, _: &Pod, _: &str) {
            self.log.lock().push(format!("unreserve:{}", self.name));
        }
    }

    impl PermitPlugin for Fake {
        fn permit(&self, _: &CycleState, _: &Pod, _: &str) -> (Status, Duration) {
            self.permit.clone().unwrap_or_default()
        }
    }

    #[async_trait]
    impl BindPlugin for Fake {
        async fn bind(&self, _: &CycleState, _: &Pod, _: &str) -> Status {
            self.log.lock().push(format!("bind:{}", self.name));
            Status::new(self.bind.unwrap_or_default(), "")
        }
    }

    fn registry(plugins: &[Fake]) -> Registry {
        let mut r = Registry::new();
        for p in plugins {
            let p = p.clone();
            let name = p.name;
            let factory: PluginFactory = Arc::new(move |_, _| Ok(Arc::new(p.clone()) as Arc<dyn Plugin>));
            r.register(name, factory).unwrap();
        }
        r
    }

    fn base(log: &Arc<Mutex<Vec<String>>>) -> Vec<Fake> {
        vec![
            Fake {
                name: "Sort",
                queue_sort: true,
                ..Fake::default()
            },
            Fake {
                name: "Binder",
                bind: Some(Code::Success),
                log: Arc::clone(log),
                ..Fake::default()
            },
        ]
    }

    fn base_plugins() -> Plugins {
        Plugins {
            queue_sort: PluginSet::enable(&["Sort"]),
            bind: PluginSet::enable(&["Binder"]),
            ..Plugins::default()
        }
    }

    fn build(fakes: &[Fake], plugins: &Plugins, run_all: bool) -> Result<Framework> {
        let snapshot = Snapshot::from_objects(&[], &[make_node("n1").obj(), make_node("n2").obj()]);
        Framework::new(
            &registry(fakes),
            &ProfileConfig::default(),
            plugins,
            test_handle(snapshot),
            run_all,
        )
    }

    fn config_error(result: Result<Framework>) -> String {
        match result {
            Err(SchedulerError::Config(msg)) => msg,
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn construction_checks() {
        let log = Arc::default();
        let fakes = base(&log);

        let mut p = base_plugins();
        p.queue_sort = PluginSet::default();
        assert_eq!(config_error(build(&fakes, &p, false)), "no queue sort plugin is enabled");

        let mut p = base_plugins();
        p.bind = PluginSet::default();
        assert_eq!(config_error(build(&fakes, &p, false)), "at least one bind plugin is needed");

        let mut p = base_plugins();
        p.filter = PluginSet::enable(&["Sort"]);
        assert!(config_error(build(&fakes, &p, false)).contains("does not extend Filter plugin"));

        let mut p = base_plugins();
        p.bind = PluginSet::enable(&["Binder", "Binder"]);
        assert!(config_error(build(&fakes, &p, false)).contains("already registered"));

        let mut p = base_plugins();
        p.filter = PluginSet::enable(&["Missing"]);
        assert!(config_error(build(&fakes, &p, false)).contains("does not exist"));

        let framework = build(&fakes, &base_plugins(), false).unwrap();
        assert!(!framework.has_filter_plugins());
        assert_eq!(framework.list_plugins()["Bind"], [PluginEntry::new("Binder")]);
    }

    #[test]
    fn repeated_plugin_config_rejected() {
        let log = Arc::default();
        let profile = ProfileConfig {
            plugin_config: vec![
                crate::config::PluginConfig {
                    name: "Sort".into(),
                    args: serde_json::Value::Null,
                },
                crate::config::PluginConfig {
                    name: "Sort".into(),
                    args: serde_json::Value::Null,
                },
            ],
            ..ProfileConfig::default()
        };
        let handle = test_handle(Snapshot::new());
        let err = Framework::new(&registry(&base(&log)), &profile, &base_plugins(), handle, false)
            .unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: repeated config for plugin Sort");
    }

    #[test]
    fn filters_short_circuit_unless_run_all() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut fakes = base(&log);
        fakes.push(Fake {
            name: "A",
            filter: Some(Status::unschedulable("a says no")),
            log: Arc::clone(&log),
            ..Fake::default()
        });
        fakes.push(Fake {
            name: "B",
            filter: Some(Status::unresolvable("b says no")),
            log: Arc::clone(&log),
            ..Fake::default()
        });
        let mut plugins = base_plugins();
        plugins.filter = PluginSet::enable(&["A", "B"]);
        let pod = make_pod("p").obj();
        let node = NodeInfo::with_node(Arc::new(make_node("n1").obj()), []);

        let fw = build(&fakes, &plugins, false).unwrap();
        let statuses = fw.run_filter_plugins(&CycleState::new(), &pod, &node);
        assert_eq!(statuses.len(), 1);
        assert_eq!(*log.lock(), ["filter:A"]);

        log.lock().clear();
        let fw = build(&fakes, &plugins, true).unwrap();
        let statuses = fw.run_filter_plugins(&CycleState::new(), &pod, &node);
        assert_eq!(statuses.len(), 2);
        assert_eq!(merge_statuses(statuses.values()).code(), Code::UnschedulableAndUnresolvable);
    }

    #[test]
    fn filter_error_wins() {
        let log = Arc::default();
        let mut fakes = base(&log);
        fakes.push(Fake {
            name: "Broken",
            filter: Some(Status::error("boom")),
            ..Fake::default()
        });
        let mut plugins = base_plugins();
        plugins.filter = PluginSet::enable(&["Broken"]);
        let fw = build(&fakes, &plugins, true).unwrap();
        let node = NodeInfo::with_node(Arc::new(make_node("n1").obj()), []);
        let statuses = fw.run_filter_plugins(&CycleState::new(), &make_pod("p").obj(), &node);
        assert_eq!(statuses["Broken"].code(), Code::Error);
        assert!(statuses["Broken"].message().contains("boom"));
    }

    #[test]
    fn scores_are_normalized_then_weighted() {
        let log = Arc::default();
        let mut fakes = base(&log);
        fakes.push(Fake {
            name: "Raw",
            score: Some(40),
            ..Fake::default()
        });
        fakes.push(Fake {
            name: "Norm",
            score: Some(1000),
            normalize_to: Some(MAX_NODE_SCORE),
            ..Fake::default()
        });
        let mut plugins = base_plugins();
        plugins.score = PluginSet {
            enabled: vec![PluginEntry::weighted("Raw", 2), PluginEntry::new("Norm")],
            disabled: Vec::new(),
        };
        let fw = build(&fakes, &plugins, false).unwrap();
        let snapshot = fw.handle().snapshot();
        let nodes: Vec<_> = snapshot.list().cloned().collect();
        let scores = fw
            .run_score_plugins(&CycleState::new(), &make_pod("p").obj(), &nodes)
            .unwrap();
        let by_node = |k: usize| -> HashMap<String, i64> {
            scores[k].1.iter().map(|s| (s.name.clone(), s.score)).collect()
        };
        assert_eq!(scores[0].0, "Raw");
        assert_eq!(by_node(0)["n1"], 80);
        assert_eq!(by_node(0)["n2"], 40);
        assert_eq!(by_node(1)["n1"], 100);
        assert_eq!(by_node(1)["n2"], 50);
        assert_eq!(fw.list_plugins()["Score"][0].weight, 2);
    }

    #[test]
    fn out_of_range_score_is_an_error() {
        let log = Arc::default();
        let mut fakes = base(&log);
        fakes.push(Fake {
            name: "Wild",
            score: Some(500),
            ..Fake::default()
        });
        let mut plugins = base_plugins();
        plugins.score = PluginSet::enable(&["Wild"]);
        let fw = build(&fakes, &plugins, false).unwrap();
        let nodes: Vec<_> = fw.handle().snapshot().list().cloned().collect();
        let status = fw
            .run_score_plugins(&CycleState::new(), &make_pod("p").obj(), &nodes)
            .unwrap_err();
        assert!(status
            .message()
            .contains("score plugin \"Wild\" returns an invalid score 500"));
    }

    #[test]
    fn unreserve_runs_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut fakes = base(&log);
        for (name, status) in [("R1", Status::success()), ("R2", Status::error("full"))] {
            fakes.push(Fake {
                name,
                reserve: Some(status),
                log: Arc::clone(&log),
                ..Fake::default()
            });
        }
        let mut plugins = base_plugins();
        plugins.reserve = PluginSet::enable(&["R1", "R2"]);
        let fw = build(&fakes, &plugins, false).unwrap();
        let pod = make_pod("p").obj();
        let state = CycleState::new();
        let status = fw.run_reserve_plugins_reserve(&state, &pod, "n1");
        assert_eq!(status.code(), Code::Error);
        fw.run_reserve_plugins_unreserve(&state, &pod, "n1");
        assert_eq!(
            *log.lock(),
            ["reserve:R1", "reserve:R2", "unreserve:R2", "unreserve:R1"]
        );
    }

    #[tokio::test]
    async fn bind_skips_to_next_plugin() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut fakes = base(&log);
        fakes.push(Fake {
            name: "Picky",
            bind: Some(Code::Skip),
            log: Arc::clone(&log),
            ..Fake::default()
        });
        let mut plugins = base_plugins();
        plugins.bind = PluginSet::enable(&["Picky", "Binder"]);
        let fw = build(&fakes, &plugins, false).unwrap();
        let status = fw
            .run_bind_plugins(&CycleState::new(), &make_pod("p").obj(), "n1")
            .await;
        assert!(status.is_success());
        assert_eq!(*log.lock(), ["bind:Picky", "bind:Binder"]);
    }

    #[tokio::test(start_paused = true)]
    async fn permit_wait_is_released_by_allow() {
        let log = Arc::default();
        let mut fakes = base(&log);
        fakes.push(Fake {
            name: "Gate",
            permit: Some((Status::new(Code::Wait, ""), Duration::from_secs(3600))),
            ..Fake::default()
        });
        let mut plugins = base_plugins();
        plugins.permit = PluginSet::enable(&["Gate"]);
        let fw = build(&fakes, &plugins, false).unwrap();
        let pod = Arc::new(make_pod("p").obj());

        let status = fw.run_permit_plugins(&CycleState::new(), &pod, "n1");
        assert_eq!(status.code(), Code::Wait);
        let wp = fw.handle().get_waiting_pod(pod.uid()).unwrap();
        assert_eq!(wp.pending_plugins(), ["Gate"]);
        wp.allow("Gate");
        assert!(fw.wait_on_permit(&pod).await.is_success());
        assert!(fw.handle().waiting_pods().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn permit_wait_is_capped() {
        let log = Arc::default();
        let mut fakes = base(&log);
        fakes.push(Fake {
            name: "Slow",
            permit: Some((Status::new(Code::Wait, ""), Duration::from_secs(24 * 3600))),
            ..Fake::default()
        });
        let mut plugins = base_plugins();
        plugins.permit = PluginSet::enable(&["Slow"]);
        let fw = build(&fakes, &plugins, false).unwrap();
        let pod = Arc::new(make_pod("p").obj());
        fw.run_permit_plugins(&CycleState::new(), &pod, "n1");

        let started = tokio::time::Instant::now();
        let status = fw.wait_on_permit(&pod).await;
        assert!(status.is_unschedulable());
        assert!(started.elapsed() >= MAX_PERMIT_TIMEOUT);
    }

    #[test]
    fn queue_sort_func_uses_plugin() {
        let log = Arc::default();
        let fw = build(&base(&log), &base_plugins(), false).unwrap();
        let less = fw.queue_sort_func();
        let now = tokio::time::Instant::now();
        let high = QueuedPodInfo::new(Arc::new(make_pod("a").priority(5).obj()), now);
        let low = QueuedPodInfo::new(Arc::new(make_pod("b").obj()), now);
        assert!(less(&high, &low));
        assert!(!less(&low, &high));
    }
}
