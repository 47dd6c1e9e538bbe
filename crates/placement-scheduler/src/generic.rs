//! One scheduling cycle: snapshot, filter, score, pick a host.

use crate::cache::{Cache, Snapshot, SnapshotHandle};
use crate::error::{Result, SchedulerError};
use crate::framework::{
    merge_statuses, Code, CycleState, ErrorChannel, Framework, NodeScore, NodeToStatusMap, Status,
};
use crate::node_info::NodeInfo;
use placement_core::Pod;
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Below this many nodes every node is evaluated.
pub const MIN_FEASIBLE_NODES_TO_FIND: usize = 100;

/// Floor of the adaptive percentage of nodes to evaluate.
pub const MIN_FEASIBLE_NODES_PERCENTAGE_TO_FIND: i64 = 5;

/// No node could host the pod.
#[derive(Debug, Clone)]
pub struct FitError {
    /// The pod that did not fit.
    pub pod: Arc<Pod>,
    /// Nodes in the snapshot.
    pub num_all_nodes: usize,
    /// Why each evaluated node was rejected.
    pub statuses: NodeToStatusMap,
}

impl FitError {
    /// Number of nodes rejected for each reason.
    #[must_use]
    pub fn histogram(&self) -> BTreeMap<&str, usize> {
        let mut reasons = BTreeMap::new();
        for status in self.statuses.values() {
            for reason in status.reasons() {
                *reasons.entry(reason.as_str()).or_insert(0) += 1;
            }
        }
        reasons
    }
}

impl fmt::Display for FitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut reasons: Vec<String> = self
            .histogram()
            .into_iter()
            .map(|(reason, count)| format!("{count} {reason}"))
            .collect();
        reasons.sort();
        write!(
            f,
            "0/{} nodes are available: {}.",
            self.num_all_nodes,
            reasons.join(", ")
        )
    }
}

/// Outcome of a successful cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleResult {
    /// The chosen node.
    pub suggested_host: String,
    /// Nodes run through the filters.
    pub evaluated_nodes: usize,
    /// Nodes that passed them.
    pub feasible_nodes: usize,
}

pub(crate) fn status_error(status: &Status) -> SchedulerError {
    status
        .as_error()
        .unwrap_or_else(|| SchedulerError::Plugin(status.message()))
}

/// Finds a node for a pod using a profile's plugins.
pub struct GenericScheduler {
    cache: Arc<Cache>,
    snapshot: SnapshotHandle,
    percentage_of_nodes_to_score: u32,
    next_start_node_index: AtomicUsize,
}

impl fmt::Debug for GenericScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericScheduler")
            .field("percentage_of_nodes_to_score", &self.percentage_of_nodes_to_score)
            .field(
                "next_start_node_index",
                &self.next_start_node_index.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl GenericScheduler {
    /// Schedule against `cache`, publishing each cycle's view into `snapshot`.
    /// The same handle must be given to the frameworks.
    #[must_use]
    pub fn new(cache: Arc<Cache>, snapshot: SnapshotHandle, percentage_of_nodes_to_score: u32) -> Self {
        Self {
            cache,
            snapshot,
            percentage_of_nodes_to_score,
            next_start_node_index: AtomicUsize::new(0),
        }
    }

    /// The cache this scheduler reads from.
    #[must_use]
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// Run one scheduling cycle for `pod`.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::NoNodesAvailable`] if the cluster has no nodes.
    /// - [`SchedulerError::Fit`] if no node passes the filters.
    /// - [`SchedulerError::SnapshotInconsistent`] or a plugin error otherwise.
    pub fn schedule(&self, framework: &Framework, state: &CycleState, pod: &Arc<Pod>) -> Result<ScheduleResult> {
        self.snapshot
            .update(|snapshot| self.cache.update_snapshot(snapshot))?;
        let snapshot = self.snapshot.current();
        trace!(pod = %pod.full_name(), generation = snapshot.generation(), "Snapshotting scheduler cache and node infos done");

        if snapshot.num_nodes() == 0 {
            return Err(SchedulerError::NoNodesAvailable);
        }

        let (feasible, statuses) = self.find_nodes_that_fit_pod(framework, state, pod, &snapshot)?;
        if feasible.is_empty() {
            return Err(FitError {
                pod: Arc::clone(pod),
                num_all_nodes: snapshot.num_nodes(),
                statuses,
            }
            .into());
        }

        if feasible.len() == 1 {
            return Ok(ScheduleResult {
                suggested_host: feasible[0].name().to_string(),
                evaluated_nodes: 1 + statuses.len(),
                feasible_nodes: 1,
            });
        }

        let scores = prioritize_nodes(framework, state, pod, &feasible)?;
        let host = select_host(&scores)?;
        Ok(ScheduleResult {
            suggested_host: host,
            evaluated_nodes: feasible.len() + statuses.len(),
            feasible_nodes: feasible.len(),
        })
    }

    /// How many feasible nodes to look for before the filters stop.
    #[must_use]
    pub fn num_feasible_nodes_to_find(&self, num_all_nodes: usize) -> usize {
        if num_all_nodes < MIN_FEASIBLE_NODES_TO_FIND || self.percentage_of_nodes_to_score >= 100 {
            return num_all_nodes;
        }
        let all = i64::try_from(num_all_nodes).unwrap_or(i64::MAX);
        let mut adaptive = i64::from(self.percentage_of_nodes_to_score);
        if adaptive <= 0 {
            adaptive = (50 - all / 125).max(MIN_FEASIBLE_NODES_PERCENTAGE_TO_FIND);
        }
        let n = usize::try_from(all.saturating_mul(adaptive) / 100).unwrap_or(num_all_nodes);
        n.max(MIN_FEASIBLE_NODES_TO_FIND)
    }

    fn find_nodes_that_fit_pod(
        &self,
        framework: &Framework,
        state: &CycleState,
        pod: &Pod,
        snapshot: &Snapshot,
    ) -> Result<(Vec<Arc<NodeInfo>>, NodeToStatusMap)> {
        let mut statuses = NodeToStatusMap::new();
        let status = framework.run_pre_filter_plugins(state, pod);
        if !status.is_success() {
            if !status.is_unschedulable() {
                return Err(status_error(&status));
            }
            for node in snapshot.list() {
                statuses.insert(node.name().to_string(), status.clone());
            }
            return Ok((Vec::new(), statuses));
        }

        let feasible = self.find_nodes_that_pass_filters(framework, state, pod, snapshot, &mut statuses)?;
        Ok((feasible, statuses))
    }

    fn find_nodes_that_pass_filters(
        &self,
        framework: &Framework,
        state: &CycleState,
        pod: &Pod,
        snapshot: &Snapshot,
        statuses: &mut NodeToStatusMap,
    ) -> Result<Vec<Arc<NodeInfo>>> {
        let all = snapshot.num_nodes();
        let to_find = self.num_feasible_nodes_to_find(all);

        if !framework.has_filter_plugins() {
            let feasible: Vec<_> = snapshot.list().take(to_find).cloned().collect();
            self.advance_start(feasible.len(), all);
            return Ok(feasible);
        }

        enum Outcome {
            Feasible(Arc<NodeInfo>),
            Rejected(String, Status),
        }

        let start = self.next_start_node_index.load(Ordering::Relaxed);
        let errors = ErrorChannel::new();
        let found = AtomicUsize::new(0);
        let outcomes = framework.handle().parallelizer().map(&errors, all, |i| {
            let node = snapshot.at((start + i) % all);
            let status = pod_passes_filters_on_node(framework, state, pod, node);
            if status.is_success() {
                if found.fetch_add(1, Ordering::AcqRel) >= to_find {
                    found.fetch_sub(1, Ordering::AcqRel);
                    errors.cancel();
                    return None;
                }
                return Some(Outcome::Feasible(Arc::clone(node)));
            }
            if status.code() == Code::Error {
                errors.send_error_with_cancel(status);
                return None;
            }
            Some(Outcome::Rejected(node.name().to_string(), status))
        });
        if let Some(status) = errors.receive_error() {
            return Err(status_error(&status));
        }

        let mut feasible = Vec::with_capacity(found.load(Ordering::Acquire));
        for outcome in outcomes.into_iter().flatten() {
            match outcome {
                Outcome::Feasible(node) => feasible.push(node),
                Outcome::Rejected(name, status) => {
                    statuses.insert(name, status);
                }
            }
        }
        self.advance_start(feasible.len() + statuses.len(), all);
        Ok(feasible)
    }

    fn advance_start(&self, processed: usize, all: usize) {
        if all == 0 {
            return;
        }
        let next = (self.next_start_node_index.load(Ordering::Relaxed) + processed) % all;
        self.next_start_node_index.store(next, Ordering::Relaxed);
    }
}

/// Run the filters on `node`. When higher-priority pods are nominated to
/// the node, the filters run once with them added and, if that passes, once
/// more without them; both runs must pass.
fn pod_passes_filters_on_node(
    framework: &Framework,
    state: &CycleState,
    pod: &Pod,
    node: &Arc<NodeInfo>,
) -> Status {
    let with_nominated = match add_nominated_pods(framework, pod, state, node) {
        Ok(v) => v,
        Err(status) => return status,
    };
    let status = match &with_nominated {
        Some((state, node)) => run_filters(framework, state, pod, node),
        None => run_filters(framework, state, pod, node),
    };
    if with_nominated.is_none() || !status.is_success() {
        return status;
    }
    run_filters(framework, state, pod, node)
}

fn run_filters(framework: &Framework, state: &CycleState, pod: &Pod, node: &NodeInfo) -> Status {
    let statuses = framework.run_filter_plugins(state, pod, node);
    merge_statuses(statuses.values())
}

/// Copies of the cycle state and node with every nominated pod of equal or
/// higher priority added, or `None` if there is none.
fn add_nominated_pods(
    framework: &Framework,
    pod: &Pod,
    state: &CycleState,
    node: &NodeInfo,
) -> std::result::Result<Option<(CycleState, NodeInfo)>, Status> {
    let nominated = framework.handle().nominator().nominated_pods_for_node(node.name());
    if nominated.is_empty() {
        return Ok(None);
    }
    let state_out = state.clone();
    let mut node_out = node.clone();
    let mut added = false;
    for p in nominated {
        if p.priority() < pod.priority() || p.uid() == pod.uid() {
            continue;
        }
        node_out.add_pod(Arc::clone(&p));
        let status = framework.run_pre_filter_extension_add_pod(&state_out, pod, &p, &node_out);
        if !status.is_success() {
            return Err(status);
        }
        added = true;
    }
    Ok(added.then_some((state_out, node_out)))
}

/// Total weighted score per node, in node order. Without score plugins every
/// node scores 1.
fn prioritize_nodes(
    framework: &Framework,
    state: &CycleState,
    pod: &Pod,
    nodes: &[Arc<NodeInfo>],
) -> Result<Vec<NodeScore>> {
    if !framework.has_score_plugins() {
        return Ok(nodes
            .iter()
            .map(|n| NodeScore {
                name: n.name().to_string(),
                score: 1,
            })
            .collect());
    }

    let status = framework.run_pre_score_plugins(state, pod, nodes);
    if !status.is_success() {
        return Err(status_error(&status));
    }
    let per_plugin = framework
        .run_score_plugins(state, pod, nodes)
        .map_err(|s| status_error(&s))?;

    let mut totals: Vec<NodeScore> = nodes
        .iter()
        .map(|n| NodeScore {
            name: n.name().to_string(),
            score: 0,
        })
        .collect();
    for (plugin, scores) in &per_plugin {
        for (total, s) in totals.iter_mut().zip(scores) {
            debug!(pod = %pod.full_name(), plugin, node = %s.name, score = s.score, "Plugin scored node");
            total.score += s.score;
        }
    }
    Ok(totals)
}

/// Pick a node with the highest score. Ties are broken uniformly at random:
/// the k-th tied node replaces the current pick with probability 1/k.
///
/// # Errors
///
/// Returns [`SchedulerError::Plugin`] when `scores` is empty.
pub fn select_host(scores: &[NodeScore]) -> Result<String> {
    let mut iter = scores.iter();
    let Some(first) = iter.next() else {
        return Err(SchedulerError::Plugin("empty priority list".into()));
    };
    let mut rng = rand::rng();
    let (mut selected, mut max, mut ties) = (&first.name, first.score, 1u32);
    for ns in iter {
        if ns.score > max {
            (selected, max, ties) = (&ns.name, ns.score, 1);
        } else if ns.score == max {
            ties += 1;
            if rng.random_range(0..ties) == 0 {
                selected = &ns.name;
            }
        }
    }
    Ok(selected.clone())
}
