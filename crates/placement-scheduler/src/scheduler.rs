//! The scheduling loop.
//!
//! [`Scheduler::schedule_one`] pops one pod and runs its scheduling cycle
//! (filter, score, assume, reserve, permit) on the calling task. The binding
//! cycle (wait on permit, pre-bind, bind, post-bind) runs on a spawned task,
//! so pods are popped at the rate of filtering and scoring rather than of
//! binding. Every failure after the assume step is rolled back: unreserve,
//! forget the pod in the cache, then requeue it.

use crate::cache::{Cache, Snapshot, SnapshotHandle};
use crate::client::ClientSet;
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::framework::{Code, CycleState, Framework, FrameworkHandle, Parallelizer, Registry};
use crate::generic::{status_error, GenericScheduler, ScheduleResult};
use crate::plugins::new_in_tree_registry;
use crate::profile;
use crate::queue::{PodNominator, QueuedPodInfo, SchedulingQueue};
use chrono::Utc;
use placement_core::{Pod, PodCondition, POD_SCHEDULED, REASON_SCHEDULER_ERROR, REASON_UNSCHEDULABLE};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Places pending pods on nodes.
pub struct Scheduler {
    cache: Arc<Cache>,
    queue: Arc<SchedulingQueue>,
    algorithm: GenericScheduler,
    profiles: profile::Map,
    client: Arc<dyn ClientSet>,
    synced: AtomicBool,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("algorithm", &self.algorithm)
            .field("profiles", &self.profiles)
            .finish_non_exhaustive()
    }
}

/// What the binding task needs from the scheduling cycle.
struct Assumed {
    framework: Arc<Framework>,
    state: CycleState,
    /// The queued pod as popped, requeued on failure.
    info: QueuedPodInfo,
    /// The pod with `spec.node_name` set.
    pod: Arc<Pod>,
    result: ScheduleResult,
    cycle: i64,
}

impl Scheduler {
    /// Build a scheduler with the in-tree plugins.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] if the configuration or a profile
    /// is invalid.
    pub fn new(config: &SchedulerConfig, client: Arc<dyn ClientSet>) -> Result<Self> {
        Self::with_registry(config, client, &new_in_tree_registry())
    }

    /// Build a scheduler whose profiles draw plugins from `registry`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] if the configuration or a profile
    /// is invalid.
    pub fn with_registry(config: &SchedulerConfig, client: Arc<dyn ClientSet>, registry: &Registry) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(Cache::new(config.assumed_pod_ttl, config.cache_cleanup_period));
        let snapshot = SnapshotHandle::new(Snapshot::new());
        let nominator = Arc::new(PodNominator::new());
        let parallelizer = Parallelizer::new(config.parallelism)?;

        let profiles = profile::Map::new(config, registry, || {
            FrameworkHandle::new(
                snapshot.clone(),
                Arc::clone(&client),
                Arc::clone(&nominator),
                parallelizer.clone(),
            )
        })?;
        let less = profiles
            .first()
            .map(|f| f.queue_sort_func())
            .ok_or_else(|| SchedulerError::Config("at least one profile is required".into()))?;
        let queue = Arc::new(SchedulingQueue::new(
            less,
            config.pod_initial_backoff,
            config.pod_max_backoff,
            nominator,
        ));
        let algorithm = GenericScheduler::new(Arc::clone(&cache), snapshot, config.percentage_of_nodes_to_score);

        Ok(Self {
            cache,
            queue,
            algorithm,
            profiles,
            client,
            synced: AtomicBool::new(false),
        })
    }

    /// The scheduler cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// The scheduling queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<SchedulingQueue> {
        &self.queue
    }

    /// The profiles.
    #[must_use]
    pub fn profiles(&self) -> &profile::Map {
        &self.profiles
    }

    /// Check whether the informers delivered their initial listing.
    #[must_use]
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub(crate) fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }

    /// Schedule pods until the queue is closed.
    pub async fn run(self: Arc<Self>) {
        let flush = self.queue.run();
        info!("Scheduling queue is ready for incoming pods");
        loop {
            match self.schedule_one().await {
                Ok(()) => {}
                Err(SchedulerError::QueueClosed) => break,
                Err(e) => error!(error = %e, "Scheduling cycle failed"),
            }
        }
        flush.abort();
        info!("Scheduling queue was closed");
    }

    /// Pop one pod and run its scheduling cycle. The binding cycle is left
    /// running in the background.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::QueueClosed`] once the queue is closed.
    /// Failures to schedule the pod are recorded, not returned.
    pub async fn schedule_one(self: &Arc<Self>) -> Result<()> {
        let info = self.queue.pop().await?;
        let cycle = self.queue.scheduling_cycle();
        let pod = Arc::clone(&info.pod);
        let Some(framework) = self.profiles.for_pod(&pod).cloned() else {
            error!(
                pod = %pod.full_name(),
                error = %SchedulerError::ProfileNotFound(profile::scheduler_name(&pod).to_string()),
                "Dropping pod"
            );
            self.queue.done(pod.uid());
            return Ok(());
        };
        if self.skip_pod_schedule(&pod) {
            self.queue.done(pod.uid());
            return Ok(());
        }
        debug!(pod = %pod.full_name(), attempts = info.attempts, cycle, "Attempting to schedule pod");

        let scheduled = {
            let this = Arc::clone(self);
            let framework = Arc::clone(&framework);
            let pod = Arc::clone(&pod);
            tokio::task::spawn_blocking(move || {
                let state = CycleState::new();
                let result = this.algorithm.schedule(&framework, &state, &pod);
                (state, result)
            })
            .await
        };
        let (state, result) = match scheduled {
            Ok(v) => v,
            Err(e) => {
                let err = SchedulerError::Plugin(format!("scheduling task failed: {e}"));
                error!(pod = %pod.full_name(), error = %err, "Error selecting node for pod");
                self.record_scheduling_failure(info, &err, REASON_SCHEDULER_ERROR, "", cycle)
                    .await;
                return Ok(());
            }
        };

        let result = match result {
            Ok(result) => result,
            Err(err) => {
                let nominated = self.handle_schedule_error(&framework, &state, &pod, &err);
                self.record_scheduling_failure(info, &err, REASON_UNSCHEDULABLE, &nominated, cycle)
                    .await;
                return Ok(());
            }
        };

        let mut assumed = (*pod).clone();
        assumed.spec.node_name.clone_from(&result.suggested_host);
        let assumed = Arc::new(assumed);
        if let Err(err) = self.assume(&assumed) {
            self.record_scheduling_failure(info, &err, REASON_SCHEDULER_ERROR, "", cycle)
                .await;
            return Ok(());
        }

        let host = result.suggested_host.as_str();
        let status = framework.run_reserve_plugins_reserve(&state, &assumed, host);
        if !status.is_success() {
            let err = status_error(&status);
            let ctx = Assumed { framework, state, info, pod: assumed, result, cycle };
            self.rollback(ctx, &err, REASON_SCHEDULER_ERROR).await;
            return Ok(());
        }

        let status = framework.run_permit_plugins(&state, &assumed, host);
        if status.code() != Code::Wait && !status.is_success() {
            let reason = if status.is_unschedulable() {
                REASON_UNSCHEDULABLE
            } else {
                REASON_SCHEDULER_ERROR
            };
            let err = status_error(&status);
            let ctx = Assumed { framework, state, info, pod: assumed, result, cycle };
            self.rollback(ctx, &err, reason).await;
            return Ok(());
        }

        let this = Arc::clone(self);
        let ctx = Assumed { framework, state, info, pod: assumed, result, cycle };
        tokio::spawn(async move { this.binding_cycle(ctx).await });
        Ok(())
    }

    /// Log a failed cycle and run the post-filter plugins on a fit error.
    /// Returns the node to nominate, empty for none.
    fn handle_schedule_error(&self, framework: &Framework, state: &CycleState, pod: &Pod, err: &SchedulerError) -> String {
        match err {
            SchedulerError::Fit(fit) => {
                info!(pod = %pod.full_name(), error = %err, "Unable to schedule pod; no fit; waiting");
                if !framework.has_post_filter_plugins() {
                    debug!("No PostFilter plugins are registered, so no preemption will be performed");
                    return String::new();
                }
                let (result, status) = framework.run_post_filter_plugins(state, pod, &fit.statuses);
                if status.code() == Code::Error {
                    error!(pod = %pod.full_name(), status = %status, "Running PostFilter plugins failed");
                } else {
                    info!(pod = %pod.full_name(), status = %status, "Ran PostFilter plugins");
                }
                match result {
                    Some(r) if status.is_success() => r.nominated_node_name,
                    _ => String::new(),
                }
            }
            SchedulerError::NoNodesAvailable => {
                info!(pod = %pod.full_name(), "Unable to schedule pod; no nodes are registered to the cluster; waiting");
                String::new()
            }
            _ => {
                error!(pod = %pod.full_name(), error = %err, "Error selecting node for pod");
                String::new()
            }
        }
    }

    fn skip_pod_schedule(&self, pod: &Pod) -> bool {
        if pod.is_terminating() {
            info!(pod = %pod.full_name(), "Skip scheduling deleting pod");
            return true;
        }
        self.skip_pod_update(pod)
    }

    fn assume(&self, assumed: &Pod) -> Result<()> {
        if let Err(e) = self.cache.assume_pod(assumed) {
            error!(pod = %assumed.full_name(), error = %e, "Scheduler cache AssumePod failed");
            return Err(e);
        }
        self.queue.nominator().delete_nominated_pod_if_exists(assumed);
        Ok(())
    }

    async fn binding_cycle(&self, ctx: Assumed) {
        let host = ctx.result.suggested_host.clone();

        let status = ctx.framework.wait_on_permit(&ctx.pod).await;
        if !status.is_success() {
            let reason = if status.is_unschedulable() {
                REASON_UNSCHEDULABLE
            } else {
                REASON_SCHEDULER_ERROR
            };
            let err = status_error(&status);
            self.rollback(ctx, &err, reason).await;
            return;
        }

        let status = ctx.framework.run_pre_bind_plugins(&ctx.state, &ctx.pod, &host).await;
        if !status.is_success() {
            let err = status_error(&status);
            self.rollback(ctx, &err, REASON_SCHEDULER_ERROR).await;
            return;
        }

        let status = ctx.framework.run_bind_plugins(&ctx.state, &ctx.pod, &host).await;
        if let Err(e) = self.cache.finish_binding(&ctx.pod) {
            error!(pod = %ctx.pod.full_name(), error = %e, "Scheduler cache FinishBinding failed");
        }
        if !status.is_success() {
            info!(pod = %ctx.pod.full_name(), node = %host, "Failed to bind pod");
            let err = SchedulerError::BindRejected(format!("bind status: {}, {}", status.code(), status.message()));
            self.rollback(ctx, &err, REASON_SCHEDULER_ERROR).await;
            return;
        }

        info!(
            pod = %ctx.pod.full_name(),
            node = %host,
            evaluated_nodes = ctx.result.evaluated_nodes,
            feasible_nodes = ctx.result.feasible_nodes,
            "Successfully bound pod to node"
        );
        ctx.framework.run_post_bind_plugins(&ctx.state, &ctx.pod, &host);
        self.queue.done(ctx.pod.uid());
    }

    async fn rollback(&self, ctx: Assumed, err: &SchedulerError, reason: &str) {
        let host = ctx.result.suggested_host.as_str();
        ctx.framework.run_reserve_plugins_unreserve(&ctx.state, &ctx.pod, host);
        if let Err(e) = self.cache.forget_pod(&ctx.pod) {
            error!(pod = %ctx.pod.full_name(), error = %e, "Scheduler cache ForgetPod failed");
        }
        self.record_scheduling_failure(ctx.info, err, reason, "", ctx.cycle)
            .await;
    }

    /// Requeue the pod, remember its nominated node, and write the
    /// `PodScheduled=False` condition when it changed.
    async fn record_scheduling_failure(
        &self,
        info: QueuedPodInfo,
        err: &SchedulerError,
        reason: &str,
        nominated_node: &str,
        cycle: i64,
    ) {
        let pod = Arc::clone(&info.pod);
        match self.queue.add_unschedulable_if_not_present(info, cycle) {
            Ok(()) => {}
            Err(e @ (SchedulerError::PodDeleted(_) | SchedulerError::PodAssigned { .. })) => {
                info!(pod = %pod.full_name(), reason = %e, "Not requeueing pod");
                return;
            }
            Err(e) => error!(pod = %pod.full_name(), error = %e, "Requeueing pod failed"),
        }
        self.queue
            .nominator()
            .add_nominated_pod(Arc::clone(&pod), nominated_node);

        let condition = PodCondition {
            type_: POD_SCHEDULED.to_string(),
            status: "False".to_string(),
            reason: reason.to_string(),
            message: err.to_string(),
            last_transition_time: Some(Utc::now()),
        };
        let unchanged = pod.condition(POD_SCHEDULED).is_some_and(|c| {
            c.status == condition.status && c.reason == condition.reason && c.message == condition.message
        });
        if unchanged && (nominated_node.is_empty() || pod.status.nominated_node_name == nominated_node) {
            return;
        }
        info!(
            pod = %pod.full_name(),
            condition = POD_SCHEDULED,
            status = "False",
            reason,
            "Updating pod condition"
        );
        if let Err(e) = self
            .client
            .update_pod_condition(&pod, &condition, nominated_node)
            .await
        {
            error!(pod = %pod.full_name(), error = %e, "Error updating pod condition");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::FakeClientSet;
    use crate::testing::{make_node, make_pod};
    use std::time::Duration;

    fn scheduler(client: &Arc<FakeClientSet>) -> Arc<Scheduler> {
        let config = SchedulerConfig {
            parallelism: 2,
            ..SchedulerConfig::default()
        };
        Arc::new(Scheduler::new(&config, Arc::clone(client) as Arc<dyn ClientSet>).unwrap())
    }

    async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn binds_pod_to_fitting_node() {
        let client = Arc::new(FakeClientSet::new());
        let sched = scheduler(&client);
        sched
            .cache()
            .add_node(&make_node("n1").capacity(&[("cpu", "2000m"), ("memory", "2Gi")]).obj());
        let pod = make_pod("p").req(&[("cpu", "500m"), ("memory", "500Mi")]).obj();
        sched.queue().add(Arc::new(pod.clone()));

        sched.schedule_one().await.unwrap();
        eventually("binding", || client.bound_node("p").is_some()).await;

        assert_eq!(client.bound_node("p").as_deref(), Some("n1"));
        assert!(sched.cache().is_assumed_pod(&pod).unwrap());
        let dump = sched.cache().dump();
        assert_eq!(dump.nodes["n1"].requested().milli_cpu, 500);
        assert!(sched.queue().pending_pods().is_empty());
    }

    #[tokio::test]
    async fn failed_bind_is_rolled_back() {
        let client = Arc::new(FakeClientSet::new());
        client.fail_binds_for("p");
        let sched = scheduler(&client);
        sched.cache().add_node(&make_node("n1").capacity(&[("cpu", "2000m")]).obj());
        let pod = make_pod("p").req(&[("cpu", "500m")]).obj();
        sched.queue().add(Arc::new(pod.clone()));

        sched.schedule_one().await.unwrap();
        eventually("condition update", || !client.condition_updates().is_empty()).await;

        assert_eq!(sched.cache().pod_count(), 0);
        assert!(sched.cache().is_assumed_pod(&pod).is_ok_and(|a| !a));
        assert_eq!(sched.cache().dump().nodes["n1"].requested().milli_cpu, 0);
        let updates = client.condition_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].condition.reason, REASON_SCHEDULER_ERROR);
        assert!(updates[0].condition.message.contains("Binding rejected"));
        // The queued copy is the pending pod, not the assumed one.
        assert!(sched.queue().pending_pods()[0].spec.node_name.is_empty());
    }

    #[tokio::test]
    async fn unschedulable_pod_records_condition() {
        let client = Arc::new(FakeClientSet::new());
        let sched = scheduler(&client);
        sched.cache().add_node(&make_node("n1").capacity(&[("cpu", "100m")]).obj());
        sched
            .queue()
            .add(Arc::new(make_pod("p").req(&[("cpu", "500m")]).obj()));

        sched.schedule_one().await.unwrap();

        assert_eq!(sched.queue().num_unschedulable_pods(), 1);
        let updates = client.condition_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].condition.type_, POD_SCHEDULED);
        assert_eq!(updates[0].condition.status, "False");
        assert_eq!(updates[0].condition.reason, REASON_UNSCHEDULABLE);
        assert_eq!(
            updates[0].condition.message,
            "0/1 nodes are available: 1 Insufficient cpu."
        );
        assert!(client.bindings().is_empty());
    }

    #[tokio::test]
    async fn no_nodes_requeues() {
        let client = Arc::new(FakeClientSet::new());
        let sched = scheduler(&client);
        sched.queue().add(Arc::new(make_pod("p").obj()));

        sched.schedule_one().await.unwrap();
        assert_eq!(sched.queue().pending_pods().len(), 1);
        assert_eq!(
            client.condition_updates()[0].condition.message,
            SchedulerError::NoNodesAvailable.to_string()
        );
    }

    #[tokio::test]
    async fn pod_deleted_mid_cycle_is_not_requeued() {
        let client = Arc::new(FakeClientSet::new());
        let sched = scheduler(&client);
        let pod = make_pod("p").obj();
        sched.queue().add(Arc::new(pod.clone()));
        let info = sched.queue().pop().await.unwrap();
        let cycle = sched.queue().scheduling_cycle();

        sched.handle_event(crate::informer::InformerEvent::PodDeleted(pod));
        sched
            .record_scheduling_failure(info, &SchedulerError::NoNodesAvailable, REASON_UNSCHEDULABLE, "n1", cycle)
            .await;

        assert!(sched.queue().pending_pods().is_empty());
        assert!(sched.queue().nominator().nominated_pods_for_node("n1").is_empty());
        assert!(client.condition_updates().is_empty());
    }

    #[tokio::test]
    async fn unknown_profile_and_terminating_pods_are_dropped() {
        let client = Arc::new(FakeClientSet::new());
        let sched = scheduler(&client);
        sched.cache().add_node(&make_node("n1").obj());
        sched
            .queue()
            .add(Arc::new(make_pod("other").scheduler_name("someone-else").obj()));
        sched.queue().add(Arc::new(make_pod("gone").terminating().obj()));

        sched.schedule_one().await.unwrap();
        sched.schedule_one().await.unwrap();

        assert!(sched.queue().pending_pods().is_empty());
        assert!(client.condition_updates().is_empty());
        assert!(client.bindings().is_empty());
    }

    #[tokio::test]
    async fn run_stops_when_queue_closes() {
        let client = Arc::new(FakeClientSet::new());
        let sched = scheduler(&client);
        sched.cache().add_node(&make_node("n1").capacity(&[("cpu", "1000m")]).obj());
        sched.queue().add(Arc::new(make_pod("a").obj()));
        sched.queue().add(Arc::new(make_pod("b").obj()));

        let handle = tokio::spawn(Arc::clone(&sched).run());
        eventually("both bindings", || client.bindings().len() == 2).await;
        sched.queue().close();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
