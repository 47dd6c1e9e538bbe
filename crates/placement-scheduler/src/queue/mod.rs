//! The scheduling queue.
//!
//! Pending pods live in exactly one of three sub-queues:
//!
//! - **activeQ**: a heap ordered by the profile's queue-sort function; `pop`
//!   takes from here.
//! - **backoffQ**: a heap ordered by backoff expiry; drained into activeQ by
//!   [`SchedulingQueue::flush_backoff_q_completed`].
//! - **unschedulableQ**: a map of pods that failed and wait for a cluster
//!   event, or for [`UNSCHEDULABLE_Q_TIME_INTERVAL`] to pass.
//!
//! Popped pods stay tracked as in flight until they are requeued or
//! [`SchedulingQueue::done`] is called, so updates and deletes that arrive
//! during their scheduling cycle are not lost.

mod events;
mod heap;
mod nominator;

pub use events::ClusterEvent;
pub use nominator::PodNominator;

use crate::error::{Result, SchedulerError};
use crate::node_info::PodInfo;
use heap::Heap;
use parking_lot::Mutex;
use placement_core::{Pod, Uid};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

/// Default backoff after the first failed attempt.
pub const DEFAULT_POD_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Default upper bound of the backoff.
pub const DEFAULT_POD_MAX_BACKOFF: Duration = Duration::from_secs(10);
/// How long a pod may stay in the unschedulable queue without an event.
pub const UNSCHEDULABLE_Q_TIME_INTERVAL: Duration = Duration::from_secs(60);
/// Period of the backoff flush.
pub const BACKOFF_FLUSH_PERIOD: Duration = Duration::from_secs(1);
/// Period of the unschedulable-leftover flush.
pub const UNSCHEDULABLE_FLUSH_PERIOD: Duration = Duration::from_secs(30);

/// A pod waiting in the queue, with its scheduling history.
#[derive(Debug, Clone)]
pub struct QueuedPodInfo {
    /// The pod.
    pub pod: Arc<Pod>,
    /// When the pod was last added to a sub-queue.
    pub timestamp: Instant,
    /// Number of times the pod was popped.
    pub attempts: u32,
    /// When the pod was first added.
    pub initial_attempt_timestamp: Instant,
}

impl QueuedPodInfo {
    /// Wrap a pod enqueued at `now`.
    #[must_use]
    pub fn new(pod: Arc<Pod>, now: Instant) -> Self {
        Self {
            pod,
            timestamp: now,
            attempts: 0,
            initial_attempt_timestamp: now,
        }
    }

    /// The same history for an updated copy of the pod.
    #[must_use]
    pub fn with_pod(&self, pod: Arc<Pod>) -> Self {
        Self { pod, ..self.clone() }
    }
}

/// Ordering of the active queue: `less(a, b)` pops `a` first.
pub type QueueLessFn = Arc<dyn Fn(&QueuedPodInfo, &QueuedPodInfo) -> bool + Send + Sync>;

/// Backoff for a pod after `attempts` failures:
/// `min(initial * 2^(attempts-1), max)`.
#[must_use]
pub fn backoff_duration(attempts: u32, initial: Duration, max: Duration) -> Duration {
    let mut duration = initial;
    for _ in 1..attempts {
        duration = duration.saturating_mul(2);
        if duration > max {
            return max;
        }
    }
    duration.min(max)
}

#[derive(Debug)]
struct Inner {
    active_q: Heap<QueuedPodInfo>,
    backoff_q: Heap<QueuedPodInfo>,
    unschedulable_q: HashMap<Uid, QueuedPodInfo>,
    /// Latest copy of each popped pod; `None` once it was deleted.
    in_flight: HashMap<Uid, Option<Arc<Pod>>>,
    scheduling_cycle: i64,
    move_request_cycle: i64,
    closed: bool,
}

/// Priority queue with backoff and unschedulable tiers.
pub struct SchedulingQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    nominator: Arc<PodNominator>,
    pod_initial_backoff: Duration,
    pod_max_backoff: Duration,
}

impl std::fmt::Debug for SchedulingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulingQueue")
            .field("inner", &self.inner)
            .field("pod_initial_backoff", &self.pod_initial_backoff)
            .field("pod_max_backoff", &self.pod_max_backoff)
            .finish_non_exhaustive()
    }
}

impl SchedulingQueue {
    /// Create a queue ordered by `less`.
    #[must_use]
    pub fn new(
        less: QueueLessFn,
        pod_initial_backoff: Duration,
        pod_max_backoff: Duration,
        nominator: Arc<PodNominator>,
    ) -> Self {
        let (initial, max) = (pod_initial_backoff, pod_max_backoff);
        let backoff_less = move |a: &QueuedPodInfo, b: &QueuedPodInfo| {
            a.timestamp + backoff_duration(a.attempts, initial, max)
                < b.timestamp + backoff_duration(b.attempts, initial, max)
        };
        Self {
            inner: Mutex::new(Inner {
                active_q: Heap::new(Box::new(move |a, b| less(a, b))),
                backoff_q: Heap::new(Box::new(backoff_less)),
                unschedulable_q: HashMap::new(),
                in_flight: HashMap::new(),
                scheduling_cycle: 0,
                move_request_cycle: -1,
                closed: false,
            }),
            notify: Notify::new(),
            nominator,
            pod_initial_backoff,
            pod_max_backoff,
        }
    }

    /// The nominator shared with the framework.
    #[must_use]
    pub fn nominator(&self) -> &Arc<PodNominator> {
        &self.nominator
    }

    fn backoff_expiry(&self, info: &QueuedPodInfo) -> Instant {
        info.timestamp + backoff_duration(info.attempts, self.pod_initial_backoff, self.pod_max_backoff)
    }

    fn is_backing_off(&self, info: &QueuedPodInfo, now: Instant) -> bool {
        self.backoff_expiry(info) > now
    }

    /// Add a new pending pod to activeQ, pulling it out of any other sub-queue.
    pub fn add(&self, pod: Arc<Pod>) {
        let key = pod.uid().clone();
        {
            let mut inner = self.inner.lock();
            if inner.unschedulable_q.remove(&key).is_some() {
                error!(pod = %pod.full_name(), "Pod is already in the unschedulable queue");
            }
            if inner.backoff_q.remove(&key).is_some() {
                error!(pod = %pod.full_name(), "Pod is already in the backoff queue");
            }
            inner
                .active_q
                .add_or_update(key, QueuedPodInfo::new(Arc::clone(&pod), Instant::now()));
            self.nominator.add_nominated_pod(pod, "");
        }
        self.notify.notify_waiters();
    }

    /// Put back a pod that failed the cycle it was popped in.
    ///
    /// Goes to backoffQ if a move request arrived since `pod_scheduling_cycle`
    /// (the failure may be stale), and to unschedulableQ otherwise.
    ///
    /// An in-flight pod is requeued with the latest copy seen while it was
    /// being scheduled.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::PodAlreadyQueued`] if the pod is already in a
    /// sub-queue, [`SchedulerError::PodDeleted`] if it was deleted during its
    /// cycle and [`SchedulerError::PodAssigned`] if it got bound meanwhile.
    pub fn add_unschedulable_if_not_present(
        &self,
        mut info: QueuedPodInfo,
        pod_scheduling_cycle: i64,
    ) -> Result<()> {
        let key = info.pod.uid().clone();
        let mut inner = self.inner.lock();
        match inner.in_flight.remove(&key) {
            Some(None) => {
                return Err(SchedulerError::PodDeleted(info.pod.full_name()));
            }
            Some(Some(latest)) => {
                if !latest.spec.node_name.is_empty() {
                    return Err(SchedulerError::PodAssigned {
                        pod: latest.full_name(),
                        node: latest.spec.node_name.clone(),
                    });
                }
                info.pod = latest;
            }
            None => {}
        }
        let queue = if inner.unschedulable_q.contains_key(&key) {
            Some("unschedulable")
        } else if inner.active_q.contains(&key) {
            Some("active")
        } else if inner.backoff_q.contains(&key) {
            Some("backoff")
        } else {
            None
        };
        if let Some(queue) = queue {
            return Err(SchedulerError::PodAlreadyQueued {
                pod: info.pod.full_name(),
                queue,
            });
        }

        info.timestamp = Instant::now();
        let pod = Arc::clone(&info.pod);
        if inner.move_request_cycle >= pod_scheduling_cycle {
            inner.backoff_q.add_or_update(key, info);
        } else {
            inner.unschedulable_q.insert(key, info);
        }
        self.nominator.add_nominated_pod(pod, "");
        Ok(())
    }

    /// Take the next pod, waiting while activeQ is empty.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::QueueClosed`] once the queue is closed and
    /// activeQ is empty.
    pub async fn pop(&self) -> Result<QueuedPodInfo> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock();
                if let Some(mut info) = inner.active_q.pop() {
                    info.attempts += 1;
                    inner.scheduling_cycle += 1;
                    inner
                        .in_flight
                        .insert(info.pod.uid().clone(), Some(Arc::clone(&info.pod)));
                    return Ok(info);
                }
                if inner.closed {
                    return Err(SchedulerError::QueueClosed);
                }
            }
            notified.await;
        }
    }

    /// Apply an update of a pending pod.
    pub fn update(&self, old: Option<&Pod>, new: Arc<Pod>) {
        let key = new.uid().clone();
        let mut inner = self.inner.lock();
        if let Some(latest) = inner.in_flight.get_mut(&key) {
            if latest.is_some() {
                *latest = Some(Arc::clone(&new));
            }
        }
        if let Some(old) = old {
            if let Some(info) = inner.active_q.get(&key).map(|i| i.with_pod(Arc::clone(&new))) {
                self.nominator.update_nominated_pod(old, Arc::clone(&new));
                inner.active_q.add_or_update(key, info);
                return;
            }
            if let Some(info) = inner.backoff_q.get(&key).map(|i| i.with_pod(Arc::clone(&new))) {
                self.nominator.update_nominated_pod(old, Arc::clone(&new));
                inner.backoff_q.add_or_update(key, info);
                return;
            }
        }

        if let Some(existing) = inner.unschedulable_q.get(&key) {
            let updated = existing.with_pod(Arc::clone(&new));
            let old_pod = old.map_or_else(|| Arc::clone(&existing.pod), |p| Arc::new(p.clone()));
            self.nominator.update_nominated_pod(&old_pod, Arc::clone(&new));
            if is_pod_updated(&old_pod, &new) {
                inner.unschedulable_q.remove(&key);
                inner.active_q.add_or_update(key, updated);
                drop(inner);
                self.notify.notify_waiters();
            } else {
                inner.unschedulable_q.insert(key, updated);
            }
            return;
        }

        inner
            .active_q
            .add_or_update(key, QueuedPodInfo::new(Arc::clone(&new), Instant::now()));
        self.nominator.add_nominated_pod(new, "");
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Remove a pod from whichever sub-queue holds it.
    pub fn delete(&self, pod: &Pod) {
        let mut inner = self.inner.lock();
        self.nominator.delete_nominated_pod_if_exists(pod);
        let key = pod.uid();
        if let Some(latest) = inner.in_flight.get_mut(key) {
            *latest = None;
        }
        if inner.active_q.remove(key).is_none() {
            inner.backoff_q.remove(key);
            inner.unschedulable_q.remove(key);
        }
    }

    /// Stop tracking a popped pod that will not be requeued.
    pub fn done(&self, uid: &Uid) {
        self.inner.lock().in_flight.remove(uid);
    }

    /// A pod was bound: wake unschedulable pods whose affinity it may satisfy.
    pub fn assigned_pod_added(&self, pod: &Pod) {
        let mut inner = self.inner.lock();
        let matching = Self::unschedulable_pods_with_matching_affinity(&inner, pod);
        self.move_pods(&mut inner, matching, ClusterEvent::AssignedPodAdd);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// A bound pod changed: wake unschedulable pods whose affinity it may satisfy.
    pub fn assigned_pod_updated(&self, pod: &Pod) {
        let mut inner = self.inner.lock();
        let matching = Self::unschedulable_pods_with_matching_affinity(&inner, pod);
        self.move_pods(&mut inner, matching, ClusterEvent::AssignedPodUpdate);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Move every unschedulable pod to activeQ, or to backoffQ if it is still
    /// backing off, and remember the cycle the move happened in.
    pub fn move_all_to_active_or_backoff_queue(&self, event: ClusterEvent) {
        let mut inner = self.inner.lock();
        let all: Vec<QueuedPodInfo> = inner.unschedulable_q.values().cloned().collect();
        self.move_pods(&mut inner, all, event);
        drop(inner);
        self.notify.notify_waiters();
    }

    fn move_pods(&self, inner: &mut Inner, pods: Vec<QueuedPodInfo>, event: ClusterEvent) {
        let now = Instant::now();
        let moved = pods.len();
        for info in pods {
            let key = info.pod.uid().clone();
            inner.unschedulable_q.remove(&key);
            if self.is_backing_off(&info, now) {
                inner.backoff_q.add_or_update(key, info);
            } else {
                inner.active_q.add_or_update(key, info);
            }
        }
        inner.move_request_cycle = inner.scheduling_cycle;
        if moved > 0 {
            debug!(event = %event, pods = moved, "Moved unschedulable pods");
        }
    }

    fn unschedulable_pods_with_matching_affinity(inner: &Inner, pod: &Pod) -> Vec<QueuedPodInfo> {
        inner
            .unschedulable_q
            .values()
            .filter(|info| {
                PodInfo::new(Arc::clone(&info.pod))
                    .required_affinity_terms
                    .iter()
                    .any(|term| term.matches(pod))
            })
            .cloned()
            .collect()
    }

    /// Move pods whose backoff expired from backoffQ to activeQ.
    pub fn flush_backoff_q_completed(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let mut moved = false;
        while let Some(info) = inner.backoff_q.peek() {
            if self.is_backing_off(info, now) {
                break;
            }
            let Some(info) = inner.backoff_q.pop() else {
                break;
            };
            let key = info.pod.uid().clone();
            inner.active_q.add_or_update(key, info);
            moved = true;
        }
        drop(inner);
        if moved {
            self.notify.notify_waiters();
        }
    }

    /// Move pods that have been unschedulable for longer than
    /// [`UNSCHEDULABLE_Q_TIME_INTERVAL`].
    pub fn flush_unschedulable_q_leftover(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let stale: Vec<QueuedPodInfo> = inner
            .unschedulable_q
            .values()
            .filter(|info| now.duration_since(info.timestamp) > UNSCHEDULABLE_Q_TIME_INTERVAL)
            .cloned()
            .collect();
        if stale.is_empty() {
            return;
        }
        self.move_pods(&mut inner, stale, ClusterEvent::UnschedulableTimeout);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Spawn the two flush loops. They stop once the queue is closed.
    pub fn run(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff = tokio::time::interval(BACKOFF_FLUSH_PERIOD);
            let mut leftover = tokio::time::interval(UNSCHEDULABLE_FLUSH_PERIOD);
            loop {
                tokio::select! {
                    _ = backoff.tick() => queue.flush_backoff_q_completed(),
                    _ = leftover.tick() => queue.flush_unschedulable_q_leftover(),
                }
                if queue.inner.lock().closed {
                    break;
                }
            }
        })
    }

    /// Close the queue, waking every waiter in `pop`.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Every pod in any sub-queue.
    #[must_use]
    pub fn pending_pods(&self) -> Vec<Arc<Pod>> {
        let inner = self.inner.lock();
        inner
            .active_q
            .iter()
            .chain(inner.backoff_q.iter())
            .chain(inner.unschedulable_q.values())
            .map(|info| Arc::clone(&info.pod))
            .collect()
    }

    /// Number of pods in unschedulableQ.
    #[must_use]
    pub fn num_unschedulable_pods(&self) -> usize {
        self.inner.lock().unschedulable_q.len()
    }

    /// Number of pods popped so far.
    #[must_use]
    pub fn scheduling_cycle(&self) -> i64 {
        self.inner.lock().scheduling_cycle
    }

    #[cfg(test)]
    fn location(&self, uid: &str) -> Vec<&'static str> {
        let inner = self.inner.lock();
        let key = Uid::new(uid);
        let mut found = Vec::new();
        if inner.active_q.contains(&key) {
            found.push("active");
        }
        if inner.backoff_q.contains(&key) {
            found.push("backoff");
        }
        if inner.unschedulable_q.contains_key(&key) {
            found.push("unschedulable");
        }
        found
    }
}

/// Check whether an update changed anything besides status and versions.
fn is_pod_updated(old: &Pod, new: &Pod) -> bool {
    let strip = |pod: &Pod| {
        let mut p = pod.clone();
        p.metadata.resource_version.clear();
        p.metadata.generation = 0;
        p.status = placement_core::PodStatus::default();
        p
    };
    strip(old) != strip(new)
}
