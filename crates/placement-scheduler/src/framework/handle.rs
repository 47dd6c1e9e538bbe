//! What plugins can reach outside their own calls.

use super::parallelize::Parallelizer;
use super::waiting_pods::{WaitingPod, WaitingPodsMap};
use crate::cache::{Snapshot, SnapshotHandle};
use crate::client::ClientSet;
use crate::queue::PodNominator;
use placement_core::Uid;
use std::fmt;
use std::sync::Arc;

/// Shared services handed to plugin factories.
#[derive(Clone)]
pub struct FrameworkHandle {
    snapshot: SnapshotHandle,
    waiting_pods: Arc<WaitingPodsMap>,
    client: Arc<dyn ClientSet>,
    nominator: Arc<PodNominator>,
    parallelizer: Parallelizer,
}

impl fmt::Debug for FrameworkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameworkHandle")
            .field("waiting_pods", &self.waiting_pods.len())
            .field("parallelism", &self.parallelizer.parallelism())
            .finish_non_exhaustive()
    }
}

impl FrameworkHandle {
    /// Bundle the shared services. Every profile gets its own waiting-pods map.
    #[must_use]
    pub fn new(
        snapshot: SnapshotHandle,
        client: Arc<dyn ClientSet>,
        nominator: Arc<PodNominator>,
        parallelizer: Parallelizer,
    ) -> Self {
        Self {
            snapshot,
            waiting_pods: Arc::new(WaitingPodsMap::new()),
            client,
            nominator,
            parallelizer,
        }
    }

    /// The snapshot of the current cycle.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.current()
    }

    /// The snapshot handle itself.
    #[must_use]
    pub fn snapshot_handle(&self) -> &SnapshotHandle {
        &self.snapshot
    }

    /// The waiting-pods map.
    #[must_use]
    pub fn waiting_pods(&self) -> &Arc<WaitingPodsMap> {
        &self.waiting_pods
    }

    /// Call `f` for each waiting pod.
    pub fn iterate_over_waiting_pods(&self, f: impl FnMut(&Arc<WaitingPod>)) {
        self.waiting_pods.iterate(f);
    }

    /// Look up a waiting pod.
    #[must_use]
    pub fn get_waiting_pod(&self, uid: &Uid) -> Option<Arc<WaitingPod>> {
        self.waiting_pods.get(uid)
    }

    /// Reject a waiting pod, if there is one.
    pub fn reject_waiting_pod(&self, uid: &Uid) {
        if let Some(wp) = self.waiting_pods.get(uid) {
            wp.reject("removed");
        }
    }

    /// The API client.
    #[must_use]
    pub fn client_set(&self) -> &Arc<dyn ClientSet> {
        &self.client
    }

    /// The pod nominator.
    #[must_use]
    pub fn nominator(&self) -> &Arc<PodNominator> {
        &self.nominator
    }

    /// The worker pool.
    #[must_use]
    pub fn parallelizer(&self) -> &Parallelizer {
        &self.parallelizer
    }
}
