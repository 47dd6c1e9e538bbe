//! Pods held back by permit plugins.

use super::status::Status;
use parking_lot::{Mutex, RwLock};
use placement_core::{Pod, Uid};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Debug)]
struct Pending {
    timers: HashMap<String, JoinHandle<()>>,
    signal: Option<oneshot::Sender<Status>>,
}

/// A pod waiting for one or more permit plugins to allow it.
///
/// Each plugin gets a timer that rejects the pod when it fires. The first
/// decision (all plugins allowed, or any rejection) is final.
#[derive(Debug)]
pub struct WaitingPod {
    pod: Arc<Pod>,
    pending: Mutex<Pending>,
    receiver: Mutex<Option<oneshot::Receiver<Status>>>,
}

impl WaitingPod {
    /// Start waiting on the given plugins. Must be called inside a tokio
    /// runtime.
    #[must_use]
    pub fn new(pod: Arc<Pod>, wait_times: HashMap<String, Duration>) -> Arc<Self> {
        let (tx, rx) = oneshot::channel();
        let wp = Arc::new(Self {
            pod,
            pending: Mutex::new(Pending {
                timers: HashMap::new(),
                signal: Some(tx),
            }),
            receiver: Mutex::new(Some(rx)),
        });
        let timers = wait_times
            .into_iter()
            .map(|(plugin, wait)| {
                let weak: Weak<Self> = Arc::downgrade(&wp);
                let name = plugin.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    if let Some(wp) = weak.upgrade() {
                        wp.reject(&format!(
                            "rejected due to timeout after waiting {wait:?} at plugin {name}"
                        ));
                    }
                });
                (plugin, timer)
            })
            .collect();
        wp.pending.lock().timers = timers;
        wp
    }

    /// The pod.
    #[must_use]
    pub fn pod(&self) -> &Arc<Pod> {
        &self.pod
    }

    /// Plugins that have not allowed the pod yet.
    #[must_use]
    pub fn pending_plugins(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pending.lock().timers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Record that `plugin` allows the pod. Signals success once no plugin is
    /// pending.
    pub fn allow(&self, plugin: &str) {
        let mut pending = self.pending.lock();
        if let Some(timer) = pending.timers.remove(plugin) {
            timer.abort();
        }
        if !pending.timers.is_empty() {
            return;
        }
        if let Some(signal) = pending.signal.take() {
            let _ = signal.send(Status::success());
        }
    }

    /// Reject the pod.
    pub fn reject(&self, msg: &str) {
        let mut pending = self.pending.lock();
        for timer in pending.timers.values() {
            timer.abort();
        }
        if let Some(signal) = pending.signal.take() {
            let _ = signal.send(Status::unschedulable(msg));
        }
    }

    /// Wait for the decision. Returns an error status if called twice.
    pub async fn wait(&self) -> Status {
        let receiver = self.receiver.lock().take();
        match receiver {
            Some(rx) => rx
                .await
                .unwrap_or_else(|_| Status::error("waiting pod was dropped")),
            None => Status::error("permit decision already consumed"),
        }
    }
}

/// Waiting pods by uid.
#[derive(Debug, Default)]
pub struct WaitingPodsMap {
    pods: RwLock<HashMap<Uid, Arc<WaitingPod>>>,
}

impl WaitingPodsMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a waiting pod.
    pub fn add(&self, wp: Arc<WaitingPod>) {
        self.pods.write().insert(wp.pod.uid().clone(), wp);
    }

    /// Stop tracking a pod.
    pub fn remove(&self, uid: &Uid) {
        self.pods.write().remove(uid);
    }

    /// Look up a pod.
    #[must_use]
    pub fn get(&self, uid: &Uid) -> Option<Arc<WaitingPod>> {
        self.pods.read().get(uid).cloned()
    }

    /// Call `f` for every waiting pod.
    pub fn iterate(&self, mut f: impl FnMut(&Arc<WaitingPod>)) {
        for wp in self.pods.read().values() {
            f(wp);
        }
    }

    /// Number of waiting pods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pods.read().len()
    }

    /// Check whether no pod is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pods.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::status::Code;
    use crate::testing::make_pod;

    fn waits(entries: &[(&str, u64)]) -> HashMap<String, Duration> {
        entries
            .iter()
            .map(|(n, s)| ((*n).to_string(), Duration::from_secs(*s)))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn allowed_by_every_plugin() {
        let wp = WaitingPod::new(Arc::new(make_pod("p").obj()), waits(&[("a", 60), ("b", 60)]));
        wp.allow("a");
        assert_eq!(wp.pending_plugins(), ["b"]);
        wp.allow("b");
        assert!(wp.wait().await.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_rejects() {
        let wp = WaitingPod::new(Arc::new(make_pod("p").obj()), waits(&[("gate", 5)]));
        let status = wp.wait().await;
        assert_eq!(status.code(), Code::Unschedulable);
        assert!(status.message().contains("at plugin gate"));
    }

    #[tokio::test(start_paused = true)]
    async fn reject_is_final() {
        let wp = WaitingPod::new(Arc::new(make_pod("p").obj()), waits(&[("a", 60)]));
        wp.reject("removed");
        wp.allow("a");
        let status = wp.wait().await;
        assert_eq!(status.code(), Code::Unschedulable);
        assert_eq!(status.message(), "removed");
    }

    #[tokio::test]
    async fn map_tracks_by_uid() {
        let map = WaitingPodsMap::new();
        let wp = WaitingPod::new(Arc::new(make_pod("p").obj()), waits(&[("a", 60)]));
        map.add(Arc::clone(&wp));
        assert!(map.get(&Uid::new("p")).is_some());
        let mut seen = 0;
        map.iterate(|_| seen += 1);
        assert_eq!(seen, 1);
        map.remove(&Uid::new("p"));
        assert!(map.is_empty());
    }
}
