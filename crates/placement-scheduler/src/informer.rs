//! The event stream the scheduler consumes.

use crate::error::Result;
use async_trait::async_trait;
use placement_core::{Node, Pod};
use tokio::sync::mpsc;

/// A change observed on the cluster.
#[derive(Debug, Clone, PartialEq)]
pub enum InformerEvent {
    /// A pod appeared.
    PodAdded(Pod),
    /// A pod changed.
    PodUpdated {
        /// Previous version.
        old: Pod,
        /// Current version.
        new: Pod,
    },
    /// A pod was deleted.
    PodDeleted(Pod),
    /// A node appeared.
    NodeAdded(Node),
    /// A node changed.
    NodeUpdated {
        /// Previous version.
        old: Node,
        /// Current version.
        new: Node,
    },
    /// A node was deleted.
    NodeDeleted(Node),
    /// The initial listing of every watched kind has been delivered.
    Synced,
}

/// Sender half of the event channel.
pub type EventSender = mpsc::UnboundedSender<InformerEvent>;

/// Receiver half of the event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<InformerEvent>;

/// A source of pod and node events.
#[async_trait]
pub trait Informer: Send + Sync {
    /// Push events into `events` until the source ends or the receiver is
    /// dropped.
    async fn run(&self, events: EventSender) -> Result<()>;

    /// Check whether the initial listing has been delivered.
    fn has_synced(&self) -> bool;
}

/// An informer fed by hand for testing.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Forwards events pushed through its sender.
    #[derive(Debug)]
    pub struct ChannelInformer {
        source: Mutex<Option<EventReceiver>>,
        synced: AtomicBool,
    }

    impl ChannelInformer {
        /// Create an informer and the sender that feeds it.
        #[must_use]
        pub fn new() -> (Self, EventSender) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Self {
                    source: Mutex::new(Some(rx)),
                    synced: AtomicBool::new(false),
                },
                tx,
            )
        }
    }

    #[async_trait]
    impl Informer for ChannelInformer {
        async fn run(&self, events: EventSender) -> Result<()> {
            let source = self.source.lock().take();
            let Some(mut source) = source else {
                return Ok(());
            };
            while let Some(event) = source.recv().await {
                if event == InformerEvent::Synced {
                    self.synced.store(true, Ordering::Release);
                }
                if events.send(event).is_err() {
                    break;
                }
            }
            Ok(())
        }

        fn has_synced(&self) -> bool {
            self.synced.load(Ordering::Acquire)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::ChannelInformer;
    use super::*;
    use crate::testing::make_node;

    #[tokio::test]
    async fn channel_informer_forwards_and_syncs() {
        let (informer, feed) = ChannelInformer::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        feed.send(InformerEvent::NodeAdded(make_node("n1").obj())).unwrap();
        feed.send(InformerEvent::Synced).unwrap();
        drop(feed);

        informer.run(tx).await.unwrap();
        assert!(informer.has_synced());
        assert!(matches!(rx.recv().await, Some(InformerEvent::NodeAdded(n)) if n.name() == "n1"));
        assert_eq!(rx.recv().await, Some(InformerEvent::Synced));
    }
}
