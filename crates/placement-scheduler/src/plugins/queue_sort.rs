//! Priority ordering of the active queue.

use crate::error::Result;
use crate::framework::{FrameworkHandle, Plugin, QueueSortPlugin};
use crate::queue::QueuedPodInfo;
use std::sync::Arc;

/// Registered name.
pub const NAME: &str = "PrioritySort";

/// Higher priority first, then the earlier enqueue time.
#[derive(Debug, Default)]
pub struct PrioritySort;

impl Plugin for PrioritySort {
    fn name(&self) -> &str {
        NAME
    }

    fn as_queue_sort(&self) -> Option<&dyn QueueSortPlugin> {
        Some(self)
    }
}

impl QueueSortPlugin for PrioritySort {
    fn less(&self, a: &QueuedPodInfo, b: &QueuedPodInfo) -> bool {
        let (p1, p2) = (a.pod.priority(), b.pod.priority());
        p1 > p2 || (p1 == p2 && a.timestamp < b.timestamp)
    }
}

/// Factory.
///
/// # Errors
///
/// Never fails.
pub fn new(_args: Option<&serde_json::Value>, _handle: &FrameworkHandle) -> Result<Arc<dyn Plugin>> {
    Ok(Arc::new(PrioritySort))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::make_pod;
    use std::time::Duration;
    use tokio::time::Instant;

    #[test]
    fn priority_then_timestamp() {
        let now = Instant::now();
        let later = now + Duration::from_secs(1);
        let high = QueuedPodInfo::new(Arc::new(make_pod("high").priority(10).obj()), later);
        let low_early = QueuedPodInfo::new(Arc::new(make_pod("a").obj()), now);
        let low_late = QueuedPodInfo::new(Arc::new(make_pod("b").obj()), later);

        assert!(PrioritySort.less(&high, &low_early));
        assert!(!PrioritySort.less(&low_early, &high));
        assert!(PrioritySort.less(&low_early, &low_late));
        assert!(!PrioritySort.less(&low_late, &low_early));
    }
}
