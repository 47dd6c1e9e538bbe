//! Inter-pod affinity and anti-affinity.
//!
//! Filtering enforces the incoming pod's required terms and the required
//! anti-affinity terms of pods already running. Scoring sums, per topology
//! domain, the weights of every preferred term that matches in either
//! direction, plus the required affinity terms of existing pods weighted by
//! `hardPodAffinityWeight`.

mod filtering;
mod scoring;

pub use filtering::{
    ERR_REASON_AFFINITY_NOT_MATCH, ERR_REASON_AFFINITY_RULES_NOT_MATCH,
    ERR_REASON_ANTI_AFFINITY_RULES_NOT_MATCH, ERR_REASON_EXISTING_ANTI_AFFINITY_RULES_NOT_MATCH,
};

use crate::error::{Result, SchedulerError};
use crate::framework::{
    decode_args, FilterPlugin, FrameworkHandle, Plugin, PreFilterPlugin, PreScorePlugin, ScorePlugin,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Registered name.
pub const NAME: &str = "InterPodAffinity";

/// Highest accepted `hardPodAffinityWeight`.
pub const MAX_HARD_POD_AFFINITY_WEIGHT: i32 = 100;

/// Args of [`InterPodAffinity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InterPodAffinityArgs {
    /// Score weight given to existing pods' required affinity terms that
    /// match the incoming pod.
    pub hard_pod_affinity_weight: i32,
}

impl Default for InterPodAffinityArgs {
    fn default() -> Self {
        Self {
            hard_pod_affinity_weight: 1,
        }
    }
}

impl InterPodAffinityArgs {
    /// Check the weight is within `[0, 100]`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] otherwise.
    pub fn validate(&self) -> Result<()> {
        if !(0..=MAX_HARD_POD_AFFINITY_WEIGHT).contains(&self.hard_pod_affinity_weight) {
            return Err(SchedulerError::Config(format!(
                "hardPodAffinityWeight: invalid value {}: not in valid range [0-{MAX_HARD_POD_AFFINITY_WEIGHT}]",
                self.hard_pod_affinity_weight
            )));
        }
        Ok(())
    }
}

/// The inter-pod affinity plugin.
#[derive(Debug)]
pub struct InterPodAffinity {
    args: InterPodAffinityArgs,
    handle: FrameworkHandle,
}

impl Plugin for InterPodAffinity {
    fn name(&self) -> &str {
        NAME
    }

    fn as_pre_filter(&self) -> Option<&dyn PreFilterPlugin> {
        Some(self)
    }

    fn as_filter(&self) -> Option<&dyn FilterPlugin> {
        Some(self)
    }

    fn as_pre_score(&self) -> Option<&dyn PreScorePlugin> {
        Some(self)
    }

    fn as_score(&self) -> Option<&dyn ScorePlugin> {
        Some(self)
    }
}

/// Factory.
///
/// # Errors
///
/// Returns [`SchedulerError::Config`] when the args do not decode or validate.
pub fn new(args: Option<&serde_json::Value>, handle: &FrameworkHandle) -> Result<Arc<dyn Plugin>> {
    let args: InterPodAffinityArgs = decode_args(NAME, args)?;
    args.validate()?;
    Ok(Arc::new(InterPodAffinity {
        args,
        handle: handle.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Snapshot;
    use crate::testing::test_handle;
    use serde_json::json;

    #[test]
    fn weight_out_of_range_is_rejected() {
        let handle = test_handle(Snapshot::new());
        assert!(new(None, &handle).is_ok());
        assert!(new(Some(&json!({"hardPodAffinityWeight": 100})), &handle).is_ok());
        assert!(matches!(
            new(Some(&json!({"hardPodAffinityWeight": 101})), &handle),
            Err(SchedulerError::Config(_))
        ));
        assert!(new(Some(&json!({"hardPodAffinityWeight": -1})), &handle).is_err());
    }
}
