//! The plugin framework.
//!
//! A [`Framework`] is built per profile from a [`Registry`] of plugin
//! factories and the profile's plugin configuration. It runs the plugins at
//! each extension point and aggregates their [`Status`]es:
//!
//! ```text
//!  QueueSort ─ PreFilter ─ Filter* ─ PostFilter ─ PreScore ─ Score* ─ Normalize
//!                                                                      │
//!  PostBind ◀─ Bind ◀─ PreBind ◀─ WaitOnPermit ◀─ Permit ◀─ Reserve ◀──┘
//! ```
//!
//! Stages marked `*` fan out over nodes on the [`Parallelizer`].

mod cycle_state;
mod handle;
mod interface;
mod parallelize;
mod registry;
mod runtime;
mod status;
mod waiting_pods;

pub use cycle_state::{CycleState, StateData};
pub use handle::FrameworkHandle;
pub use interface::{
    BindPlugin, FilterPlugin, NodeScore, PermitPlugin, Plugin, PostBindPlugin, PostFilterPlugin,
    PostFilterResult, PreBindPlugin, PreFilterExtensions, PreFilterPlugin, PreScorePlugin,
    QueueSortPlugin, ReservePlugin, ScoreExtensions, ScorePlugin, MAX_NODE_SCORE, MAX_TOTAL_SCORE,
    MIN_NODE_SCORE,
};
pub use parallelize::{ErrorChannel, Parallelizer, DEFAULT_PARALLELISM};
pub use registry::{decode_args, PluginFactory, Registry};
pub use runtime::{Framework, PluginToNodeScores, MAX_PERMIT_TIMEOUT};
pub use status::{merge_statuses, Code, NodeToStatusMap, PluginToStatus, Status};
pub use waiting_pods::{WaitingPod, WaitingPodsMap};
