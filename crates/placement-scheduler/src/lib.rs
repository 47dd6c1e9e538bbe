//! Workload placement scheduler.
//!
//! This crate assigns pending pods to nodes. Pods wait in a priority
//! [`queue`]; each scheduling cycle filters and scores the nodes of a
//! [`cache`] snapshot through the plugins of a [`framework`] profile, then
//! binds the pod asynchronously through a [`ClientSet`].
//!
//! # Architecture
//!
//! ```text
//!   Informer ──events──▶ event handlers ──┬──▶ Cache ──snapshot──┐
//!                                         │                      ▼
//!                                         └──▶ Queue ──pop──▶ Scheduler
//!                                                                │
//!                                     Framework (per profile) ◀──┤ filter/score
//!                                                                │ assume/reserve/permit
//!                                                                ▼
//!                                                   binding task ──▶ ClientSet
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use placement_scheduler::{KubeClientSet, KubeInformer, Informer, Scheduler, SchedulerConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let config = SchedulerConfig::from_env()?;
//! let scheduler = Arc::new(Scheduler::new(&config, Arc::new(KubeClientSet::new(client.clone())))?);
//!
//! let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
//! let informer = KubeInformer::new(client);
//! tokio::spawn(async move { informer.run(tx).await });
//! tokio::spawn(Arc::clone(&scheduler).run_event_loop(rx));
//! tokio::spawn(Arc::clone(scheduler.cache()).run_cleanup());
//! scheduler.run().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Testing
//!
//! Enable the `test-utils` feature for the in-memory [`client::mock::FakeClientSet`]
//! and [`informer::mock::ChannelInformer`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
mod event_handlers;
pub mod framework;
pub mod generic;
pub mod informer;
pub mod k8s;
pub mod node_info;
pub mod plugins;
pub mod profile;
pub mod queue;
pub mod scheduler;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use cache::{Cache, Snapshot, SnapshotHandle};
pub use client::{Binding, ClientSet};
pub use config::{ProfileConfig, SchedulerConfig, DEFAULT_SCHEDULER_NAME};
pub use error::{Result, SchedulerError};
pub use framework::{Framework, Registry, Status};
pub use generic::{FitError, GenericScheduler, ScheduleResult};
pub use informer::{EventReceiver, EventSender, Informer, InformerEvent};
pub use k8s::{KubeClientSet, KubeInformer};
pub use node_info::NodeInfo;
pub use queue::{ClusterEvent, SchedulingQueue};
pub use scheduler::Scheduler;
