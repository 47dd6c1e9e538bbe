//! Placement scheduler service.
//!
//! Watches pods and nodes on the cluster, schedules pending pods, and serves
//! a small HTTP surface:
//!
//! - `GET /health` - Health check
//! - `GET /ready` - Ready once the initial pod and node listing is applied
//! - `GET /debug/cache` - Summary of the scheduler cache

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use placement_scheduler::{
    Informer, KubeClientSet, KubeInformer, NodeInfo, Scheduler, SchedulerConfig,
};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    scheduler: Arc<Scheduler>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        service: "placement-scheduler",
    })
}

async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    if state.scheduler.has_synced() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "informers not synced")
    }
}

#[derive(Serialize)]
struct NodeSummary {
    name: String,
    pods: usize,
    requested_milli_cpu: i64,
    requested_memory: i64,
    allocatable_milli_cpu: i64,
    allocatable_memory: i64,
}

impl From<&NodeInfo> for NodeSummary {
    fn from(info: &NodeInfo) -> Self {
        Self {
            name: info.name().to_string(),
            pods: info.pods().len(),
            requested_milli_cpu: info.requested().milli_cpu,
            requested_memory: info.requested().memory,
            allocatable_milli_cpu: info.allocatable().milli_cpu,
            allocatable_memory: info.allocatable().memory,
        }
    }
}

#[derive(Serialize)]
struct CacheSummary {
    nodes: Vec<NodeSummary>,
    assumed_pods: Vec<String>,
    pending_pods: Vec<String>,
    unschedulable_pods: usize,
}

async fn debug_cache_handler(State(state): State<AppState>) -> impl IntoResponse {
    let dump = state.scheduler.cache().dump();
    let mut nodes: Vec<NodeSummary> = dump.nodes.values().map(NodeSummary::from).collect();
    nodes.sort_by(|a, b| a.name.cmp(&b.name));
    let mut assumed_pods: Vec<String> = dump
        .assumed_pods
        .iter()
        .map(|uid| uid.as_str().to_string())
        .collect();
    assumed_pods.sort();
    let queue = state.scheduler.queue();

    Json(CacheSummary {
        nodes,
        assumed_pods,
        pending_pods: queue.pending_pods().iter().map(|p| p.full_name()).collect(),
        unschedulable_pods: queue.num_unschedulable_pods(),
    })
}

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/debug/cache", get(debug_cache_handler))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,placement=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting placement scheduler");

    let config = SchedulerConfig::from_env()?;
    tracing::info!(
        profiles = config.profiles.len(),
        provider = ?config.algorithm_provider,
        parallelism = config.parallelism,
        percentage_of_nodes_to_score = config.percentage_of_nodes_to_score,
        "Loaded scheduler configuration"
    );

    let client = kube::Client::try_default().await?;
    tracing::info!("Connected to Kubernetes cluster");

    let scheduler = Arc::new(Scheduler::new(
        &config,
        Arc::new(KubeClientSet::new(client.clone())),
    )?);

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let informer = KubeInformer::new(client);
    tokio::spawn(async move {
        if let Err(e) = informer.run(tx).await {
            tracing::error!(error = %e, "Informer stopped");
        }
    });
    tokio::spawn(Arc::clone(&scheduler).run_event_loop(rx));
    tokio::spawn(Arc::clone(scheduler.cache()).run_cleanup());
    let scheduling = tokio::spawn(Arc::clone(&scheduler).run());

    let shutdown_scheduler = Arc::clone(&scheduler);
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutting down");
        shutdown_scheduler.queue().close();
    };

    let app = create_router(AppState {
        scheduler: Arc::clone(&scheduler),
    });
    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    scheduling.await?;
    Ok(())
}
