// src/api/mod.rs
//
// =============================================================================
// WHIRR: HTTP API SURFACE
// =============================================================================
//
// The worker/job/run HTTP route table, request tracing and permissive CORS,
// and the background lease-monitor task that runs alongside the server and
// is stopped through the same shutdown `watch` channel.

pub mod handlers;

use crate::storage::Storage;
use axum::routing::{get, post};
use axum::Router;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub data_dir: PathBuf,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/workers/register", post(handlers::register_worker))
        .route("/api/v1/workers/unregister", post(handlers::unregister_worker))
        .route("/api/v1/workers", get(handlers::list_workers))
        .route("/api/v1/jobs", post(handlers::create_job).get(handlers::list_jobs))
        .route("/api/v1/jobs/claim", post(handlers::claim_job))
        .route("/api/v1/jobs/{job_id}", get(handlers::get_job))
        .route("/api/v1/jobs/{job_id}/heartbeat", post(handlers::job_heartbeat))
        .route("/api/v1/jobs/{job_id}/complete", post(handlers::complete_job))
        .route("/api/v1/jobs/{job_id}/fail", post(handlers::fail_job))
        .route("/api/v1/jobs/{job_id}/cancel", post(handlers::cancel_job))
        .route("/api/v1/runs", get(handlers::list_runs))
        .route("/api/v1/runs/{run_id}", get(handlers::get_run))
        .route("/api/v1/runs/{run_id}/metrics", get(handlers::get_run_metrics))
        .route("/api/v1/runs/{run_id}/artifacts", get(handlers::list_run_artifacts))
        .route(
            "/api/v1/runs/{run_id}/artifacts/{*artifact_path}",
            get(handlers::get_run_artifact),
        )
        .route("/api/v1/status", get(handlers::get_status))
        .route("/health", get(handlers::health_check))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API on `addr` until `shutdown` reports `true`. The lease
/// monitor is spawned and aborted alongside the server's own lifecycle.
pub async fn serve(
    addr: std::net::SocketAddr,
    state: AppState,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let monitor_handle = tokio::spawn(crate::lease_monitor::run_lease_monitor(
        state.storage.clone(),
        crate::lease_monitor::DEFAULT_SWEEP_INTERVAL,
        shutdown.clone(),
    ));

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("whirr server listening on {addr}");

    let mut shutdown_for_serve = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_for_serve.wait_for(|v| *v).await;
        })
        .await?;

    monitor_handle.abort();
    Ok(())
}
