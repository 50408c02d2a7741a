//! HTTP API for the enrichment service.
//!
//! This module provides the REST API endpoints for:
//! - Health monitoring
//! - Job submission, status polling and live job events
//! - Queue statistics
//! - Normalized results per document

use axum::{Json, Router, extract::State, routing::get, routing::post};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

use crate::queue::QueueStats;
use crate::service::EnrichmentService;

pub mod jobs;
use jobs::{
    document_results_handler, enqueue_job_handler, job_events_handler, job_status_handler,
    queue_stats_handler,
};

/// Application state
pub struct AppState {
    pub service: Arc<EnrichmentService>,
    pub start_time: Instant,
}

/// Build the API router
pub fn router(service: Arc<EnrichmentService>) -> Router {
    let state = Arc::new(AppState {
        service,
        start_time: Instant::now(),
    });

    let api_routes = Router::new()
        .route("/jobs", post(enqueue_job_handler))
        .route("/jobs/events", get(job_events_handler))
        .route("/jobs/{id}", get(job_status_handler))
        .route("/queue/stats", get(queue_stats_handler))
        .route("/documents/{id}/results", get(document_results_handler));

    Router::new()
        .route("/health", get(health_handler))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// === Health ===

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    // A store failure degrades health instead of failing the request
    let queue = state.service.get_queue_stats().ok();

    Json(HealthResponse {
        status: if queue.is_some() { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        remote_configured: state.service.remote.is_some(),
        providers: state.service.capabilities.loaded_providers(),
        queue,
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    remote_configured: bool,
    /// Provider name to whether it has been loaded yet
    providers: BTreeMap<&'static str, bool>,
    queue: Option<QueueStats>,
}
