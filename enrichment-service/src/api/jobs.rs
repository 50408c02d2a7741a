//! Job queue endpoints.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{self, Stream};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::db::{Backend, NormalizedResult};
use crate::error::{ServiceError, ServiceResult};
use crate::queue::{EnqueueReceipt, JobSnapshot, QueueStats};

use super::AppState;

/// Request to queue a document for enrichment
#[derive(Deserialize)]
pub struct EnqueueRequest {
    pub document_id: String,
    /// Defaults to `queue.default_backend`
    pub backend: Option<Backend>,
}

/// Queue a document
pub async fn enqueue_job_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EnqueueRequest>,
) -> ServiceResult<(StatusCode, Json<EnqueueReceipt>)> {
    let document_id = request.document_id.trim();
    if document_id.is_empty() {
        return Err(ServiceError::InvalidRequest {
            message: "document_id must not be empty".to_string(),
        });
    }

    let receipt = state.service.enqueue(document_id, request.backend)?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

/// Poll a job. Unknown ids answer 200 with status `not_found`.
pub async fn job_status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<JobSnapshot> {
    Json(state.service.get_job_status(&id))
}

/// Stream progress, finish and failure events for all jobs as server-sent events
pub async fn job_events_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.service.queue.subscribe();

    let events = stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(job_event) => match Event::default().json_data(&job_event) {
                    Ok(event) => return Some((Ok(event), receiver)),
                    Err(e) => warn!(error = %e, "Failed to encode job event"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Job event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}

pub async fn queue_stats_handler(
    State(state): State<Arc<AppState>>,
) -> ServiceResult<Json<QueueStats>> {
    Ok(Json(state.service.get_queue_stats()?))
}

/// All normalized results produced for a document
pub async fn document_results_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ServiceResult<Json<Vec<NormalizedResult>>> {
    Ok(Json(state.service.results_for_document(&id)?))
}
