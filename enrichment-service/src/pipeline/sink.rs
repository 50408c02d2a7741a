//! Result persistence.

use serde_json::json;
use tracing::info;

use crate::db::NormalizedResult;
use crate::error::{PipelineError, ServiceResult};
use crate::queue::JobHandle;

/// Write a result and finish the job atomically.
///
/// The result row, the document's `processed` status and the job's
/// `finished` transition commit together or not at all. A job that is no
/// longer `started` fails with `JobNotActive` and nothing is written.
pub fn persist(handle: &JobHandle, result: &NormalizedResult) -> ServiceResult<()> {
    let payload = json!({
        "normalized_result_id": result.id,
        "document_id": result.document_id,
        "modality": result.modality,
        "tags": result.tags,
        "processing_time": result.processing_duration,
    });

    let finished = handle
        .database()
        .persist_result(result, &payload)
        .map_err(|e| PipelineError::Persistence {
            document_id: result.document_id.clone(),
            source: e,
        })?;

    if !finished {
        return Err(PipelineError::JobNotActive {
            job_id: handle.id().to_string(),
        }
        .into());
    }

    info!(
        job_id = %handle.id(),
        doc_id = %result.document_id,
        result_id = %result.id,
        modality = %result.modality,
        "Result persisted"
    );

    Ok(())
}
