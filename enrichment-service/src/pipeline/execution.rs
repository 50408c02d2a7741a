//! Backend selection for a claimed job.

use std::sync::Arc;
use tracing::info;

use super::remote::RemoteDelegate;
use crate::db::Backend;
use crate::error::ServiceResult;
use crate::queue::JobHandle;
use crate::service::EnrichmentService;

/// Where a job's pipeline will run
pub enum ExecutionPlan {
    Local,
    /// Remote was requested but cannot be used; runs locally
    LocalFallback { reason: String },
    Remote(Arc<RemoteDelegate>),
}

impl ExecutionPlan {
    pub fn select(backend: Backend, remote: Option<&Arc<RemoteDelegate>>) -> Self {
        match (backend, remote) {
            (Backend::Local, _) => ExecutionPlan::Local,
            (Backend::Remote, Some(delegate)) => ExecutionPlan::Remote(Arc::clone(delegate)),
            (Backend::Remote, None) => ExecutionPlan::LocalFallback {
                reason: "no remote endpoint configured".to_string(),
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExecutionPlan::Local => "local",
            ExecutionPlan::LocalFallback { .. } => "local_fallback",
            ExecutionPlan::Remote(_) => "remote",
        }
    }
}

impl EnrichmentService {
    /// Run a claimed job to a terminal state
    pub async fn execute(&self, handle: JobHandle) -> ServiceResult<()> {
        let plan = ExecutionPlan::select(handle.backend(), self.remote.as_ref());

        info!(
            job_id = %handle.id(),
            doc_id = %handle.document_id(),
            plan = plan.name(),
            "Executing job"
        );

        self.orchestrator.run(handle, &plan).await
    }
}
