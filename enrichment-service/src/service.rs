mod documents;

pub use documents::compute_content_hash;

use std::sync::Arc;
use tracing::{info, warn};

use crate::capabilities::CapabilityRegistry;
use crate::config::AppConfig;
use crate::db::{Backend, Database};
use crate::error::ServiceResult;
use crate::pipeline::{Orchestrator, RemoteDelegate};
use crate::queue::{EnqueueReceipt, JobQueue, JobSnapshot, QueueStats};

/// Main service coordinator
pub struct EnrichmentService {
    pub config: AppConfig,
    pub db: Arc<Database>,
    pub queue: Arc<JobQueue>,
    pub capabilities: Arc<CapabilityRegistry>,
    /// Remote compute client, present when an endpoint is configured
    pub remote: Option<Arc<RemoteDelegate>>,
    pub(crate) orchestrator: Orchestrator,
}

impl EnrichmentService {
    /// Create a service with the default capability providers
    pub fn new(config: AppConfig, db: Arc<Database>) -> ServiceResult<Self> {
        let capabilities = Arc::new(CapabilityRegistry::from_config(&config)?);
        Self::with_capabilities(config, db, capabilities)
    }

    /// Create a service with a caller-supplied capability registry
    pub fn with_capabilities(
        config: AppConfig,
        db: Arc<Database>,
        capabilities: Arc<CapabilityRegistry>,
    ) -> ServiceResult<Self> {
        info!("Initializing enrichment service");

        let queue = Arc::new(JobQueue::new(Arc::clone(&db), config.queue.clone()));

        let remote = RemoteDelegate::from_config(&config.remote)?.map(Arc::new);
        match &remote {
            Some(delegate) => info!(endpoint = %delegate.endpoint(), "Remote backend configured"),
            None => warn!("No remote endpoint configured, remote jobs will run locally"),
        }

        let orchestrator = Orchestrator::new(
            Arc::clone(&db),
            Arc::clone(&capabilities),
            config.pipeline.clone(),
        );

        Ok(Self {
            config,
            db,
            queue,
            capabilities,
            remote,
            orchestrator,
        })
    }

    /// Queue a document for enrichment
    pub fn enqueue(
        &self,
        document_id: &str,
        backend: Option<Backend>,
    ) -> ServiceResult<EnqueueReceipt> {
        self.queue.enqueue(document_id, backend)
    }

    /// Status of a job; unknown and expired ids report `not_found`
    pub fn get_job_status(&self, job_id: &str) -> JobSnapshot {
        self.queue.status(job_id)
    }

    pub fn get_queue_stats(&self) -> ServiceResult<QueueStats> {
        self.queue.stats()
    }
}
