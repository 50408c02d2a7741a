//! Background workers: the job worker pool and the retention janitor.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ServiceError, ServiceResult, format_error_chain};
use crate::queue::JobHandle;
use crate::service::EnrichmentService;

/// Back-off after the store fails to hand out a job
const CLAIM_ERROR_BACKOFF: Duration = Duration::from_secs(5);

impl EnrichmentService {
    /// Start `queue.workers` job workers. Workers finish their current job
    /// and exit once `shutdown` is cancelled.
    pub fn start_workers(
        service: Arc<EnrichmentService>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let workers = service.config.queue.workers.max(1);
        let poll_interval = service.config.queue.poll_interval();

        (0..workers)
            .map(|worker| {
                let service = Arc::clone(&service);
                let shutdown = shutdown.clone();

                tokio::spawn(async move {
                    info!(worker, "Enrichment worker started");
                    while !shutdown.is_cancelled() {
                        match service.queue.claim_next() {
                            Ok(Some(handle)) => {
                                Self::run_isolated(&service, worker, handle).await;
                            }
                            Ok(None) => {
                                tokio::select! {
                                    _ = shutdown.cancelled() => break,
                                    _ = service.queue.wait_for_work(poll_interval) => {}
                                }
                            }
                            Err(e) => {
                                error!(worker, error = %format_error_chain(&e), "Failed to claim next job");
                                tokio::select! {
                                    _ = shutdown.cancelled() => break,
                                    _ = tokio::time::sleep(CLAIM_ERROR_BACKOFF) => {}
                                }
                            }
                        }
                    }
                    info!(worker, "Enrichment worker stopped");
                })
            })
            .collect()
    }

    /// Run a job in its own task so a panicking provider cannot take the
    /// worker down with it. A panicked job is failed here.
    async fn run_isolated(service: &Arc<EnrichmentService>, worker: usize, handle: JobHandle) {
        let job_id = handle.id().to_string();
        let document_id = handle.document_id().to_string();

        let task = {
            let service = Arc::clone(service);
            tokio::spawn(async move { service.execute(handle).await })
        };

        match task.await {
            Ok(Ok(())) => debug!(worker, job_id = %job_id, "Worker finished job"),
            Ok(Err(e)) => warn!(
                worker,
                job_id = %job_id,
                error_kind = e.error_code(),
                "Worker finished failed job"
            ),
            Err(e) => {
                error!(worker, job_id = %job_id, error = %e, "Job task panicked");
                let failure = ServiceError::Internal {
                    message: format!("job task panicked: {}", e),
                };
                if let Err(store_error) = service.db.fail_job(
                    &job_id,
                    Some(&document_id),
                    &format_error_chain(&failure),
                    failure.error_code(),
                ) {
                    error!(
                        job_id = %job_id,
                        error = %format_error_chain(&store_error),
                        "Failed to record panicked job"
                    );
                }
            }
        }
    }

    /// Claim and run one job on the calling task.
    /// Returns the job id, or None when the queue is empty.
    pub async fn process_next(&self) -> ServiceResult<Option<String>> {
        let Some(handle) = self.queue.claim_next()? else {
            return Ok(None);
        };

        let job_id = handle.id().to_string();
        // A failed job is a processed job; its error lives on the job record
        if let Err(e) = self.execute(handle).await {
            warn!(
                job_id = %job_id,
                error_kind = e.error_code(),
                error = %format_error_chain(&e),
                "Job did not finish"
            );
        }
        Ok(Some(job_id))
    }

    /// Periodically delete terminal jobs past their retention window
    pub fn start_janitor(service: Arc<EnrichmentService>, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = service
            .config
            .queue
            .cleanup_interval()
            .max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }

                match service.queue.purge_expired() {
                    Ok(count) if count > 0 => info!(removed = count, "Purged expired jobs"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %format_error_chain(&e), "Job purge failed"),
                }
            }
        })
    }
}
