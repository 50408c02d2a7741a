//! Durable job queue.
//!
//! Jobs live in SQLite. Workers claim the oldest queued job and receive a
//! [`JobHandle`], the only writer for that job's progress and terminal
//! state. Status reads never fail: unknown, expired or unreadable jobs are
//! reported with the `not_found` status.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::db::{Backend, Database, Job, JobStatus};
use crate::error::{ServiceError, ServiceResult, format_error_chain};

/// Capacity of the job event channel; slow subscribers miss old events
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Returned by a successful enqueue
#[derive(Debug, Clone, Serialize)]
pub struct EnqueueReceipt {
    pub document_id: String,
    pub job_id: String,
    pub status: ExternalStatus,
}

/// Job status as reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    NotFound,
}

impl From<JobStatus> for ExternalStatus {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Queued => ExternalStatus::Queued,
            JobStatus::Started => ExternalStatus::Processing,
            JobStatus::Finished => ExternalStatus::Completed,
            JobStatus::Failed => ExternalStatus::Failed,
        }
    }
}

/// Point-in-time view of a job
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub status: ExternalStatus,
    pub progress: u8,
    pub message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub backend: Option<Backend>,
    pub document_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    fn not_found(id: &str, error: Option<String>) -> Self {
        Self {
            id: id.to_string(),
            status: ExternalStatus::NotFound,
            progress: 0,
            message: None,
            result: None,
            error,
            error_kind: None,
            backend: None,
            document_id: None,
            created_at: None,
            started_at: None,
            ended_at: None,
        }
    }
}

impl From<Job> for JobSnapshot {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            status: job.status.into(),
            progress: job.progress,
            message: job.message,
            result: job.result,
            error: job.error,
            error_kind: job.error_kind,
            backend: Some(job.backend),
            document_id: Some(job.document_id),
            created_at: Some(job.created_at),
            started_at: job.started_at,
            ended_at: job.ended_at,
        }
    }
}

/// Retained job totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: u64,
    pub active: u64,
    pub finished: u64,
    pub failed: u64,
}

/// Job lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Progress {
        job_id: String,
        progress: u8,
        message: String,
    },
    Finished {
        job_id: String,
    },
    Failed {
        job_id: String,
        error_kind: String,
    },
}

pub struct JobQueue {
    db: Arc<Database>,
    config: QueueConfig,
    notify: Notify,
    events: broadcast::Sender<JobEvent>,
}

impl JobQueue {
    pub fn new(db: Arc<Database>, config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            db,
            config,
            notify: Notify::new(),
            events,
        }
    }

    /// Queue a document for processing. `None` uses the configured default backend.
    pub fn enqueue(
        &self,
        document_id: &str,
        backend: Option<Backend>,
    ) -> ServiceResult<EnqueueReceipt> {
        let backend = backend.unwrap_or(self.config.default_backend);
        let job = self.db.enqueue_job(document_id, backend)?;

        info!(
            job_id = %job.id,
            doc_id = %document_id,
            backend = backend.as_str(),
            "Job enqueued"
        );
        self.notify.notify_one();

        Ok(EnqueueReceipt {
            document_id: job.document_id,
            job_id: job.id,
            status: ExternalStatus::Queued,
        })
    }

    /// Current state of a job. Never fails.
    pub fn status(&self, job_id: &str) -> JobSnapshot {
        match self.db.get_job(job_id) {
            Ok(Some(job)) if !self.is_expired(&job) => job.into(),
            Ok(_) => JobSnapshot::not_found(job_id, None),
            Err(e) => {
                let error = format_error_chain(&e);
                warn!(job_id, error = %error, "Failed to read job status");
                JobSnapshot::not_found(job_id, Some(error))
            }
        }
    }

    /// Totals over jobs that are still retained
    pub fn stats(&self) -> ServiceResult<QueueStats> {
        let (finished_cutoff, failed_cutoff) = self.cutoffs();
        let counts = self.db.job_counts(finished_cutoff, failed_cutoff)?;

        Ok(QueueStats {
            queued: counts.queued,
            active: counts.started,
            finished: counts.finished,
            failed: counts.failed,
        })
    }

    /// Claim the oldest queued job for the calling worker
    pub fn claim_next(&self) -> ServiceResult<Option<JobHandle>> {
        let Some(job) = self.db.claim_next_job()? else {
            return Ok(None);
        };

        debug!(job_id = %job.id, doc_id = %job.document_id, "Job claimed");

        Ok(Some(JobHandle {
            id: job.id,
            document_id: job.document_id,
            backend: job.backend,
            progress: job.progress,
            db: Arc::clone(&self.db),
            events: self.events.clone(),
        }))
    }

    /// Sleep until a job is enqueued or the timeout passes
    pub async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Delete terminal jobs past their retention window
    pub fn purge_expired(&self) -> ServiceResult<usize> {
        let (finished_cutoff, failed_cutoff) = self.cutoffs();
        self.db.purge_expired_jobs(finished_cutoff, failed_cutoff)
    }

    /// Fail jobs a previous process left running
    pub fn recover_interrupted(&self) -> ServiceResult<usize> {
        let count = self
            .db
            .fail_interrupted_jobs("Interrupted by service restart")?;
        if count > 0 {
            warn!(count, "Marked interrupted jobs as failed");
        }
        Ok(count)
    }

    fn cutoffs(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let now = Utc::now();
        (
            now - self.config.result_ttl(),
            now - self.config.failure_ttl(),
        )
    }

    fn is_expired(&self, job: &Job) -> bool {
        let (finished_cutoff, failed_cutoff) = self.cutoffs();
        match (job.status, job.ended_at) {
            (JobStatus::Finished, Some(ended)) => ended < finished_cutoff,
            (JobStatus::Failed, Some(ended)) => ended < failed_cutoff,
            _ => false,
        }
    }
}

/// Exclusive write access to one started job
pub struct JobHandle {
    id: String,
    document_id: String,
    backend: Backend,
    progress: u8,
    db: Arc<Database>,
    events: broadcast::Sender<JobEvent>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Last progress value written through this handle
    pub fn progress(&self) -> u8 {
        self.progress
    }

    /// Record progress. Values above 100 are clamped; values below the last
    /// reported progress are ignored.
    pub fn report(&mut self, percent: u8, message: &str) -> ServiceResult<()> {
        let percent = percent.min(100);
        if percent < self.progress {
            debug!(job_id = %self.id, percent, current = self.progress, "Ignoring progress regression");
            return Ok(());
        }

        if !self.db.update_job_progress(&self.id, percent, Some(message))? {
            debug!(job_id = %self.id, "Progress for inactive job ignored");
            return Ok(());
        }

        self.progress = percent;
        debug!(job_id = %self.id, progress = percent, message, "Job progress");
        let _ = self.events.send(JobEvent::Progress {
            job_id: self.id.clone(),
            progress: percent,
            message: message.to_string(),
        });

        Ok(())
    }

    /// Fail the job with the error's text and code. When `document_failed`
    /// is set the document is marked failed in the same transaction.
    pub fn fail(self, error: &ServiceError, document_failed: bool) -> ServiceResult<()> {
        let message = format_error_chain(error);
        let kind = error.error_code();
        let document_id = document_failed.then_some(self.document_id.as_str());

        if self.db.fail_job(&self.id, document_id, &message, kind)? {
            let _ = self.events.send(JobEvent::Failed {
                job_id: self.id.clone(),
                error_kind: kind.to_string(),
            });
        } else {
            debug!(job_id = %self.id, "Failure for inactive job ignored");
        }

        Ok(())
    }

    /// Announce a finish already persisted with the job's result
    pub(crate) fn finished(self) {
        let _ = self.events.send(JobEvent::Finished { job_id: self.id });
    }

    pub(crate) fn database(&self) -> &Database {
        &self.db
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::{DocumentStatus, NewDocument};
    use crate::error::{CapabilityError, PipelineError};
    use crate::routing::Modality;

    fn queue_with_document() -> (JobQueue, Arc<Database>, String) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let doc = db
            .insert_document(&NewDocument {
                filename: "clip.wav".to_string(),
                mime_type: Some("audio/wav".to_string()),
                size_bytes: 4,
                storage_locator: "/tmp/clip.wav".to_string(),
                checksum: None,
            })
            .unwrap();
        let queue = JobQueue::new(Arc::clone(&db), AppConfig::default().queue);
        (queue, db, doc.id)
    }

    #[test]
    fn test_enqueue_and_status() {
        let (queue, _db, doc_id) = queue_with_document();

        let receipt = queue.enqueue(&doc_id, None).unwrap();
        assert_eq!(receipt.status, ExternalStatus::Queued);
        assert_eq!(receipt.document_id, doc_id);

        let snapshot = queue.status(&receipt.job_id);
        assert_eq!(snapshot.status, ExternalStatus::Queued);
        assert_eq!(snapshot.backend, Some(Backend::Local));
        assert_eq!(snapshot.progress, 0);
    }

    #[test]
    fn test_unknown_job_is_not_found() {
        let (queue, _db, _doc_id) = queue_with_document();

        for id in ["", "missing", "'; DROP TABLE jobs; --"] {
            let snapshot = queue.status(id);
            assert_eq!(snapshot.status, ExternalStatus::NotFound);
            assert!(snapshot.error.is_none());
        }
    }

    #[test]
    fn test_enqueue_unknown_document_fails() {
        let (queue, _db, _doc_id) = queue_with_document();
        let err = queue.enqueue("missing", Some(Backend::Remote)).unwrap_err();
        assert_eq!(err.error_code(), "document_not_found");
    }

    #[tokio::test]
    async fn test_handle_progress_is_monotonic_and_broadcast() {
        let (queue, _db, doc_id) = queue_with_document();
        let receipt = queue.enqueue(&doc_id, None).unwrap();
        let mut events = queue.subscribe();

        let mut handle = queue.claim_next().unwrap().unwrap();
        assert_eq!(handle.id(), receipt.job_id);
        assert_eq!(queue.status(handle.id()).status, ExternalStatus::Processing);

        handle.report(40, "Extracting").unwrap();
        handle.report(20, "Going backwards").unwrap();
        handle.report(250, "Clamped").unwrap();

        let snapshot = queue.status(&receipt.job_id);
        assert_eq!(snapshot.progress, 100);
        assert_eq!(snapshot.message.as_deref(), Some("Clamped"));

        assert_eq!(
            events.recv().await.unwrap(),
            JobEvent::Progress {
                job_id: receipt.job_id.clone(),
                progress: 40,
                message: "Extracting".to_string(),
            }
        );
        match events.recv().await.unwrap() {
            JobEvent::Progress { progress, .. } => assert_eq!(progress, 100),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_fail_records_kind_and_freezes_progress() {
        let (queue, db, doc_id) = queue_with_document();
        let receipt = queue.enqueue(&doc_id, None).unwrap();

        let mut handle = queue.claim_next().unwrap().unwrap();
        handle.report(20, "Extracting").unwrap();

        let error = ServiceError::Pipeline(PipelineError::Extraction {
            modality: Modality::Audio,
            source: CapabilityError::failed("decoder crashed"),
        });
        handle.fail(&error, true).unwrap();

        let snapshot = queue.status(&receipt.job_id);
        assert_eq!(snapshot.status, ExternalStatus::Failed);
        assert_eq!(snapshot.progress, 20);
        assert_eq!(snapshot.error_kind.as_deref(), Some("extraction_failure"));
        assert!(snapshot.error.unwrap().contains("decoder crashed"));

        let doc = db.get_document(&doc_id).unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);

        assert_eq!(
            queue.stats().unwrap(),
            QueueStats {
                queued: 0,
                active: 0,
                finished: 0,
                failed: 1
            }
        );
    }

    #[tokio::test]
    async fn test_enqueue_wakes_waiting_worker() {
        let (queue, _db, doc_id) = queue_with_document();
        let queue = Arc::new(queue);

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.wait_for_work(Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;
        queue.enqueue(&doc_id, None).unwrap();

        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
