//! Job store operations.
//!
//! Every state transition is a guarded UPDATE so that a job only moves
//! forward: `queued -> started -> finished | failed`. Writes against a job
//! that is not `started` affect zero rows and report `false`.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use uuid::Uuid;

use super::models::{Backend, Job, JobStatus};
use super::{Database, timestamp};
use crate::error::{DatabaseError, ServiceError, ServiceResult};

/// Job totals by stored status, terminal jobs limited to their retention window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub queued: u64,
    pub started: u64,
    pub finished: u64,
    pub failed: u64,
}

impl Database {
    /// Create a queued job and move the document to `queued`
    pub fn enqueue_job(&self, document_id: &str, backend: Backend) -> ServiceResult<Job> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(DatabaseError::Query)?;

        let exists: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM documents WHERE id = ?1)",
                params![document_id],
                |row| row.get(0),
            )
            .map_err(DatabaseError::Query)?;

        if !exists {
            return Err(ServiceError::DocumentNotFound {
                document_id: document_id.to_string(),
            });
        }

        let job = Job {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            backend,
            status: JobStatus::Queued,
            progress: 0,
            message: None,
            result: None,
            error: None,
            error_kind: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        };

        tx.execute(
            r#"
            INSERT INTO jobs (id, document_id, backend, status, progress, created_at)
            VALUES (?1, ?2, ?3, ?4, 0, ?5)
            "#,
            params![
                job.id,
                job.document_id,
                job.backend.as_str(),
                job.status.as_str(),
                timestamp(job.created_at),
            ],
        )
        .map_err(DatabaseError::Query)?;

        // A document already being processed keeps that status until its run ends
        tx.execute(
            "UPDATE documents SET status = 'queued' WHERE id = ?1 AND status != 'processing'",
            params![document_id],
        )
        .map_err(DatabaseError::Query)?;

        tx.commit().map_err(DatabaseError::Query)?;

        Ok(job)
    }

    /// Get a job by ID
    pub fn get_job(&self, id: &str) -> ServiceResult<Option<Job>> {
        let conn = self.conn()?;

        conn.query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?1", Job::COLUMNS),
            params![id],
            Job::from_row,
        )
        .optional()
        .map_err(|e| DatabaseError::Query(e).into())
    }

    /// Atomically move the oldest queued job to `started` and return it
    pub fn claim_next_job(&self) -> ServiceResult<Option<Job>> {
        let conn = self.conn()?;

        conn.query_row(
            &format!(
                r#"
                UPDATE jobs SET status = 'started', started_at = ?1
                WHERE id = (
                    SELECT id FROM jobs WHERE status = 'queued'
                    ORDER BY created_at, rowid LIMIT 1
                )
                RETURNING {}
                "#,
                Job::COLUMNS
            ),
            params![timestamp(Utc::now())],
            Job::from_row,
        )
        .optional()
        .map_err(|e| DatabaseError::Query(e).into())
    }

    /// Record progress for a started job. Progress never decreases.
    /// Returns false when the job is not `started`.
    pub fn update_job_progress(
        &self,
        id: &str,
        progress: u8,
        message: Option<&str>,
    ) -> ServiceResult<bool> {
        let conn = self.conn()?;

        let rows = conn
            .execute(
                r#"
                UPDATE jobs SET progress = MAX(progress, ?2), message = COALESCE(?3, message)
                WHERE id = ?1 AND status = 'started'
                "#,
                params![id, progress.min(100) as i64, message],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Fail a started job, optionally marking its document failed in the same
    /// transaction. Returns false when the job is not `started`.
    pub fn fail_job(
        &self,
        id: &str,
        document_id: Option<&str>,
        error: &str,
        error_kind: &str,
    ) -> ServiceResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(DatabaseError::Query)?;

        let rows = tx
            .execute(
                r#"
                UPDATE jobs SET status = 'failed', error = ?2, error_kind = ?3, ended_at = ?4
                WHERE id = ?1 AND status = 'started'
                "#,
                params![id, error, error_kind, timestamp(Utc::now())],
            )
            .map_err(DatabaseError::Query)?;

        if rows == 0 {
            return Ok(false);
        }

        if let Some(document_id) = document_id {
            tx.execute(
                "UPDATE documents SET status = 'failed' WHERE id = ?1",
                params![document_id],
            )
            .map_err(DatabaseError::Query)?;
        }

        tx.commit().map_err(DatabaseError::Query)?;

        Ok(true)
    }

    /// Count jobs by status. Terminal jobs that ended before their cutoff are
    /// treated as already forgotten.
    pub fn job_counts(
        &self,
        finished_cutoff: DateTime<Utc>,
        failed_cutoff: DateTime<Utc>,
    ) -> ServiceResult<JobCounts> {
        let conn = self.conn()?;

        conn.query_row(
            r#"
            SELECT
                COALESCE(SUM(status = 'queued'), 0),
                COALESCE(SUM(status = 'started'), 0),
                COALESCE(SUM(status = 'finished' AND ended_at >= ?1), 0),
                COALESCE(SUM(status = 'failed' AND ended_at >= ?2), 0)
            FROM jobs
            "#,
            params![timestamp(finished_cutoff), timestamp(failed_cutoff)],
            |row| {
                let queued: i64 = row.get(0)?;
                let started: i64 = row.get(1)?;
                let finished: i64 = row.get(2)?;
                let failed: i64 = row.get(3)?;
                Ok(JobCounts {
                    queued: queued as u64,
                    started: started as u64,
                    finished: finished as u64,
                    failed: failed as u64,
                })
            },
        )
        .map_err(|e| DatabaseError::Query(e).into())
    }

    /// Delete terminal jobs that ended before their cutoff
    pub fn purge_expired_jobs(
        &self,
        finished_cutoff: DateTime<Utc>,
        failed_cutoff: DateTime<Utc>,
    ) -> ServiceResult<usize> {
        let conn = self.conn()?;

        let rows = conn
            .execute(
                r#"
                DELETE FROM jobs
                WHERE (status = 'finished' AND ended_at < ?1)
                   OR (status = 'failed' AND ended_at < ?2)
                "#,
                params![timestamp(finished_cutoff), timestamp(failed_cutoff)],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows)
    }

    /// Fail every job left `started` by a previous process, along with its document
    pub fn fail_interrupted_jobs(&self, error: &str) -> ServiceResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(DatabaseError::Query)?;

        tx.execute(
            r#"
            UPDATE documents SET status = 'failed'
            WHERE id IN (SELECT document_id FROM jobs WHERE status = 'started')
            "#,
            [],
        )
        .map_err(DatabaseError::Query)?;

        let rows = tx
            .execute(
                r#"
                UPDATE jobs SET status = 'failed', error = ?1, error_kind = 'interrupted', ended_at = ?2
                WHERE status = 'started'
                "#,
                params![error, timestamp(Utc::now())],
            )
            .map_err(DatabaseError::Query)?;

        tx.commit().map_err(DatabaseError::Query)?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DocumentStatus, NewDocument};
    use chrono::Duration;

    fn seeded() -> (Database, String) {
        let db = Database::open_in_memory().unwrap();
        let doc = db
            .insert_document(&NewDocument {
                filename: "notes.txt".to_string(),
                mime_type: Some("text/plain".to_string()),
                size_bytes: 5,
                storage_locator: "/tmp/notes.txt".to_string(),
                checksum: None,
            })
            .unwrap();
        (db, doc.id)
    }

    #[test]
    fn test_enqueue_requires_document() {
        let (db, doc_id) = seeded();

        let err = db.enqueue_job("missing", Backend::Local).unwrap_err();
        assert!(matches!(err, ServiceError::DocumentNotFound { .. }));

        let job = db.enqueue_job(&doc_id, Backend::Remote).unwrap();
        assert_eq!(job.status, JobStatus::Queued);

        let stored = db.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.backend, Backend::Remote);
        assert_eq!(stored.progress, 0);

        let doc = db.get_document(&doc_id).unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Queued);
    }

    #[test]
    fn test_claim_takes_oldest_queued_job_once() {
        let (db, doc_id) = seeded();
        let first = db.enqueue_job(&doc_id, Backend::Local).unwrap();
        let second = db.enqueue_job(&doc_id, Backend::Local).unwrap();

        let claimed = db.claim_next_job().unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Started);
        assert!(claimed.started_at.is_some());

        let claimed = db.claim_next_job().unwrap().unwrap();
        assert_eq!(claimed.id, second.id);

        assert!(db.claim_next_job().unwrap().is_none());
    }

    #[test]
    fn test_progress_is_monotonic_and_requires_started() {
        let (db, doc_id) = seeded();
        let job = db.enqueue_job(&doc_id, Backend::Local).unwrap();

        assert!(!db.update_job_progress(&job.id, 10, Some("early")).unwrap());

        db.claim_next_job().unwrap();
        assert!(db.update_job_progress(&job.id, 40, Some("extracting")).unwrap());
        assert!(db.update_job_progress(&job.id, 20, None).unwrap());

        let stored = db.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.progress, 40);
        assert_eq!(stored.message.as_deref(), Some("extracting"));
    }

    #[test]
    fn test_fail_is_terminal() {
        let (db, doc_id) = seeded();
        let job = db.enqueue_job(&doc_id, Backend::Local).unwrap();

        assert!(!db.fail_job(&job.id, None, "boom", "internal_error").unwrap());

        db.claim_next_job().unwrap();
        assert!(
            db.fail_job(&job.id, Some(&doc_id), "boom", "extraction_failure")
                .unwrap()
        );
        assert!(!db.fail_job(&job.id, None, "again", "internal_error").unwrap());
        assert!(!db.update_job_progress(&job.id, 90, None).unwrap());

        let stored = db.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("boom"));
        assert_eq!(stored.error_kind.as_deref(), Some("extraction_failure"));
        assert!(stored.ended_at.is_some());

        let doc = db.get_document(&doc_id).unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
    }

    #[test]
    fn test_counts_and_purge_respect_cutoffs() {
        let (db, doc_id) = seeded();
        let failed = db.enqueue_job(&doc_id, Backend::Local).unwrap();
        db.enqueue_job(&doc_id, Backend::Local).unwrap();
        db.claim_next_job().unwrap();
        db.fail_job(&failed.id, None, "boom", "internal_error")
            .unwrap();

        let past = Utc::now() - Duration::hours(1);
        let future = Utc::now() + Duration::hours(1);

        let counts = db.job_counts(past, past).unwrap();
        assert_eq!(
            counts,
            JobCounts {
                queued: 1,
                started: 0,
                finished: 0,
                failed: 1
            }
        );

        assert_eq!(db.job_counts(past, future).unwrap().failed, 0);

        assert_eq!(db.purge_expired_jobs(past, past).unwrap(), 0);
        assert_eq!(db.purge_expired_jobs(future, future).unwrap(), 1);
        assert!(db.get_job(&failed.id).unwrap().is_none());
    }

    #[test]
    fn test_interrupted_jobs_are_failed() {
        let (db, doc_id) = seeded();
        let job = db.enqueue_job(&doc_id, Backend::Local).unwrap();
        let waiting = db.enqueue_job(&doc_id, Backend::Local).unwrap();
        db.claim_next_job().unwrap();

        assert_eq!(db.fail_interrupted_jobs("restarted").unwrap(), 1);

        let stored = db.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_kind.as_deref(), Some("interrupted"));

        let waiting = db.get_job(&waiting.id).unwrap().unwrap();
        assert_eq!(waiting.status, JobStatus::Queued);

        let doc = db.get_document(&doc_id).unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
    }
}
