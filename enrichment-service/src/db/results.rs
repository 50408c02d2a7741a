//! Normalized result persistence.

use chrono::Utc;
use rusqlite::params;

use super::models::{NormalizedResult, embedding_to_blob};
use super::{Database, timestamp};
use crate::error::{DatabaseError, ServiceResult};

impl Database {
    /// Insert a result, mark its document processed and finish its job in a
    /// single transaction.
    ///
    /// Returns `Ok(false)` and writes nothing when the job is no longer
    /// `started`.
    pub fn persist_result(
        &self,
        result: &NormalizedResult,
        job_payload: &serde_json::Value,
    ) -> Result<bool, DatabaseError> {
        let tags = serde_json::to_string(&result.tags).map_err(DatabaseError::Serialization)?;
        let labels =
            serde_json::to_string(&result.labels).map_err(DatabaseError::Serialization)?;
        let captions =
            serde_json::to_string(&result.captions).map_err(DatabaseError::Serialization)?;
        let metadata = serde_json::to_string(&result.extra_metadata)
            .map_err(DatabaseError::Serialization)?;
        let payload = serde_json::to_string(job_payload).map_err(DatabaseError::Serialization)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(DatabaseError::Query)?;

        tx.execute(
            r#"
            INSERT INTO normalized_results (id, document_id, job_id, modality, source_filename, source_mime, main_text, summary_text, tags, labels, captions, embedding, extra_metadata, processing_duration, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
            params![
                result.id,
                result.document_id,
                result.job_id,
                result.modality.as_ref(),
                result.source_filename,
                result.source_mime,
                result.main_text,
                result.summary_text,
                tags,
                labels,
                captions,
                embedding_to_blob(&result.embedding),
                metadata,
                result.processing_duration,
                timestamp(result.created_at),
            ],
        )
        .map_err(DatabaseError::Query)?;

        let now = timestamp(Utc::now());

        tx.execute(
            "UPDATE documents SET status = 'processed', processed_at = ?2 WHERE id = ?1",
            params![result.document_id, now],
        )
        .map_err(DatabaseError::Query)?;

        let finished = tx
            .execute(
                r#"
                UPDATE jobs SET status = 'finished', progress = 100, message = 'Done', result = ?2, ended_at = ?3
                WHERE id = ?1 AND status = 'started'
                "#,
                params![result.job_id, payload, now],
            )
            .map_err(DatabaseError::Query)?;

        if finished == 0 {
            tx.rollback().map_err(DatabaseError::Query)?;
            return Ok(false);
        }

        tx.commit().map_err(DatabaseError::Query)?;

        Ok(true)
    }

    /// All results for a document, oldest first
    pub fn results_for_document(&self, document_id: &str) -> ServiceResult<Vec<NormalizedResult>> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM normalized_results WHERE document_id = ?1 ORDER BY created_at, rowid",
                NormalizedResult::COLUMNS
            ))
            .map_err(DatabaseError::Query)?;

        let results = stmt
            .query_map(params![document_id], NormalizedResult::from_row)
            .map_err(DatabaseError::Query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::Query)?;

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Backend, DocumentStatus, JobStatus, NewDocument};
    use crate::routing::Modality;

    fn result_for(document_id: &str, job_id: &str) -> NormalizedResult {
        NormalizedResult {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            job_id: job_id.to_string(),
            modality: Modality::Text,
            source_filename: "notes.txt".to_string(),
            source_mime: None,
            main_text: "hello world".to_string(),
            summary_text: "hello".to_string(),
            tags: vec!["hello".to_string()],
            labels: vec![],
            captions: vec![],
            embedding: vec![0.5, -0.25, 0.0],
            extra_metadata: serde_json::Map::new(),
            processing_duration: 0.25,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_persist_result_finishes_started_job() {
        let db = Database::open_in_memory().unwrap();
        let doc = db
            .insert_document(&NewDocument {
                filename: "notes.txt".to_string(),
                mime_type: None,
                size_bytes: 11,
                storage_locator: "/tmp/notes.txt".to_string(),
                checksum: None,
            })
            .unwrap();
        let job = db.enqueue_job(&doc.id, Backend::Local).unwrap();

        // Not started yet: nothing is written
        let early = result_for(&doc.id, &job.id);
        assert!(!db.persist_result(&early, &serde_json::json!({})).unwrap());
        assert!(db.results_for_document(&doc.id).unwrap().is_empty());

        db.claim_next_job().unwrap();
        let result = result_for(&doc.id, &job.id);
        assert!(
            db.persist_result(&result, &serde_json::json!({"ok": true}))
                .unwrap()
        );

        let stored = db.results_for_document(&doc.id).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].embedding, vec![0.5, -0.25, 0.0]);
        assert_eq!(stored[0].tags, vec!["hello"]);
        assert_eq!(stored[0].modality, Modality::Text);

        let job = db.get_job(&job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Finished);
        assert_eq!(job.progress, 100);
        assert_eq!(job.result, Some(serde_json::json!({"ok": true})));

        let doc = db.get_document(&doc.id).unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Processed);
        assert!(doc.processed_at.is_some());
    }
}
