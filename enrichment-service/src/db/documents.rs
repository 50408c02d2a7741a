//! Source document operations.

use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use uuid::Uuid;

use super::models::{DocumentStatus, NewDocument, SourceDocument};
use super::{Database, timestamp};
use crate::error::{DatabaseError, ServiceResult};

impl Database {
    /// Register a document in `uploaded` state
    pub fn insert_document(&self, doc: &NewDocument) -> ServiceResult<SourceDocument> {
        let conn = self.conn()?;

        let record = SourceDocument {
            id: Uuid::new_v4().to_string(),
            filename: doc.filename.clone(),
            mime_type: doc.mime_type.clone(),
            size_bytes: doc.size_bytes,
            storage_locator: doc.storage_locator.clone(),
            checksum: doc.checksum.clone(),
            status: DocumentStatus::Uploaded,
            created_at: Utc::now(),
            processed_at: None,
        };

        conn.execute(
            r#"
            INSERT INTO documents (id, filename, mime_type, size_bytes, storage_locator, checksum, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                record.id,
                record.filename,
                record.mime_type,
                record.size_bytes as i64,
                record.storage_locator,
                record.checksum,
                record.status.as_str(),
                timestamp(record.created_at),
            ],
        )
        .map_err(DatabaseError::Query)?;

        Ok(record)
    }

    /// Get a document by ID
    pub fn get_document(&self, id: &str) -> ServiceResult<Option<SourceDocument>> {
        let conn = self.conn()?;

        let doc = conn
            .query_row(
                &format!(
                    "SELECT {} FROM documents WHERE id = ?1",
                    SourceDocument::COLUMNS
                ),
                params![id],
                SourceDocument::from_row,
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        Ok(doc)
    }

    /// Find a non-failed document with the given checksum.
    /// Returns the document ID if found.
    pub fn find_document_by_checksum(&self, checksum: &str) -> ServiceResult<Option<String>> {
        let conn = self.conn()?;

        conn.query_row(
            "SELECT id FROM documents WHERE checksum = ?1 AND status != 'failed'",
            params![checksum],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| DatabaseError::Query(e).into())
    }

    /// Update a document's lifecycle status.
    /// Returns false when the document does not exist.
    pub fn update_document_status(&self, id: &str, status: DocumentStatus) -> ServiceResult<bool> {
        let conn = self.conn()?;

        let rows = conn
            .execute(
                "UPDATE documents SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Delete a document and its results
    #[cfg(test)]
    pub fn delete_document(&self, id: &str) -> ServiceResult<bool> {
        let conn = self.conn()?;

        let rows = conn
            .execute("DELETE FROM documents WHERE id = ?1", params![id])
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_document(name: &str) -> NewDocument {
        NewDocument {
            filename: name.to_string(),
            mime_type: None,
            size_bytes: 4,
            storage_locator: format!("/tmp/{}", name),
            checksum: Some(format!("sum-{}", name)),
        }
    }

    #[test]
    fn test_insert_and_get_document() {
        let db = Database::open_in_memory().unwrap();
        let doc = db.insert_document(&sample_document("a.txt")).unwrap();

        let loaded = db.get_document(&doc.id).unwrap().unwrap();
        assert_eq!(loaded.filename, "a.txt");
        assert_eq!(loaded.status, DocumentStatus::Uploaded);
        assert!(loaded.processed_at.is_none());

        assert!(db.get_document("missing").unwrap().is_none());
    }

    #[test]
    fn test_checksum_lookup_ignores_failed_documents() {
        let db = Database::open_in_memory().unwrap();
        let doc = db.insert_document(&sample_document("a.txt")).unwrap();

        assert_eq!(
            db.find_document_by_checksum("sum-a.txt").unwrap(),
            Some(doc.id.clone())
        );

        assert!(
            db.update_document_status(&doc.id, DocumentStatus::Failed)
                .unwrap()
        );
        assert_eq!(db.find_document_by_checksum("sum-a.txt").unwrap(), None);
        assert!(
            !db.update_document_status("missing", DocumentStatus::Failed)
                .unwrap()
        );
    }
}
