//! Database schema migrations.

use rusqlite::Connection;

use crate::error::{DatabaseError, ServiceResult};

/// Run all database migrations.
///
/// Every statement is idempotent, so this runs on each open.
pub(super) fn run_migrations(conn: &Connection) -> ServiceResult<()> {
    conn.execute_batch(
        r#"
        -- Source documents (catalog records the pipeline reads)
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            filename TEXT NOT NULL,
            mime_type TEXT,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            storage_locator TEXT NOT NULL,
            checksum TEXT,
            status TEXT NOT NULL DEFAULT 'uploaded',
            created_at TEXT NOT NULL,
            processed_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_documents_checksum ON documents(checksum);

        -- Queued enrichment work. Jobs outlive neither their retention window
        -- nor need their document to exist: a job for a deleted document fails.
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            backend TEXT NOT NULL DEFAULT 'local',
            status TEXT NOT NULL DEFAULT 'queued',
            progress INTEGER NOT NULL DEFAULT 0,
            message TEXT,
            result TEXT,
            error TEXT,
            error_kind TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            ended_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_document ON jobs(document_id);

        -- Pipeline output, one row per successful run
        CREATE TABLE IF NOT EXISTS normalized_results (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            job_id TEXT NOT NULL,
            modality TEXT NOT NULL,
            source_filename TEXT NOT NULL,
            source_mime TEXT,
            main_text TEXT NOT NULL,
            summary_text TEXT NOT NULL,
            tags TEXT NOT NULL,
            labels TEXT NOT NULL,
            captions TEXT NOT NULL,
            embedding BLOB NOT NULL,
            extra_metadata TEXT NOT NULL,
            processing_duration REAL NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_results_job ON normalized_results(job_id);
        CREATE INDEX IF NOT EXISTS idx_results_document ON normalized_results(document_id, created_at);
        "#,
    )
    .map_err(|e| DatabaseError::Migration {
        message: e.to_string(),
    })?;

    Ok(())
}
