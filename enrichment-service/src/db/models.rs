//! Database model structs.
//!
//! This module contains the data structures for database records.

use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use super::parse_timestamp;
use crate::routing::Modality;

/// Lifecycle status of a source document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// Stored, never enqueued
    Uploaded,
    /// Waiting for a worker
    Queued,
    /// A worker is running the pipeline
    Processing,
    /// At least one normalized result exists
    Processed,
    /// The last run failed
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploaded => "uploaded",
            DocumentStatus::Queued => "queued",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Processed => "processed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "queued" => DocumentStatus::Queued,
            "processing" => DocumentStatus::Processing,
            "processed" => DocumentStatus::Processed,
            "failed" => DocumentStatus::Failed,
            _ => DocumentStatus::Uploaded,
        }
    }
}

/// Stored job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Started,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Started => "started",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "started" => JobStatus::Started,
            "finished" => JobStatus::Finished,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Queued,
        }
    }
}

/// Where a job's pipeline runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Local,
    Remote,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Local => "local",
            Backend::Remote => "remote",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "remote" => Backend::Remote,
            _ => Backend::Local,
        }
    }
}

/// Fields supplied when registering a document
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub filename: String,
    pub mime_type: Option<String>,
    pub size_bytes: u64,
    pub storage_locator: String,
    pub checksum: Option<String>,
}

/// Source document record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    pub id: String,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub size_bytes: u64,
    pub storage_locator: String,
    /// SHA-256 of the stored bytes, hex encoded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub status: DocumentStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

impl SourceDocument {
    pub(crate) const COLUMNS: &'static str = "id, filename, mime_type, size_bytes, storage_locator, checksum, status, created_at, processed_at";

    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let size_bytes: i64 = row.get(3)?;
        let status_str: String = row.get(6)?;
        let created_at_str: String = row.get(7)?;
        let processed_at_str: Option<String> = row.get(8)?;

        Ok(Self {
            id: row.get(0)?,
            filename: row.get(1)?,
            mime_type: row.get(2)?,
            size_bytes: size_bytes.max(0) as u64,
            storage_locator: row.get(4)?,
            checksum: row.get(5)?,
            status: DocumentStatus::from_str(&status_str),
            created_at: parse_timestamp(&created_at_str),
            processed_at: processed_at_str.as_deref().map(parse_timestamp),
        })
    }
}

/// Job record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub document_id: String,
    pub backend: Backend,
    pub status: JobStatus,
    pub progress: u8,
    pub message: Option<String>,
    /// Success payload written when the job finishes
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Stable snake_case failure code
    pub error_kind: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Job {
    pub(crate) const COLUMNS: &'static str = "id, document_id, backend, status, progress, message, result, error, error_kind, created_at, started_at, ended_at";

    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let backend_str: String = row.get(2)?;
        let status_str: String = row.get(3)?;
        let progress: i64 = row.get(4)?;
        let result_str: Option<String> = row.get(6)?;
        let created_at_str: String = row.get(9)?;
        let started_at_str: Option<String> = row.get(10)?;
        let ended_at_str: Option<String> = row.get(11)?;

        Ok(Self {
            id: row.get(0)?,
            document_id: row.get(1)?,
            backend: Backend::from_str(&backend_str),
            status: JobStatus::from_str(&status_str),
            progress: progress.clamp(0, 100) as u8,
            message: row.get(5)?,
            result: result_str.and_then(|s| serde_json::from_str(&s).ok()),
            error: row.get(7)?,
            error_kind: row.get(8)?,
            created_at: parse_timestamp(&created_at_str),
            started_at: started_at_str.as_deref().map(parse_timestamp),
            ended_at: ended_at_str.as_deref().map(parse_timestamp),
        })
    }
}

/// Output of one successful pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedResult {
    pub id: String,
    pub document_id: String,
    pub job_id: String,
    pub modality: Modality,
    pub source_filename: String,
    pub source_mime: Option<String>,
    pub main_text: String,
    pub summary_text: String,
    pub tags: Vec<String>,
    pub labels: Vec<String>,
    pub captions: Vec<String>,
    pub embedding: Vec<f32>,
    pub extra_metadata: serde_json::Map<String, serde_json::Value>,
    /// Seconds spent producing the result
    pub processing_duration: f64,
    pub created_at: DateTime<Utc>,
}

impl NormalizedResult {
    pub(crate) const COLUMNS: &'static str = "id, document_id, job_id, modality, source_filename, source_mime, main_text, summary_text, tags, labels, captions, embedding, extra_metadata, processing_duration, created_at";

    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let modality_str: String = row.get(3)?;
        let tags_str: String = row.get(8)?;
        let labels_str: String = row.get(9)?;
        let captions_str: String = row.get(10)?;
        let embedding_blob: Vec<u8> = row.get(11)?;
        let metadata_str: String = row.get(12)?;
        let created_at_str: String = row.get(14)?;

        Ok(Self {
            id: row.get(0)?,
            document_id: row.get(1)?,
            job_id: row.get(2)?,
            modality: modality_str.parse().unwrap_or(Modality::Unknown),
            source_filename: row.get(4)?,
            source_mime: row.get(5)?,
            main_text: row.get(6)?,
            summary_text: row.get(7)?,
            tags: serde_json::from_str(&tags_str).unwrap_or_default(),
            labels: serde_json::from_str(&labels_str).unwrap_or_default(),
            captions: serde_json::from_str(&captions_str).unwrap_or_default(),
            embedding: blob_to_embedding(&embedding_blob),
            extra_metadata: serde_json::from_str(&metadata_str).unwrap_or_default(),
            processing_duration: row.get(13)?,
            created_at: parse_timestamp(&created_at_str),
        })
    }
}

/// Pack an embedding as little-endian f32 bytes
pub(crate) fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(crate) fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect()
}
