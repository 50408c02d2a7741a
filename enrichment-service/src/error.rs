use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::routing::Modality;

/// Main service error type
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Document not found: {document_id}")]
    DocumentNotFound { document_id: String },

    #[error("Database error")]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Storage I/O failed for {path}")]
    Storage {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Database errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed")]
    Connection(#[source] rusqlite::Error),

    #[error("Query failed")]
    Query(#[source] rusqlite::Error),

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Serialization failed")]
    Serialization(#[source] serde_json::Error),

    #[error("Database connection lock poisoned")]
    LockPoisoned,
}

/// Failures raised while driving a document through the pipeline stages
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("No modality matched {filename}, using the text path")]
    UnsupportedModality { filename: String },

    #[error("Failed to read document bytes from {locator}")]
    FileRead {
        locator: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Extraction failed for {modality} content")]
    Extraction {
        modality: Modality,
        #[source]
        source: CapabilityError,
    },

    #[error("Summarization failed")]
    Summarization(#[source] CapabilityError),

    #[error("Tag extraction failed")]
    Tagging(#[source] CapabilityError),

    #[error("Embedding failed")]
    Embedding(#[source] CapabilityError),

    #[error("Embedding has {actual} dimensions, expected {expected}")]
    EmbeddingDimension { expected: usize, actual: usize },

    #[error("Failed to persist result for document {document_id}")]
    Persistence {
        document_id: String,
        #[source]
        source: DatabaseError,
    },

    #[error("Job {job_id} is no longer active")]
    JobNotActive { job_id: String },
}

/// Remote compute endpoint errors
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Connection failed to remote endpoint at {url}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Encoded payload of {size} bytes exceeds the {limit} byte remote limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Remote submission rejected (status {status}): {message}")]
    Submission { status: u16, message: String },

    #[error("Remote status check failed (status {status}): {message}")]
    Status { status: u16, message: String },

    #[error("Remote job {remote_id} failed: {message}")]
    Failed { remote_id: String, message: String },

    #[error("Remote job {remote_id} did not complete after {attempts} status checks")]
    Timeout { remote_id: String, attempts: u32 },

    #[error("Invalid response from remote endpoint")]
    InvalidResponse(#[source] reqwest::Error),
}

/// Errors reported by capability providers (extractors, summarizer, tagger, embedder)
#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("{capability} is not available: {reason}")]
    Unavailable {
        capability: &'static str,
        reason: String,
    },

    #[error("Provider initialization failed: {message}")]
    Init { message: String },

    #[error(transparent)]
    Ollama(#[from] OllamaError),

    #[error("{message}")]
    Failed { message: String },
}

impl CapabilityError {
    pub fn failed(message: impl Into<String>) -> Self {
        CapabilityError::Failed {
            message: message.into(),
        }
    }
}

/// Ollama client errors
#[derive(Error, Debug)]
pub enum OllamaError {
    #[error("Connection failed to Ollama at {url}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Model not found: {model}")]
    ModelNotFound { model: String },

    #[error("Generation failed (status {status}): {message}")]
    Generation { status: u16, message: String },

    #[error("Invalid response from Ollama")]
    InvalidResponse(#[source] reqwest::Error),
}

/// API error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::DocumentNotFound { .. } => StatusCode::NOT_FOUND,
            ServiceError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ServiceError::Remote(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable snake_case identifier, recorded as a failed job's `error_kind`.
    pub fn error_code(&self) -> &'static str {
        match self {
            ServiceError::DocumentNotFound { .. } => "document_not_found",
            ServiceError::Database(_) => "database_error",
            ServiceError::Pipeline(PipelineError::UnsupportedModality { .. }) => {
                "unsupported_modality"
            }
            ServiceError::Pipeline(PipelineError::FileRead { .. }) => "file_read_error",
            ServiceError::Pipeline(PipelineError::Extraction { .. }) => "extraction_failure",
            ServiceError::Pipeline(PipelineError::Summarization(_)) => "summarization_failure",
            ServiceError::Pipeline(PipelineError::Tagging(_)) => "tagging_failure",
            ServiceError::Pipeline(
                PipelineError::Embedding(_) | PipelineError::EmbeddingDimension { .. },
            ) => "embedding_failure",
            ServiceError::Pipeline(
                PipelineError::Persistence { .. } | PipelineError::JobNotActive { .. },
            ) => "persistence_failure",
            ServiceError::Remote(RemoteError::Timeout { .. }) => "remote_timeout",
            ServiceError::Remote(_) => "remote_failure",
            ServiceError::Storage { .. } => "storage_error",
            ServiceError::InvalidRequest { .. } => "invalid_request",
            ServiceError::Config { .. } => "config_error",
            ServiceError::Internal { .. } => "internal_error",
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code().to_string();

        let response = ErrorResponse {
            message: format_error_chain(&self),
            code: Some(code),
        };

        (status, Json(response)).into_response()
    }
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Render an error and all of its sources as a single `outer: inner: root` line.
pub fn format_error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        // Transparent wrappers repeat the inner message verbatim
        if !message.ends_with(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_chain_includes_sources() {
        let error = ServiceError::Pipeline(PipelineError::Extraction {
            modality: Modality::Audio,
            source: CapabilityError::failed("decoder crashed"),
        });

        assert_eq!(
            format_error_chain(&error),
            "Extraction failed for audio content: decoder crashed"
        );
        assert_eq!(error.error_code(), "extraction_failure");
    }

    #[test]
    fn test_remote_timeout_has_its_own_code() {
        let timeout = ServiceError::Remote(RemoteError::Timeout {
            remote_id: "r-1".to_string(),
            attempts: 3,
        });
        let failed = ServiceError::Remote(RemoteError::Failed {
            remote_id: "r-1".to_string(),
            message: "out of memory".to_string(),
        });

        assert_eq!(timeout.error_code(), "remote_timeout");
        assert_eq!(failed.error_code(), "remote_failure");
    }
}
