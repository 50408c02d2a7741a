//! Document registration and result lookup.

use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::info;
use uuid::Uuid;

use super::EnrichmentService;
use crate::db::{NewDocument, NormalizedResult, SourceDocument};
use crate::error::{ServiceError, ServiceResult};

/// Hex encoded SHA-256 of some content
pub fn compute_content_hash(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Replace path separators and other characters that are unsafe in filenames
fn sanitize_filename(filename: &str) -> String {
    let name = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");

    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

impl EnrichmentService {
    /// Store document bytes under `data_dir/documents` and register the
    /// document as `uploaded`
    pub async fn register_document(
        &self,
        content: &[u8],
        filename: &str,
        mime_type: Option<&str>,
    ) -> ServiceResult<SourceDocument> {
        let checksum = compute_content_hash(content);

        let docs_dir = self.config.storage.data_dir.join("documents");
        tokio::fs::create_dir_all(&docs_dir)
            .await
            .map_err(|e| ServiceError::Storage {
                path: docs_dir.display().to_string(),
                source: e,
            })?;

        let stored_path = docs_dir.join(format!(
            "{}_{}",
            Uuid::new_v4(),
            sanitize_filename(filename)
        ));
        tokio::fs::write(&stored_path, content)
            .await
            .map_err(|e| ServiceError::Storage {
                path: stored_path.display().to_string(),
                source: e,
            })?;

        let document = self.db.insert_document(&NewDocument {
            filename: filename.to_string(),
            mime_type: mime_type.map(str::to_string),
            size_bytes: content.len() as u64,
            storage_locator: stored_path.to_string_lossy().to_string(),
            checksum: Some(checksum),
        })?;

        info!(
            doc_id = %document.id,
            filename = %document.filename,
            size = document.size_bytes,
            "Document registered"
        );

        Ok(document)
    }

    /// All normalized results for a document, oldest first
    pub fn results_for_document(&self, document_id: &str) -> ServiceResult<Vec<NormalizedResult>> {
        if self.db.get_document(document_id)?.is_none() {
            return Err(ServiceError::DocumentNotFound {
                document_id: document_id.to_string(),
            });
        }
        self.db.results_for_document(document_id)
    }
}
