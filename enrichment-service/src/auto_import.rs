//! Auto-import directory worker.
//!
//! Polls a configured directory (recursively) for files with a routable
//! extension, registers each as a document and queues it with the default
//! backend. Imported and duplicate files are removed from the drop
//! directory; files that fail to import are moved to `failed/`, keeping
//! their relative path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ServiceError, ServiceResult, format_error_chain};
use crate::routing::is_known_extension;
use crate::service::{EnrichmentService, compute_content_hash};

/// Subdirectory for files that could not be imported (case-insensitive)
const FAILED_DIRECTORY: &str = "failed";

const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// What happened to one dropped file
#[derive(Debug, PartialEq, Eq)]
enum ImportOutcome {
    Queued { document_id: String, job_id: String },
    Duplicate { existing_id: String },
    Failed,
}

/// Start the auto-import worker for `dir`. Files are handled one at a time.
pub fn start_auto_import_worker(
    service: Arc<EnrichmentService>,
    dir: PathBuf,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(path = %dir.display(), "Auto-import worker started");

        if let Err(e) = std::fs::create_dir_all(dir.join(FAILED_DIRECTORY)) {
            error!(error = %e, "Failed to create auto-import failed directory, worker stopping");
            return;
        }

        while !shutdown.is_cancelled() {
            let idle = match import_next(&service, &dir).await {
                // More files may be waiting
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!(error = %format_error_chain(&e), "Auto-import scan failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
            }
        }

        info!("Auto-import worker stopped");
    })
}

/// Import the first pending file in path order. Returns None when the
/// directory holds nothing importable.
async fn import_next(
    service: &EnrichmentService,
    dir: &Path,
) -> ServiceResult<Option<ImportOutcome>> {
    let mut files = Vec::new();
    collect_files(dir, dir, &mut files).map_err(|e| ServiceError::Storage {
        path: dir.display().to_string(),
        source: e,
    })?;

    files.sort();
    let Some(file_path) = files.into_iter().next() else {
        return Ok(None);
    };
    let display_path = file_path
        .strip_prefix(dir)
        .unwrap_or(&file_path)
        .display()
        .to_string();

    debug!(file = %display_path, "Importing dropped file");

    let outcome = match import_file(service, &file_path).await {
        Ok(outcome) => {
            match &outcome {
                ImportOutcome::Queued {
                    document_id,
                    job_id,
                } => {
                    info!(file = %display_path, doc_id = %document_id, job_id = %job_id, "Auto-imported document queued");
                }
                ImportOutcome::Duplicate { existing_id } => {
                    info!(file = %display_path, existing_doc_id = %existing_id, "Skipped duplicate file");
                }
                ImportOutcome::Failed => {}
            }
            if let Err(e) = std::fs::remove_file(&file_path) {
                warn!(file = %display_path, error = %e, "Failed to delete imported file");
            }
            outcome
        }
        Err(e) => {
            error!(file = %display_path, error = %format_error_chain(&e), "Auto-import failed");
            move_to_failed(&file_path, dir);
            ImportOutcome::Failed
        }
    };

    remove_empty_parents(file_path.parent(), dir);
    Ok(Some(outcome))
}

/// Register a file as a document and queue it, unless identical bytes are
/// already registered.
async fn import_file(service: &EnrichmentService, path: &Path) -> ServiceResult<ImportOutcome> {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");

    let content = tokio::fs::read(path)
        .await
        .map_err(|e| ServiceError::Storage {
            path: path.display().to_string(),
            source: e,
        })?;

    if let Some(existing_id) = service
        .db
        .find_document_by_checksum(&compute_content_hash(&content))?
    {
        return Ok(ImportOutcome::Duplicate { existing_id });
    }

    let document = service.register_document(&content, filename, None).await?;
    let receipt = service.enqueue(&document.id, None)?;

    Ok(ImportOutcome::Queued {
        document_id: receipt.document_id,
        job_id: receipt.job_id,
    })
}

/// Collect importable files below `dir`, skipping the root-level failed/ directory.
fn collect_files(dir: &Path, root: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)?.filter_map(|e| e.ok()) {
        let path = entry.path();

        if path.is_dir() {
            if path.parent() == Some(root)
                && let Some(name) = path.file_name().and_then(|n| n.to_str())
                && name.eq_ignore_ascii_case(FAILED_DIRECTORY)
            {
                continue;
            }
            collect_files(&path, root, files)?;
        } else if path.is_file()
            && let Some(name) = path.file_name().and_then(|n| n.to_str())
            && is_known_extension(name)
        {
            files.push(path);
        }
    }

    Ok(())
}

fn move_to_failed(file_path: &Path, root: &Path) {
    let relative = file_path.strip_prefix(root).unwrap_or(file_path);
    let dest = root.join(FAILED_DIRECTORY).join(relative);

    if let Some(parent) = dest.parent()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        warn!(dest = %parent.display(), error = %e, "Failed to create directory in failed/");
        return;
    }

    if let Err(e) = std::fs::rename(file_path, &dest) {
        // Cross-filesystem moves need copy and delete
        debug!(file = %file_path.display(), error = %e, "Rename into failed/ failed, copying");
        if let Err(e) = std::fs::copy(file_path, &dest) {
            warn!(file = %file_path.display(), error = %e, "Failed to copy file to failed/, leaving in place");
            return;
        }
        if let Err(e) = std::fs::remove_file(file_path) {
            warn!(file = %file_path.display(), error = %e, "Failed to delete original after copy");
        }
    }
}

/// Remove now-empty directories between `start` and `root` (exclusive)
fn remove_empty_parents(start: Option<&Path>, root: &Path) {
    let mut current = start;

    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        if dir
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.eq_ignore_ascii_case(FAILED_DIRECTORY))
        {
            break;
        }
        // Fails on non-empty directories, which ends the climb
        if std::fs::remove_dir(dir).is_err() {
            break;
        }
        debug!(dir = %dir.display(), "Removed empty directory");
        current = dir.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::{Database, DocumentStatus};
    use crate::queue::ExternalStatus;

    fn service(data_dir: &Path) -> EnrichmentService {
        let mut config = AppConfig::default();
        config.storage.data_dir = data_dir.to_path_buf();
        let db = Arc::new(Database::open_in_memory().unwrap());
        EnrichmentService::new(config, db).unwrap()
    }

    #[tokio::test]
    async fn test_imports_queue_and_remove_files() {
        let data = tempfile::tempdir().unwrap();
        let drop = tempfile::tempdir().unwrap();
        let service = service(data.path());

        std::fs::create_dir_all(drop.path().join("nested")).unwrap();
        std::fs::write(drop.path().join("nested/notes.txt"), b"meeting notes").unwrap();
        std::fs::write(drop.path().join("ignored.xyz"), b"not routable").unwrap();

        let outcome = import_next(&service, drop.path()).await.unwrap().unwrap();
        let (document_id, job_id) = match outcome {
            ImportOutcome::Queued {
                document_id,
                job_id,
            } => (document_id, job_id),
            other => panic!("expected a queued import, got {:?}", other),
        };

        let document = service.db.get_document(&document_id).unwrap().unwrap();
        assert_eq!(document.filename, "notes.txt");
        assert_eq!(document.status, DocumentStatus::Queued);
        assert_eq!(service.get_job_status(&job_id).status, ExternalStatus::Queued);

        assert!(!drop.path().join("nested").exists());
        assert!(drop.path().join("ignored.xyz").exists());
        assert!(import_next(&service, drop.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_content_is_skipped() {
        let data = tempfile::tempdir().unwrap();
        let drop = tempfile::tempdir().unwrap();
        let service = service(data.path());

        let first = service
            .register_document(b"same bytes", "a.txt", None)
            .await
            .unwrap();
        std::fs::write(drop.path().join("b.txt"), b"same bytes").unwrap();

        let outcome = import_next(&service, drop.path()).await.unwrap();
        assert_eq!(
            outcome,
            Some(ImportOutcome::Duplicate {
                existing_id: first.id
            })
        );
        assert!(!drop.path().join("b.txt").exists());
        assert_eq!(service.get_queue_stats().unwrap().queued, 0);
    }

    #[tokio::test]
    async fn test_failed_import_moves_to_failed_dir() {
        let data = tempfile::tempdir().unwrap();
        let drop = tempfile::tempdir().unwrap();
        // data_dir is a file, so storing the document fails
        let blocker = data.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let service = service(&blocker);

        std::fs::create_dir_all(drop.path().join("inbox")).unwrap();
        std::fs::write(drop.path().join("inbox/photo.jpg"), b"jpeg").unwrap();

        let outcome = import_next(&service, drop.path()).await.unwrap();
        assert_eq!(outcome, Some(ImportOutcome::Failed));
        assert!(drop.path().join("failed/inbox/photo.jpg").exists());
        assert!(!drop.path().join("inbox").exists());

        // failed/ is never rescanned
        assert!(import_next(&service, drop.path()).await.unwrap().is_none());
    }
}
