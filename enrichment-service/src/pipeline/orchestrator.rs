//! Per-job processing state machine.
//!
//! Checkpoints: Loading (5) -> routing (15) -> extracting (20-40) ->
//! summarizing (50-60) -> tagging (65-75) -> embedding (80-90) ->
//! persisting (95) -> done (100). A failure at any stage fails the job with
//! its progress left where it was; nothing partial is persisted.

use chrono::Utc;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::execution::ExecutionPlan;
use super::remote::{DelegationOutcome, RemoteOutput, RemotePayload};
use super::sink;
use crate::capabilities::{CapabilityRegistry, dedupe_tags};
use crate::config::PipelineConfig;
use crate::db::{Database, DocumentStatus, NormalizedResult, SourceDocument};
use crate::error::{PipelineError, ServiceError, ServiceResult, format_error_chain};
use crate::queue::JobHandle;
use crate::routing::{Modality, Route, classify};

/// Main text for an image with neither visible text nor captions
const EMPTY_IMAGE_TEXT: &str = "image without text";

pub struct Orchestrator {
    db: Arc<Database>,
    capabilities: Arc<CapabilityRegistry>,
    pipeline: PipelineConfig,
}

/// A document whose bytes are in memory and whose modality is known
struct LoadedDocument {
    document: SourceDocument,
    bytes: Vec<u8>,
    route: Route,
}

impl Orchestrator {
    pub fn new(
        db: Arc<Database>,
        capabilities: Arc<CapabilityRegistry>,
        pipeline: PipelineConfig,
    ) -> Self {
        Self {
            db,
            capabilities,
            pipeline,
        }
    }

    /// Drive one job to `finished` or `failed`
    pub async fn run(&self, mut handle: JobHandle, plan: &ExecutionPlan) -> ServiceResult<()> {
        let started = Instant::now();
        let mut document_touched = false;

        let outcome = self
            .process(&mut handle, plan, started, &mut document_touched)
            .await;

        match outcome {
            Ok(()) => {
                info!(
                    job_id = %handle.id(),
                    doc_id = %handle.document_id(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Job finished"
                );
                handle.finished();
                Ok(())
            }
            Err(e) => {
                error!(
                    job_id = %handle.id(),
                    doc_id = %handle.document_id(),
                    progress = handle.progress(),
                    error_kind = e.error_code(),
                    error = %format_error_chain(&e),
                    "Job failed"
                );
                let job_id = handle.id().to_string();
                if let Err(store_error) = handle.fail(&e, document_touched) {
                    error!(
                        job_id = %job_id,
                        error = %format_error_chain(&store_error),
                        "Failed to record job failure"
                    );
                }
                Err(e)
            }
        }
    }

    async fn process(
        &self,
        handle: &mut JobHandle,
        plan: &ExecutionPlan,
        started: Instant,
        document_touched: &mut bool,
    ) -> ServiceResult<()> {
        let loaded = self.load(handle, document_touched).await?;

        let result = match plan {
            ExecutionPlan::Local => self.enrich(handle, &loaded, started).await?,
            ExecutionPlan::LocalFallback { reason } => {
                info!(job_id = %handle.id(), reason = %reason, "Remote backend unavailable, running locally");
                self.enrich(handle, &loaded, started).await?
            }
            ExecutionPlan::Remote(delegate) => {
                let payload = RemotePayload::new(&loaded.document, &loaded.bytes);
                match delegate.delegate(&payload, handle).await {
                    DelegationOutcome::Completed(output) => {
                        self.remote_result(handle.id(), &loaded, output, started)?
                    }
                    DelegationOutcome::NotSubmitted(e) => {
                        warn!(job_id = %handle.id(), endpoint = %delegate.endpoint(), "Document was not sent to the remote endpoint");
                        return Err(e);
                    }
                    DelegationOutcome::PostSubmissionFailure(e) => return Err(e),
                }
            }
        };

        handle.report(95, "Persisting result")?;
        sink::persist(handle, &result)
    }

    /// Loading and routing stages
    async fn load(
        &self,
        handle: &mut JobHandle,
        document_touched: &mut bool,
    ) -> ServiceResult<LoadedDocument> {
        handle.report(5, "Loading document")?;

        let document = self.db.get_document(handle.document_id())?.ok_or_else(|| {
            ServiceError::DocumentNotFound {
                document_id: handle.document_id().to_string(),
            }
        })?;

        self.db
            .update_document_status(&document.id, DocumentStatus::Processing)?;
        *document_touched = true;

        handle.report(10, "Reading file")?;
        let bytes = tokio::fs::read(&document.storage_locator)
            .await
            .map_err(|e| PipelineError::FileRead {
                locator: document.storage_locator.clone(),
                source: e,
            })?;

        handle.report(15, "Detecting modality")?;
        let route = classify(&document.filename, document.mime_type.as_deref());
        if route.modality == Modality::Unknown {
            let warning = PipelineError::UnsupportedModality {
                filename: document.filename.clone(),
            };
            warn!(job_id = %handle.id(), doc_id = %document.id, "{}", warning);
        }

        info!(
            job_id = %handle.id(),
            doc_id = %document.id,
            modality = %route.modality,
            reason = %route.reason,
            size = bytes.len(),
            "Document routed"
        );

        Ok(LoadedDocument {
            document,
            bytes,
            route,
        })
    }

    /// Local extraction, summarization, tagging and embedding
    async fn enrich(
        &self,
        handle: &mut JobHandle,
        loaded: &LoadedDocument,
        started: Instant,
    ) -> ServiceResult<NormalizedResult> {
        let modality = loaded.route.modality;
        let top_n = self.pipeline.top_n_tags;

        // Extracting
        handle.report(20, "Extracting content")?;
        let extraction_error = |source| PipelineError::Extraction { modality, source };
        let extractor = self
            .capabilities
            .extractor(modality.extraction_modality())
            .get()
            .await
            .map_err(extraction_error)?;
        let extraction = extractor
            .extract(&loaded.bytes, &loaded.document.filename)
            .await
            .map_err(extraction_error)?;
        let captions = extraction.captions;
        let (main_text, extra_metadata) =
            shape_extraction(modality, extraction.text, &captions, extraction.metadata);
        handle.report(40, "Content extracted")?;

        // Summarizing
        handle.report(50, "Summarizing")?;
        let summarizer = self
            .capabilities
            .summarizer
            .get()
            .await
            .map_err(PipelineError::Summarization)?;
        let summary = summarizer
            .summarize(&main_text)
            .await
            .map_err(PipelineError::Summarization)?;
        handle.report(60, "Summary ready")?;

        // Tagging
        handle.report(65, "Extracting tags")?;
        let tagger = self
            .capabilities
            .tagger
            .get()
            .await
            .map_err(PipelineError::Tagging)?;
        let tags = tagger
            .extract_tags(&main_text, &summary, &captions, top_n)
            .await
            .map_err(PipelineError::Tagging)?;
        let tags = dedupe_tags(tags, top_n);
        handle.report(75, "Tags ready")?;

        // Embedding
        handle.report(80, "Embedding")?;
        let embedder = self
            .capabilities
            .embedder
            .get()
            .await
            .map_err(PipelineError::Embedding)?;
        if embedder.dimension() != self.pipeline.embedding_dim {
            return Err(PipelineError::EmbeddingDimension {
                expected: self.pipeline.embedding_dim,
                actual: embedder.dimension(),
            }
            .into());
        }
        let embedding = embedder
            .embed(&main_text, &summary, &tags)
            .await
            .map_err(PipelineError::Embedding)?;
        self.check_dimension(&embedding)?;
        handle.report(90, "Embedding ready")?;

        Ok(NormalizedResult {
            id: Uuid::new_v4().to_string(),
            document_id: loaded.document.id.clone(),
            job_id: handle.id().to_string(),
            modality,
            source_filename: loaded.document.filename.clone(),
            source_mime: loaded.document.mime_type.clone(),
            main_text,
            summary_text: summary,
            tags,
            labels: Vec::new(),
            captions,
            embedding,
            extra_metadata,
            processing_duration: started.elapsed().as_secs_f64(),
            created_at: Utc::now(),
        })
    }

    /// Normalize remote output into the same shape as a local result
    fn remote_result(
        &self,
        job_id: &str,
        loaded: &LoadedDocument,
        output: RemoteOutput,
        started: Instant,
    ) -> ServiceResult<NormalizedResult> {
        self.check_dimension(&output.embedding)?;

        let modality = output
            .modality
            .as_deref()
            .and_then(|m| m.parse::<Modality>().ok())
            .unwrap_or(loaded.route.modality);

        Ok(NormalizedResult {
            id: Uuid::new_v4().to_string(),
            document_id: loaded.document.id.clone(),
            job_id: job_id.to_string(),
            modality,
            source_filename: loaded.document.filename.clone(),
            source_mime: loaded.document.mime_type.clone(),
            main_text: output.main_text,
            summary_text: output.summary_text,
            tags: dedupe_tags(output.tags, self.pipeline.top_n_tags),
            labels: output.labels,
            captions: output.captions,
            embedding: output.embedding,
            extra_metadata: output.extra_metadata,
            processing_duration: output
                .processing_duration
                .unwrap_or_else(|| started.elapsed().as_secs_f64()),
            created_at: Utc::now(),
        })
    }

    fn check_dimension(&self, embedding: &[f32]) -> ServiceResult<()> {
        if embedding.len() != self.pipeline.embedding_dim {
            return Err(PipelineError::EmbeddingDimension {
                expected: self.pipeline.embedding_dim,
                actual: embedding.len(),
            }
            .into());
        }
        Ok(())
    }
}

/// Build the result's main text and fill in the metadata keys each
/// modality always carries
fn shape_extraction(
    modality: Modality,
    text: String,
    captions: &[String],
    mut metadata: Map<String, Value>,
) -> (String, Map<String, Value>) {
    match modality {
        Modality::Image => {
            let visible_text = text.trim();
            let parts: Vec<&str> = std::iter::once(visible_text)
                .chain(captions.iter().map(|c| c.trim()))
                .filter(|part| !part.is_empty())
                .collect();

            metadata.insert("has_text".to_string(), json!(!visible_text.is_empty()));
            metadata.insert("caption_count".to_string(), json!(captions.len()));

            let main_text = if parts.is_empty() {
                EMPTY_IMAGE_TEXT.to_string()
            } else {
                parts.join(" | ")
            };
            (main_text, metadata)
        }
        Modality::Audio | Modality::Video => {
            metadata
                .entry("duration_seconds")
                .or_insert(Value::Null);
            metadata.entry("language").or_insert(Value::Null);
            if modality == Modality::Video {
                metadata.insert("has_video".to_string(), json!(true));
            }
            (text, metadata)
        }
        Modality::Text => {
            metadata.entry("source_type").or_insert(json!("txt"));
            metadata.entry("pages").or_insert(Value::Null);
            (text, metadata)
        }
        // Extracted as text, but nothing is known about the source format
        Modality::Unknown => (text, metadata),
    }
}
