//! Capability providers and the registry that hands them to the pipeline.
//!
//! Each content-understanding step (extraction per modality, summarization,
//! tagging, embedding) sits behind an async trait. The registry holds one
//! slot per capability; a slot either wraps a ready instance or a factory
//! that runs at most once per process, on first use.

mod extract;
mod keywords;
mod lead;
mod ollama;
mod unavailable;

pub use extract::DocumentTextExtractor;
pub use keywords::KeywordTagger;
pub use lead::LeadSummarizer;
pub use ollama::{OllamaEmbedder, OllamaImageCaptioner, OllamaSummarizer};
pub use unavailable::UnavailableExtractor;

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

use crate::config::AppConfig;
use crate::error::{CapabilityError, ServiceError, ServiceResult};
use crate::ollama::OllamaClient;
use crate::routing::Modality;

/// Output of an extractor
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub text: String,
    pub captions: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Turns raw document bytes into text, captions and modality metadata
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, bytes: &[u8], filename: &str) -> Result<Extraction, CapabilityError>;
}

/// Produces a summary. Must return an empty string for empty input.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str) -> Result<String, CapabilityError>;
}

#[async_trait]
pub trait TagExtractor: Send + Sync {
    async fn extract_tags(
        &self,
        text: &str,
        summary: &str,
        captions: &[String],
        top_n: usize,
    ) -> Result<Vec<String>, CapabilityError>;
}

/// Produces fixed-dimension vectors. Empty input yields a zero vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    async fn embed(
        &self,
        text: &str,
        summary: &str,
        tags: &[String],
    ) -> Result<Vec<f32>, CapabilityError>;
}

type Factory<T> =
    Box<dyn Fn() -> BoxFuture<'static, Result<Arc<T>, CapabilityError>> + Send + Sync>;

/// Single-flight holder for one capability provider.
///
/// Concurrent first callers share one initialization; a failed
/// initialization leaves the slot empty so a later call can retry.
pub struct ProviderSlot<T: ?Sized> {
    name: &'static str,
    cell: OnceCell<Arc<T>>,
    factory: Option<Factory<T>>,
}

impl<T: ?Sized + Send + Sync> ProviderSlot<T> {
    /// Slot initialized by `factory` on first use
    pub fn lazy<F, Fut>(name: &'static str, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<T>, CapabilityError>> + Send + 'static,
    {
        Self {
            name,
            cell: OnceCell::new(),
            factory: Some(Box::new(move || Box::pin(factory()))),
        }
    }

    /// Slot holding an already constructed provider
    pub fn ready(name: &'static str, provider: Arc<T>) -> Self {
        Self {
            name,
            cell: OnceCell::new_with(Some(provider)),
            factory: None,
        }
    }

    /// Get the provider, initializing it if this is the first use
    pub async fn get(&self) -> Result<Arc<T>, CapabilityError> {
        let provider = self
            .cell
            .get_or_try_init(|| async {
                let Some(factory) = &self.factory else {
                    return Err(CapabilityError::Init {
                        message: format!("no provider registered for {}", self.name),
                    });
                };
                info!(provider = self.name, "Initializing capability provider");
                factory().await
            })
            .await?;

        Ok(Arc::clone(provider))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the provider has been constructed
    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }
}

/// Process-wide capability providers
pub struct CapabilityRegistry {
    pub text: ProviderSlot<dyn Extractor>,
    pub image: ProviderSlot<dyn Extractor>,
    pub audio: ProviderSlot<dyn Extractor>,
    pub video: ProviderSlot<dyn Extractor>,
    pub summarizer: ProviderSlot<dyn Summarizer>,
    pub tagger: ProviderSlot<dyn TagExtractor>,
    pub embedder: ProviderSlot<dyn Embedder>,
}

impl CapabilityRegistry {
    /// Build the default providers for this configuration. Nothing is
    /// contacted until a provider is first used.
    pub fn from_config(config: &AppConfig) -> ServiceResult<Self> {
        let ollama = Arc::new(OllamaClient::new(&config.ollama).map_err(|e| {
            ServiceError::Config {
                message: format!("Invalid Ollama client configuration: {}", e),
            }
        })?);
        let pipeline = config.pipeline.clone();

        let image = if config.ollama.vision_model.is_empty() {
            ProviderSlot::ready(
                "image",
                Arc::new(UnavailableExtractor::new(
                    "image captioning",
                    "no vision model configured",
                )) as Arc<dyn Extractor>,
            )
        } else {
            let client = Arc::clone(&ollama);
            let model = config.ollama.vision_model.clone();
            ProviderSlot::lazy("image", move || {
                let client = Arc::clone(&client);
                let model = model.clone();
                async move {
                    let captioner = OllamaImageCaptioner::connect(client, model).await?;
                    Ok(Arc::new(captioner) as Arc<dyn Extractor>)
                }
            })
        };

        let summarizer = if config.ollama.summary_model.is_empty() {
            ProviderSlot::ready(
                "summarizer",
                Arc::new(LeadSummarizer::new(
                    pipeline.summary_max_chars,
                    pipeline.max_summary_input_chars,
                )) as Arc<dyn Summarizer>,
            )
        } else {
            let client = Arc::clone(&ollama);
            let model = config.ollama.summary_model.clone();
            let pipeline = pipeline.clone();
            ProviderSlot::lazy("summarizer", move || {
                let client = Arc::clone(&client);
                let model = model.clone();
                let pipeline = pipeline.clone();
                async move {
                    let summarizer = OllamaSummarizer::connect(
                        client,
                        model,
                        pipeline.max_summary_input_chars,
                        pipeline.summary_max_chars,
                    )
                    .await?;
                    Ok(Arc::new(summarizer) as Arc<dyn Summarizer>)
                }
            })
        };

        let embedder = {
            let client = Arc::clone(&ollama);
            let model = config.ollama.embedding_model.clone();
            let dimension = pipeline.embedding_dim;
            ProviderSlot::lazy("embedder", move || {
                let client = Arc::clone(&client);
                let model = model.clone();
                async move {
                    let embedder = OllamaEmbedder::connect(client, model, dimension).await?;
                    Ok(Arc::new(embedder) as Arc<dyn Embedder>)
                }
            })
        };

        Ok(Self {
            text: ProviderSlot::lazy("text", || async {
                Ok(Arc::new(DocumentTextExtractor::new()) as Arc<dyn Extractor>)
            }),
            image,
            audio: ProviderSlot::ready(
                "audio",
                Arc::new(UnavailableExtractor::new(
                    "audio transcription",
                    "no speech-to-text provider configured",
                )) as Arc<dyn Extractor>,
            ),
            video: ProviderSlot::ready(
                "video",
                Arc::new(UnavailableExtractor::new(
                    "video transcription",
                    "no speech-to-text provider configured",
                )) as Arc<dyn Extractor>,
            ),
            summarizer,
            tagger: ProviderSlot::ready(
                "tagger",
                Arc::new(KeywordTagger::new()) as Arc<dyn TagExtractor>,
            ),
            embedder,
        })
    }

    /// Load state of every provider slot, keyed by slot name
    pub fn loaded_providers(&self) -> BTreeMap<&'static str, bool> {
        [
            (self.text.name(), self.text.is_loaded()),
            (self.image.name(), self.image.is_loaded()),
            (self.audio.name(), self.audio.is_loaded()),
            (self.video.name(), self.video.is_loaded()),
            (self.summarizer.name(), self.summarizer.is_loaded()),
            (self.tagger.name(), self.tagger.is_loaded()),
            (self.embedder.name(), self.embedder.is_loaded()),
        ]
        .into_iter()
        .collect()
    }

    /// Extractor slot for a routed modality
    pub fn extractor(&self, modality: Modality) -> &ProviderSlot<dyn Extractor> {
        match modality {
            Modality::Text | Modality::Unknown => &self.text,
            Modality::Image => &self.image,
            Modality::Audio => &self.audio,
            Modality::Video => &self.video,
        }
    }
}

/// Deduplicate tags case-insensitively, keeping the first spelling and the
/// original order, capped at `top_n`.
pub fn dedupe_tags<I>(tags: I, top_n: usize) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    let mut unique = Vec::new();

    for tag in tags {
        let tag = tag.trim();
        if tag.is_empty() || !seen.insert(tag.to_lowercase()) {
            continue;
        }
        unique.push(tag.to_string());
        if unique.len() == top_n {
            break;
        }
    }

    unique
}

/// Text handed to the embedding model: summary, tags, and a text snippet
/// when the summary is short, joined with ` | `.
pub fn search_text(text: &str, summary: &str, tags: &[String]) -> String {
    let mut parts = Vec::new();

    if !summary.trim().is_empty() {
        parts.push(summary.trim().to_string());
    }
    if !tags.is_empty() {
        parts.push(tags.join(", "));
    }
    if summary.chars().count() < 200 && !text.trim().is_empty() {
        parts.push(truncate_chars(text.trim(), 500).to_string());
    }

    parts.join(" | ")
}

/// Scale a vector to unit length. Zero vectors are left as they are.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Longest prefix of `text` with at most `max_chars` characters
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
