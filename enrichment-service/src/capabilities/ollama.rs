//! Capability providers backed by a local Ollama server.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{
    Embedder, Extraction, Extractor, Summarizer, normalize, search_text, truncate_chars,
};
use crate::error::CapabilityError;
use crate::ollama::{ChatMessage, OllamaClient};

/// Paragraphs are packed into chunks of at most this many characters
const SUMMARY_CHUNK_CHARS: usize = 4000;

const SUMMARY_PROMPT: &str = "Summarize the following text in a few sentences. \
Reply with the summary only, in the language of the text.\n\n";

const CAPTION_PROMPT: &str = "Describe this image in one or two sentences.";

const VISIBLE_TEXT_PROMPT: &str = "Transcribe any text visible in this image exactly. \
If there is no text, reply with NONE.";

/// Abstractive summarizer. Chunk failures are skipped; when every chunk
/// fails the lead of the text is returned instead.
pub struct OllamaSummarizer {
    client: Arc<OllamaClient>,
    model: String,
    max_input_chars: usize,
    fallback_chars: usize,
}

impl OllamaSummarizer {
    /// Create the summarizer after checking the model is installed
    pub async fn connect(
        client: Arc<OllamaClient>,
        model: String,
        max_input_chars: usize,
        fallback_chars: usize,
    ) -> Result<Self, CapabilityError> {
        client.ensure_model(&model).await?;
        Ok(Self {
            client,
            model,
            max_input_chars,
            fallback_chars,
        })
    }
}

#[async_trait]
impl Summarizer for OllamaSummarizer {
    async fn summarize(&self, text: &str) -> Result<String, CapabilityError> {
        let text = truncate_chars(text.trim(), self.max_input_chars);
        if text.is_empty() {
            return Ok(String::new());
        }

        let mut summaries = Vec::new();
        for (index, chunk) in paragraph_chunks(text, SUMMARY_CHUNK_CHARS)
            .into_iter()
            .enumerate()
        {
            let prompt = format!("{}{}", SUMMARY_PROMPT, chunk);
            match self
                .client
                .generate_simple(&self.model, vec![ChatMessage::user(prompt)])
                .await
            {
                Ok(summary) if !summary.trim().is_empty() => {
                    summaries.push(summary.trim().to_string())
                }
                Ok(_) => debug!(chunk = index, "Empty chunk summary"),
                Err(e) => warn!(chunk = index, error = %e, "Chunk summarization failed"),
            }
        }

        let summary = summaries.join("\n");
        if summary.is_empty() {
            return Ok(truncate_chars(text, self.fallback_chars).to_string());
        }
        Ok(summary)
    }
}

/// Pack non-empty lines into chunks of at most `max_chars`. A single line
/// longer than that becomes its own truncated chunk.
fn paragraph_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in text.lines().map(str::trim).filter(|p| !p.is_empty()) {
        let needed = if current.is_empty() {
            paragraph.chars().count()
        } else {
            current.chars().count() + 1 + paragraph.chars().count()
        };

        if needed <= max_chars {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(paragraph);
            continue;
        }

        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if paragraph.chars().count() > max_chars {
            chunks.push(truncate_chars(paragraph, max_chars).to_string());
        } else {
            current.push_str(paragraph);
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Image extractor using a vision model for a caption and visible text
pub struct OllamaImageCaptioner {
    client: Arc<OllamaClient>,
    model: String,
}

impl OllamaImageCaptioner {
    pub async fn connect(client: Arc<OllamaClient>, model: String) -> Result<Self, CapabilityError> {
        client.ensure_model(&model).await?;
        Ok(Self { client, model })
    }

    async fn ask(&self, prompt: &str, image: &str) -> Result<String, CapabilityError> {
        let reply = self
            .client
            .generate_simple(
                &self.model,
                vec![ChatMessage::user_with_image(prompt, image.to_string())],
            )
            .await?;
        Ok(reply.trim().to_string())
    }
}

#[async_trait]
impl Extractor for OllamaImageCaptioner {
    async fn extract(&self, bytes: &[u8], filename: &str) -> Result<Extraction, CapabilityError> {
        let image = BASE64.encode(bytes);

        let caption = self.ask(CAPTION_PROMPT, &image).await?;
        let visible_text = self.ask(VISIBLE_TEXT_PROMPT, &image).await?;
        let visible_text = if visible_text.eq_ignore_ascii_case("none") {
            String::new()
        } else {
            visible_text
        };

        debug!(
            filename,
            caption_len = caption.len(),
            text_len = visible_text.len(),
            "Captioned image"
        );

        Ok(Extraction {
            text: visible_text,
            captions: if caption.is_empty() {
                Vec::new()
            } else {
                vec![caption]
            },
            metadata: serde_json::Map::new(),
        })
    }
}

/// Embedder for the search text built from text, summary and tags
pub struct OllamaEmbedder {
    client: Arc<OllamaClient>,
    model: String,
    dimension: usize,
}

impl OllamaEmbedder {
    pub async fn connect(
        client: Arc<OllamaClient>,
        model: String,
        dimension: usize,
    ) -> Result<Self, CapabilityError> {
        client.ensure_model(&model).await?;
        Ok(Self {
            client,
            model,
            dimension,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(
        &self,
        text: &str,
        summary: &str,
        tags: &[String],
    ) -> Result<Vec<f32>, CapabilityError> {
        let input = search_text(text, summary, tags);
        if input.is_empty() {
            return Ok(vec![0.0; self.dimension]);
        }

        let mut vector = self.client.embed(&self.model, &input).await?;
        normalize(&mut vector);
        Ok(vector)
    }
}
