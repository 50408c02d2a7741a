//! Service configuration.
//!
//! Values come from an optional `config` file next to the binary and from
//! `ENRICHMENT__*` environment variables (e.g. `ENRICHMENT__REMOTE__ENDPOINT`).

mod loader;

pub use loader::load_config;

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::db::Backend;

/// Complete service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_server")]
    pub server: ServerConfig,

    #[serde(default = "default_storage")]
    pub storage: StorageConfig,

    #[serde(default = "default_queue")]
    pub queue: QueueConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default = "default_ollama")]
    pub ollama: OllamaConfig,

    #[serde(default = "default_pipeline")]
    pub pipeline: PipelineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            storage: default_storage(),
            queue: default_queue(),
            remote: RemoteConfig::default(),
            ollama: default_ollama(),
            pipeline: default_pipeline(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Optional auto-import directory. Files placed here are registered and
    /// enqueued; failures are moved to a failed/ subdirectory.
    #[serde(default)]
    pub auto_import_dir: Option<PathBuf>,
}

/// Job queue and worker pool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How long an idle worker sleeps before checking for work again
    #[serde(default = "default_queue_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Retention of finished jobs
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,

    /// Retention of failed jobs
    #[serde(default = "default_failure_ttl_secs")]
    pub failure_ttl_secs: u64,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Backend used when enqueue does not name one
    #[serde(default)]
    pub default_backend: Backend,
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn result_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.result_ttl_secs as i64)
    }

    pub fn failure_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.failure_ttl_secs as i64)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Remote (GPU offload) compute endpoint configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Base URL exposing `POST /run` and `GET /status/{id}`. Unset means
    /// remote jobs run locally.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_remote_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_remote_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_remote_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Payloads above this size are never submitted
    #[serde(default = "default_remote_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            poll_interval_ms: default_remote_poll_interval_ms(),
            max_attempts: default_remote_max_attempts(),
            request_timeout_secs: default_remote_request_timeout_secs(),
            max_payload_bytes: default_remote_max_payload_bytes(),
        }
    }
}

impl RemoteConfig {
    /// The endpoint with surrounding whitespace and trailing slashes removed,
    /// or None when not configured.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint
            .as_deref()
            .map(|e| e.trim().trim_end_matches('/'))
            .filter(|e| !e.is_empty())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Ollama configuration for the built-in capability providers
#[derive(Debug, Clone, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_url")]
    pub base_url: String,

    /// Model used for abstractive summaries. Empty means lead-text summaries.
    #[serde(default)]
    pub summary_model: String,

    /// Vision model for image captioning. Empty disables image extraction.
    #[serde(default = "default_vision_model")]
    pub vision_model: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    #[serde(default = "default_ollama_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Pipeline stage parameters
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_top_n_tags")]
    pub top_n_tags: usize,

    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    /// Hard cap on text handed to the summarizer
    #[serde(default = "default_max_summary_input_chars")]
    pub max_summary_input_chars: usize,

    /// Length of lead-text summaries
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,
}

// ==================== Default Value Functions ====================

fn default_server() -> ServerConfig {
    ServerConfig {
        host: default_host(),
        port: default_port(),
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_storage() -> StorageConfig {
    StorageConfig {
        data_dir: default_data_dir(),
        auto_import_dir: None,
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_queue() -> QueueConfig {
    QueueConfig {
        workers: default_workers(),
        poll_interval_ms: default_queue_poll_interval_ms(),
        result_ttl_secs: default_result_ttl_secs(),
        failure_ttl_secs: default_failure_ttl_secs(),
        cleanup_interval_secs: default_cleanup_interval_secs(),
        default_backend: Backend::default(),
    }
}

fn default_workers() -> usize {
    2
}

fn default_queue_poll_interval_ms() -> u64 {
    2000
}

fn default_result_ttl_secs() -> u64 {
    3600
}

fn default_failure_ttl_secs() -> u64 {
    86400
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

fn default_remote_poll_interval_ms() -> u64 {
    2000
}

fn default_remote_max_attempts() -> u32 {
    150
}

fn default_remote_request_timeout_secs() -> u64 {
    300
}

fn default_remote_max_payload_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_ollama() -> OllamaConfig {
    OllamaConfig {
        base_url: default_ollama_url(),
        summary_model: String::new(),
        vision_model: default_vision_model(),
        embedding_model: default_embedding_model(),
        request_timeout_secs: default_ollama_timeout_secs(),
    }
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_vision_model() -> String {
    "llava".to_string()
}

fn default_embedding_model() -> String {
    "bge-m3".to_string()
}

fn default_ollama_timeout_secs() -> u64 {
    120
}

fn default_pipeline() -> PipelineConfig {
    PipelineConfig {
        top_n_tags: default_top_n_tags(),
        embedding_dim: default_embedding_dim(),
        max_summary_input_chars: default_max_summary_input_chars(),
        summary_max_chars: default_summary_max_chars(),
    }
}

fn default_top_n_tags() -> usize {
    10
}

fn default_embedding_dim() -> usize {
    1024
}

fn default_max_summary_input_chars() -> usize {
    15000
}

fn default_summary_max_chars() -> usize {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_endpoint_normalization() {
        let mut remote = RemoteConfig::default();
        assert_eq!(remote.endpoint(), None);

        remote.endpoint = Some("   ".to_string());
        assert_eq!(remote.endpoint(), None);

        remote.endpoint = Some(" https://gpu.example.com/v2/abc/ ".to_string());
        assert_eq!(remote.endpoint(), Some("https://gpu.example.com/v2/abc"));
    }

    #[test]
    fn test_defaults_match_pipeline_contract() {
        let config = AppConfig::default();
        assert_eq!(config.pipeline.top_n_tags, 10);
        assert_eq!(config.pipeline.embedding_dim, 1024);
        assert_eq!(config.queue.default_backend, Backend::Local);
        assert_eq!(config.queue.result_ttl_secs, 3600);
        assert_eq!(config.queue.failure_ttl_secs, 86400);
    }
}
