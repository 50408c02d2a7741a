use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::OllamaConfig;
use crate::error::OllamaError;

/// Ollama API client shared by the built-in capability providers
pub struct OllamaClient {
    client: Client,
    base_url: String,
}

impl OllamaClient {
    /// Create a new Ollama client
    pub fn new(config: &OllamaConfig) -> Result<Self, OllamaError> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| OllamaError::Connection {
                url: base_url.clone(),
                source: e,
            })?;

        Ok(Self { client, base_url })
    }

    /// Fail with `ModelNotFound` unless the model is installed.
    /// A bare name matches any tag of that model.
    pub async fn ensure_model(&self, model: &str) -> Result<(), OllamaError> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| OllamaError::Connection {
                url: url.clone(),
                source: e,
            })?;

        if !response.status().is_success() {
            return Err(OllamaError::Generation {
                status: response.status().as_u16(),
                message: "Failed to list models".to_string(),
            });
        }

        let tags: TagsResponse = response.json().await.map_err(OllamaError::InvalidResponse)?;

        let installed = tags.models.iter().any(|m| {
            m.name == model || (!model.contains(':') && m.name.split(':').next() == Some(model))
        });

        debug!(model, installed, available = tags.models.len(), "Checked Ollama model");
        if installed {
            Ok(())
        } else {
            Err(OllamaError::ModelNotFound {
                model: model.to_string(),
            })
        }
    }

    /// Generate a non-streaming chat response
    pub async fn generate_simple(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<String, OllamaError> {
        let url = format!("{}/api/chat", self.base_url);

        let request = OllamaChatRequest {
            model: model.to_string(),
            messages,
            stream: false,
            options: Some(OllamaOptions {
                temperature: Some(0.3),
            }),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| OllamaError::Connection {
                url: url.clone(),
                source: e,
            })?;

        if !response.status().is_success() {
            return Err(Self::status_error(model, response).await);
        }

        let chat_response: OllamaChatResponse =
            response.json().await.map_err(OllamaError::InvalidResponse)?;

        Ok(chat_response.message.content)
    }

    /// Embed a single input string
    pub async fn embed(&self, model: &str, input: &str) -> Result<Vec<f32>, OllamaError> {
        let url = format!("{}/api/embed", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&OllamaEmbedRequest { model, input })
            .send()
            .await
            .map_err(|e| OllamaError::Connection {
                url: url.clone(),
                source: e,
            })?;

        if !response.status().is_success() {
            return Err(Self::status_error(model, response).await);
        }

        let embed_response: OllamaEmbedResponse =
            response.json().await.map_err(OllamaError::InvalidResponse)?;

        embed_response
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| OllamaError::Generation {
                status: 200,
                message: "Embedding response contained no vectors".to_string(),
            })
    }

    async fn status_error(model: &str, response: reqwest::Response) -> OllamaError {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();

        if message.contains("model") && message.contains("not found") {
            return OllamaError::ModelNotFound {
                model: model.to_string(),
            };
        }

        OllamaError::Generation { status, message }
    }
}

/// Chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    /// Base64-encoded images for vision models
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            images: None,
        }
    }

    /// Create a user message with an image for vision models
    pub fn user_with_image(content: impl Into<String>, image_base64: String) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            images: Some(vec![image_base64]),
        }
    }
}

// Internal Ollama API types

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> OllamaClient {
        let config = OllamaConfig {
            base_url: server.uri(),
            summary_model: String::new(),
            vision_model: "llava".to_string(),
            embedding_model: "bge-m3".to_string(),
            request_timeout_secs: 5,
        };
        OllamaClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_ensure_model_matches_untagged_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "models": [{"name": "bge-m3:latest"}]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert!(client.ensure_model("bge-m3").await.is_ok());
        assert!(matches!(
            client.ensure_model("llava").await,
            Err(OllamaError::ModelNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_embed_returns_first_vector() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": [[0.1, 0.2, 0.3]]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let vector = client.embed("bge-m3", "hello").await.unwrap();
        assert_eq!(vector, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn test_missing_model_error_is_recognized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(404).set_body_string("model \"llava\" not found"),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client
            .generate_simple("llava", vec![ChatMessage::user("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, OllamaError::ModelNotFound { .. }));
    }
}
