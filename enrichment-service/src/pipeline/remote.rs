//! Remote compute delegation.
//!
//! A document is submitted to `POST {endpoint}/run` and the returned job id
//! is polled at `GET {endpoint}/status/{id}`. A configured endpoint is never
//! bypassed: a payload that cannot be sent fails the job just like a failure
//! after submission, and only the log tells them apart.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::RemoteConfig;
use crate::db::SourceDocument;
use crate::error::{RemoteError, ServiceError, ServiceResult};
use crate::queue::JobHandle;

/// Progress range covered while waiting on the remote endpoint
const POLL_PROGRESS_START: u8 = 20;
const POLL_PROGRESS_END: u8 = 90;

/// Receives progress while a remote job is polled
pub trait ProgressReporter: Send {
    fn report(&mut self, percent: u8, message: &str) -> ServiceResult<()>;
}

impl ProgressReporter for JobHandle {
    fn report(&mut self, percent: u8, message: &str) -> ServiceResult<()> {
        JobHandle::report(self, percent, message)
    }
}

/// Document as sent to the remote handler
#[derive(Debug, Clone, Serialize)]
pub struct RemotePayload {
    pub document_id: String,
    pub filename: String,
    pub mime_type: String,
    /// Base64 encoded document bytes
    pub file_data: String,
}

impl RemotePayload {
    pub fn new(document: &SourceDocument, bytes: &[u8]) -> Self {
        Self {
            document_id: document.id.clone(),
            filename: document.filename.clone(),
            mime_type: document.mime_type.clone().unwrap_or_default(),
            file_data: BASE64.encode(bytes),
        }
    }
}

/// Remote job states. Anything unrecognised is treated as still running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteJobStatus {
    InQueue,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Output produced by the remote handler. Field aliases cover the names the
/// handler emits.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteOutput {
    #[serde(default, alias = "text")]
    pub main_text: String,
    #[serde(default, alias = "summary")]
    pub summary_text: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub labels: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub captions: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub modality: Option<String>,
    #[serde(default, alias = "metadata", deserialize_with = "null_as_default")]
    pub extra_metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default, alias = "processing_time")]
    pub processing_duration: Option<f64>,
    /// Set by the handler when processing failed inside the remote worker
    #[serde(default)]
    pub error: Option<String>,
}

/// Handlers emit `null` for empty collections
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// How a delegation ended
#[derive(Debug)]
pub enum DelegationOutcome {
    Completed(RemoteOutput),
    /// Nothing reached the endpoint
    NotSubmitted(ServiceError),
    /// The endpoint accepted or may have accepted the job
    PostSubmissionFailure(ServiceError),
}

#[derive(Serialize)]
struct RunRequest<'a> {
    input: &'a RemotePayload,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    id: String,
    #[serde(default)]
    status: RemoteJobStatus,
    #[serde(default)]
    output: Option<RemoteOutput>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    status: RemoteJobStatus,
    #[serde(default)]
    output: Option<RemoteOutput>,
    #[serde(default)]
    error: Option<String>,
}

/// Client for the remote compute endpoint
pub struct RemoteDelegate {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    poll_interval: Duration,
    max_attempts: u32,
    max_payload_bytes: usize,
}

impl RemoteDelegate {
    /// Build a delegate, or None when no endpoint is configured
    pub fn from_config(config: &RemoteConfig) -> ServiceResult<Option<Self>> {
        let Some(endpoint) = config.endpoint() else {
            return Ok(None);
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ServiceError::Config {
                message: format!("Failed to build remote HTTP client: {}", e),
            })?;

        Ok(Some(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            poll_interval: config.poll_interval(),
            max_attempts: config.max_attempts.max(1),
            max_payload_bytes: config.max_payload_bytes,
        }))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Submit the payload and wait for the remote job to finish
    pub async fn delegate(
        &self,
        payload: &RemotePayload,
        progress: &mut dyn ProgressReporter,
    ) -> DelegationOutcome {
        if payload.file_data.len() > self.max_payload_bytes {
            return DelegationOutcome::NotSubmitted(
                RemoteError::PayloadTooLarge {
                    size: payload.file_data.len(),
                    limit: self.max_payload_bytes,
                }
                .into(),
            );
        }

        let url = format!("{}/run", self.endpoint);
        let response = match self
            .authorized(self.client.post(&url))
            .json(&RunRequest { input: payload })
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_connect() => {
                return DelegationOutcome::NotSubmitted(
                    RemoteError::Connection { url, source: e }.into(),
                );
            }
            Err(e) => {
                return DelegationOutcome::PostSubmissionFailure(
                    RemoteError::Connection { url, source: e }.into(),
                );
            }
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return DelegationOutcome::PostSubmissionFailure(
                RemoteError::Submission { status, message }.into(),
            );
        }

        let run: RunResponse = match response.json().await {
            Ok(run) => run,
            Err(e) => {
                return DelegationOutcome::PostSubmissionFailure(
                    RemoteError::InvalidResponse(e).into(),
                );
            }
        };

        info!(
            remote_id = %run.id,
            doc_id = %payload.document_id,
            "Submitted document to remote endpoint"
        );

        // Synchronous handlers answer /run with the finished output
        if run.status == RemoteJobStatus::Completed
            && let Some(output) = run.output
        {
            return completed(&run.id, output);
        }

        self.poll_until_done(&run.id, progress).await
    }

    async fn poll_until_done(
        &self,
        remote_id: &str,
        progress: &mut dyn ProgressReporter,
    ) -> DelegationOutcome {
        for attempt in 1..=self.max_attempts {
            tokio::time::sleep(self.poll_interval).await;

            let status = match self.poll(remote_id).await {
                Ok(status) => status,
                Err(RemoteError::Status { status, message }) if status < 500 => {
                    return DelegationOutcome::PostSubmissionFailure(
                        RemoteError::Status { status, message }.into(),
                    );
                }
                // A body that fails to decode will not decode on the next poll either
                Err(RemoteError::InvalidResponse(e)) if e.is_decode() => {
                    return DelegationOutcome::PostSubmissionFailure(
                        RemoteError::InvalidResponse(e).into(),
                    );
                }
                Err(e) => {
                    warn!(remote_id, attempt, error = %e, "Remote status check failed, will retry");
                    continue;
                }
            };

            debug!(remote_id, attempt, status = ?status.status, "Remote job status");

            match status.status {
                RemoteJobStatus::Completed => {
                    return match status.output {
                        Some(output) => completed(remote_id, output),
                        None => DelegationOutcome::PostSubmissionFailure(
                            RemoteError::Failed {
                                remote_id: remote_id.to_string(),
                                message: "completed without output".to_string(),
                            }
                            .into(),
                        ),
                    };
                }
                RemoteJobStatus::Failed | RemoteJobStatus::Cancelled | RemoteJobStatus::TimedOut => {
                    let message = status
                        .error
                        .or_else(|| status.output.and_then(|o| o.error))
                        .unwrap_or_else(|| format!("remote status {:?}", status.status));
                    return DelegationOutcome::PostSubmissionFailure(
                        RemoteError::Failed {
                            remote_id: remote_id.to_string(),
                            message,
                        }
                        .into(),
                    );
                }
                RemoteJobStatus::InQueue | RemoteJobStatus::InProgress | RemoteJobStatus::Unknown => {
                    let message = if status.status == RemoteJobStatus::InQueue {
                        "Waiting for remote worker"
                    } else {
                        "Processing on remote worker"
                    };
                    if let Err(e) =
                        progress.report(poll_progress(attempt, self.max_attempts), message)
                    {
                        return DelegationOutcome::PostSubmissionFailure(e);
                    }
                }
            }
        }

        DelegationOutcome::PostSubmissionFailure(
            RemoteError::Timeout {
                remote_id: remote_id.to_string(),
                attempts: self.max_attempts,
            }
            .into(),
        )
    }

    async fn poll(&self, remote_id: &str) -> Result<StatusResponse, RemoteError> {
        let url = format!("{}/status/{}", self.endpoint, remote_id);

        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| RemoteError::Connection {
                url: url.clone(),
                source: e,
            })?;

        if !response.status().is_success() {
            return Err(RemoteError::Status {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        response.json().await.map_err(RemoteError::InvalidResponse)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

fn completed(remote_id: &str, output: RemoteOutput) -> DelegationOutcome {
    match output.error {
        Some(message) => DelegationOutcome::PostSubmissionFailure(
            RemoteError::Failed {
                remote_id: remote_id.to_string(),
                message,
            }
            .into(),
        ),
        None => DelegationOutcome::Completed(output),
    }
}

/// Map a poll attempt onto the remote progress range
fn poll_progress(attempt: u32, max_attempts: u32) -> u8 {
    let span = u32::from(POLL_PROGRESS_END - POLL_PROGRESS_START);
    let step = span * attempt.min(max_attempts) / max_attempts.max(1);
    POLL_PROGRESS_START + step as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct Recorder(Vec<u8>);

    impl ProgressReporter for Recorder {
        fn report(&mut self, percent: u8, _message: &str) -> ServiceResult<()> {
            self.0.push(percent);
            Ok(())
        }
    }

    fn delegate_for(endpoint: &str, max_attempts: u32) -> RemoteDelegate {
        let config = RemoteConfig {
            endpoint: Some(endpoint.to_string()),
            api_key: Some("secret".to_string()),
            poll_interval_ms: 5,
            max_attempts,
            request_timeout_secs: 5,
            max_payload_bytes: 1024,
        };
        RemoteDelegate::from_config(&config).unwrap().unwrap()
    }

    fn payload(bytes: &[u8]) -> RemotePayload {
        RemotePayload {
            document_id: "doc-1".to_string(),
            filename: "photo.jpg".to_string(),
            mime_type: "image/jpeg".to_string(),
            file_data: BASE64.encode(bytes),
        }
    }

    async fn mount_run(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/run"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"id": "r-1", "status": "IN_QUEUE"})),
            )
            .mount(server)
            .await;
    }

    #[test]
    fn test_no_endpoint_means_no_delegate() {
        assert!(
            RemoteDelegate::from_config(&RemoteConfig::default())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_poll_progress_stays_in_range() {
        assert_eq!(poll_progress(1, 70), 21);
        assert_eq!(poll_progress(70, 70), 90);
        assert_eq!(poll_progress(500, 70), 90);
        assert_eq!(poll_progress(1, 1), 90);
    }

    #[tokio::test]
    async fn test_completed_output_uses_handler_field_names() {
        let server = MockServer::start().await;
        mount_run(&server).await;
        Mock::given(method("GET"))
            .and(path("/status/r-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "COMPLETED",
                "output": {
                    "text": "a cat",
                    "summary": "cat photo",
                    "tags": ["cat"],
                    "metadata": {"has_text": false},
                    "processing_time": 1.5,
                    "modality": "image"
                }
            })))
            .mount(&server)
            .await;

        let delegate = delegate_for(&server.uri(), 5);
        let mut recorder = Recorder::default();
        let outcome = delegate.delegate(&payload(b"jpeg"), &mut recorder).await;

        let output = match outcome {
            DelegationOutcome::Completed(output) => output,
            other => panic!("expected completion, got {:?}", other),
        };
        assert_eq!(output.main_text, "a cat");
        assert_eq!(output.summary_text, "cat photo");
        assert_eq!(output.processing_duration, Some(1.5));
        assert_eq!(output.extra_metadata["has_text"], false);
    }

    #[tokio::test]
    async fn test_remote_failure_is_not_a_fallback() {
        let server = MockServer::start().await;
        mount_run(&server).await;
        Mock::given(method("GET"))
            .and(path("/status/r-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "FAILED",
                "error": "CUDA out of memory"
            })))
            .mount(&server)
            .await;

        let delegate = delegate_for(&server.uri(), 5);
        let outcome = delegate
            .delegate(&payload(b"jpeg"), &mut Recorder::default())
            .await;

        match outcome {
            DelegationOutcome::PostSubmissionFailure(e) => {
                assert_eq!(e.error_code(), "remote_failure");
                assert!(e.to_string().contains("CUDA out of memory"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exhausted_polling_times_out_with_progress() {
        let server = MockServer::start().await;
        mount_run(&server).await;
        Mock::given(method("GET"))
            .and(path("/status/r-1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"status": "IN_PROGRESS"})),
            )
            .mount(&server)
            .await;

        let delegate = delegate_for(&server.uri(), 3);
        let mut recorder = Recorder::default();
        let outcome = delegate.delegate(&payload(b"jpeg"), &mut recorder).await;

        match outcome {
            DelegationOutcome::PostSubmissionFailure(e) => {
                assert_eq!(e.error_code(), "remote_timeout")
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(recorder.0, vec![43, 66, 90]);
    }

    #[tokio::test]
    async fn test_oversized_payload_is_never_sent() {
        let server = MockServer::start().await;
        let delegate = delegate_for(&server.uri(), 3);

        let outcome = delegate
            .delegate(&payload(&[0u8; 2048]), &mut Recorder::default())
            .await;

        match outcome {
            DelegationOutcome::NotSubmitted(e) => {
                assert_eq!(e.error_code(), "remote_failure");
                assert!(e.to_string().contains("1024 byte"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_a_remote_failure() {
        // Nothing listens on port 1
        let delegate = delegate_for("http://127.0.0.1:1", 3);
        let outcome = delegate
            .delegate(&payload(b"jpeg"), &mut Recorder::default())
            .await;

        match outcome {
            DelegationOutcome::NotSubmitted(e) => assert_eq!(e.error_code(), "remote_failure"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_null_collections_decode_as_empty() {
        let server = MockServer::start().await;
        mount_run(&server).await;
        Mock::given(method("GET"))
            .and(path("/status/r-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "COMPLETED",
                "output": {
                    "text": "a cat",
                    "captions": null,
                    "tags": null,
                    "metadata": null,
                    "embedding": [0.5, 0.5]
                }
            })))
            .mount(&server)
            .await;

        let delegate = delegate_for(&server.uri(), 3);
        let outcome = delegate
            .delegate(&payload(b"jpeg"), &mut Recorder::default())
            .await;

        let output = match outcome {
            DelegationOutcome::Completed(output) => output,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(output.main_text, "a cat");
        assert!(output.captions.is_empty());
        assert!(output.tags.is_empty());
        assert!(output.extra_metadata.is_empty());
        assert_eq!(output.embedding, vec![0.5, 0.5]);
    }

    #[tokio::test]
    async fn test_undecodable_status_fails_without_retrying() {
        let server = MockServer::start().await;
        mount_run(&server).await;
        Mock::given(method("GET"))
            .and(path("/status/r-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "COMPLETED",
                "output": {"text": "a cat", "tags": 5}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let delegate = delegate_for(&server.uri(), 5);
        let mut recorder = Recorder::default();
        let outcome = delegate.delegate(&payload(b"jpeg"), &mut recorder).await;

        match outcome {
            DelegationOutcome::PostSubmissionFailure(e) => {
                assert_eq!(e.error_code(), "remote_failure")
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(recorder.0.is_empty());
        server.verify().await;
    }
}
