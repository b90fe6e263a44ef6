//! # ModelProvider
//!
//! Stateless adapter around the Gemini file + generation REST API. Three
//! operations: upload a local video (waiting for the file to go ACTIVE),
//! generate the tag payload for one dimension over the uploaded handle, and
//! best-effort delete of the remote file. Every call runs under the
//! model-provider retry policy; the JSON-well-formedness gate lives here so
//! a flaky response is replayed instead of failing the dimension outright.

use std::path::Path;
use std::time;

use serde_json::json;
use thiserror::Error;
use tracing::info;

use tagger_common::retry::Retrier;
use tagger_common::task::Dimension;

use crate::prompts::PromptStore;

/// Fixed decoding parameters for every generation request.
const TOP_P: f64 = 0.95;
const TEMPERATURE: f64 = 1.0;
const MAX_OUTPUT_TOKENS: u32 = 8192;

const USER_PROMPT: &str =
    "Understand the video content and generate tags according to the rules.";

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("request to the model provider failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("model provider responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("uploaded file {name} never became active, last state {state}")]
    FileNotActive { name: String, state: String },
    #[error("model returned an empty response body")]
    EmptyResponse,
    #[error("model response is not well-formed JSON: {0}")]
    MalformedJson(serde_json::Error),
    #[error("unexpected response shape: {0}")]
    UnexpectedShape(String),
    #[error("failed to read local file: {0}")]
    LocalFile(#[from] std::io::Error),
}

/// Transient network trouble, throttling, and bad-but-replayable responses
/// are retryable; everything else is surfaced.
pub fn is_retryable(error: &ProviderError) -> bool {
    match error {
        ProviderError::Request(err) => {
            err.is_timeout() || err.is_connect() || err.is_body() || err.is_decode()
        }
        ProviderError::Status { status, .. } => matches!(status, 429 | 503),
        ProviderError::FileNotActive { .. } => true,
        ProviderError::EmptyResponse => true,
        ProviderError::MalformedJson(_) => true,
        ProviderError::UnexpectedShape(_) => false,
        ProviderError::LocalFile(_) => false,
    }
}

/// A remote file handle as returned by the upload endpoint.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub uri: String,
    pub mime_type: String,
    pub state: String,
}

pub struct ModelProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    prompts: PromptStore,
    retrier: Retrier,
    upload_wait: time::Duration,
    poll_interval: time::Duration,
}

impl ModelProvider {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        prompts: PromptStore,
        request_timeout: time::Duration,
        upload_wait: time::Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent("vision-tagger worker")
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key: api_key.to_owned(),
            model: model.to_owned(),
            prompts,
            retrier: Retrier::build(10, time::Duration::from_secs(1))
                .exponential_backoff(false)
                .jitter(false)
                .provide(),
            upload_wait,
            poll_interval: time::Duration::from_secs(1),
        })
    }

    /// Transmit the file, then poll until the provider reports it ACTIVE.
    /// The readiness wait is bounded; a file stuck in PROCESSING past the
    /// bound fails the upload.
    pub async fn upload(&self, path: &Path) -> Result<UploadedFile, ProviderError> {
        let bytes = tokio::fs::read(path).await?;
        let mime_type = mime_type_for(path);

        let mut file = self
            .retrier
            .run(
                || async { self.transmit(bytes.clone(), &mime_type).await },
                is_retryable,
            )
            .await?;

        let deadline = tokio::time::Instant::now() + self.upload_wait;
        while file.state != "ACTIVE" {
            if tokio::time::Instant::now() >= deadline {
                return Err(ProviderError::FileNotActive {
                    name: file.name,
                    state: file.state,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
            let name = file.name.clone();
            file = self
                .retrier
                .run(|| async { self.fetch_file(&name).await }, is_retryable)
                .await?;
        }

        Ok(file)
    }

    /// One generation call for one dimension over the uploaded handle.
    /// Returns the response text verbatim; an empty or non-JSON body is a
    /// retryable provider error, so the worker only ever parses bodies that
    /// passed the gate here.
    pub async fn generate(
        &self,
        file: &UploadedFile,
        dimension: Dimension,
    ) -> Result<String, ProviderError> {
        let system_prompt = self.prompts.system_prompt(dimension);
        self.retrier
            .run(
                || async { self.generate_once(file, system_prompt).await },
                is_retryable,
            )
            .await
    }

    /// Best-effort delete of the remote file.
    pub async fn delete(&self, file: &UploadedFile) -> Result<(), ProviderError> {
        self.retrier
            .run(
                || async {
                    let url = format!("{}/v1beta/{}", self.base_url, file.name);
                    let response = self
                        .client
                        .delete(&url)
                        .header("x-goog-api-key", &self.api_key)
                        .send()
                        .await?;
                    // Deletes answer with an empty body; only the status matters.
                    let status = response.status();
                    if !status.is_success() {
                        let body = response.text().await.unwrap_or_default();
                        return Err(ProviderError::Status {
                            status: status.as_u16(),
                            body,
                        });
                    }
                    Ok(())
                },
                is_retryable,
            )
            .await
    }

    async fn transmit(
        &self,
        bytes: Vec<u8>,
        mime_type: &str,
    ) -> Result<UploadedFile, ProviderError> {
        let url = format!("{}/upload/v1beta/files", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .header("X-Goog-Upload-Protocol", "raw")
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .body(bytes)
            .send()
            .await?;
        let body = check_status(response).await?;
        parse_uploaded_file(body.get("file").unwrap_or(&body))
    }

    async fn fetch_file(&self, name: &str) -> Result<UploadedFile, ProviderError> {
        let url = format!("{}/v1beta/{}", self.base_url, name);
        let response = self
            .client
            .get(&url)
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await?;
        let body = check_status(response).await?;
        parse_uploaded_file(&body)
    }

    async fn generate_once(
        &self,
        file: &UploadedFile,
        system_prompt: &str,
    ) -> Result<String, ProviderError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );
        let request = json!({
            "systemInstruction": {"parts": [{"text": system_prompt}]},
            "contents": [{
                "role": "user",
                "parts": [
                    {"fileData": {"fileUri": file.uri, "mimeType": file.mime_type}},
                    {"text": USER_PROMPT},
                ],
            }],
            "generationConfig": {
                "topP": TOP_P,
                "temperature": TEMPERATURE,
                "maxOutputTokens": MAX_OUTPUT_TOKENS,
                "responseMimeType": "application/json",
            },
        });

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await?;
        let body = check_status(response).await?;

        if let Some(tokens) = body
            .pointer("/usageMetadata/totalTokenCount")
            .and_then(serde_json::Value::as_u64)
        {
            info!(tokens, "generation finished");
            metrics::counter!("tagger_model_tokens_total").increment(tokens);
        }

        let text = extract_text(&body)?;
        // The single well-formedness gate: downstream code may parse this
        // string without re-checking.
        serde_json::from_str::<serde_json::Value>(text.trim())
            .map_err(ProviderError::MalformedJson)?;
        Ok(text)
    }
}

async fn check_status(response: reqwest::Response) -> Result<serde_json::Value, ProviderError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::Status {
            status: status.as_u16(),
            body,
        });
    }
    let body = response.text().await?;
    if body.trim().is_empty() {
        return Err(ProviderError::EmptyResponse);
    }
    serde_json::from_str(&body).map_err(ProviderError::MalformedJson)
}

/// Pull the concatenated candidate text out of a generateContent response.
fn extract_text(body: &serde_json::Value) -> Result<String, ProviderError> {
    let parts = body
        .pointer("/candidates/0/content/parts")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| {
            ProviderError::UnexpectedShape("response has no candidate parts".to_owned())
        })?;

    let text: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(serde_json::Value::as_str))
        .collect();

    if text.trim().is_empty() {
        return Err(ProviderError::EmptyResponse);
    }
    Ok(text)
}

fn parse_uploaded_file(value: &serde_json::Value) -> Result<UploadedFile, ProviderError> {
    let name = value
        .get("name")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ProviderError::UnexpectedShape("file has no name".to_owned()))?;
    let uri = value
        .get("uri")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default();
    let mime_type = value
        .get("mimeType")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("video/mp4");
    let state = value
        .get("state")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("PROCESSING");

    Ok(UploadedFile {
        name: name.to_owned(),
        uri: uri.to_owned(),
        mime_type: mime_type.to_owned(),
        state: state.to_owned(),
    })
}

fn mime_type_for(path: &Path) -> String {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_lowercase();
    match extension.as_str() {
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "wav" => "audio/wav",
        _ => "video/mp4",
    }
    .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_text_concatenates_parts() {
        let body = json!({
            "candidates": [{
                "content": {
                    "parts": [
                        {"text": "{\"scene\": "},
                        {"text": "\"indoor\"}"},
                    ]
                }
            }]
        });
        assert_eq!(extract_text(&body).unwrap(), "{\"scene\": \"indoor\"}");
    }

    #[test]
    fn test_extract_text_rejects_empty_candidates() {
        let body = json!({"candidates": []});
        assert!(matches!(
            extract_text(&body),
            Err(ProviderError::UnexpectedShape(_))
        ));

        let blank = json!({
            "candidates": [{"content": {"parts": [{"text": "  "}]}}]
        });
        assert!(matches!(
            extract_text(&blank),
            Err(ProviderError::EmptyResponse)
        ));
    }

    #[test]
    fn test_parse_uploaded_file() {
        let body = json!({
            "name": "files/abc123",
            "uri": "https://generativelanguage.googleapis.com/v1beta/files/abc123",
            "mimeType": "video/mp4",
            "state": "PROCESSING",
        });
        let file = parse_uploaded_file(&body).unwrap();
        assert_eq!(file.name, "files/abc123");
        assert_eq!(file.state, "PROCESSING");

        assert!(parse_uploaded_file(&json!({"state": "ACTIVE"})).is_err());
    }

    #[test]
    fn test_mime_type_for() {
        assert_eq!(mime_type_for(Path::new("a/b/v.mp4")), "video/mp4");
        assert_eq!(mime_type_for(Path::new("v.MOV")), "video/quicktime");
        assert_eq!(mime_type_for(Path::new("v.wav")), "audio/wav");
        assert_eq!(mime_type_for(Path::new("mystery")), "video/mp4");
    }

    #[test]
    fn test_classifier() {
        assert!(is_retryable(&ProviderError::EmptyResponse));
        assert!(is_retryable(&ProviderError::Status {
            status: 429,
            body: String::new()
        }));
        assert!(is_retryable(&ProviderError::Status {
            status: 503,
            body: String::new()
        }));
        assert!(is_retryable(&ProviderError::FileNotActive {
            name: "files/x".to_owned(),
            state: "PROCESSING".to_owned()
        }));
        let parse_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        assert!(is_retryable(&ProviderError::MalformedJson(parse_err)));

        assert!(!is_retryable(&ProviderError::Status {
            status: 400,
            body: String::new()
        }));
        assert!(!is_retryable(&ProviderError::Status {
            status: 403,
            body: String::new()
        }));
        assert!(!is_retryable(&ProviderError::UnexpectedShape(
            "nope".to_owned()
        )));
    }
}
