//! Language-model collaborator: trait seam plus an Ollama HTTP client.
//!
//! The model is only consulted when rule extraction cannot determine the
//! resource kind or provider. Transport problems, timeouts, 429 and 5xx
//! replies are transient; anything else is fatal for that call.

use crate::core::config::LlmSettings;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Language-model call failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LlmError {
    #[error("transient model error: {0}")]
    Transient(String),
    #[error("model error: {0}")]
    Fatal(String),
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Human-readable model identifier for logs.
    fn name(&self) -> &str;

    /// Complete a prompt, returning the raw text reply.
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Ollama generate API request body.
#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    format: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f64,
    num_predict: u32,
}

/// Ollama generate API response (only fields we need).
#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// Client for an Ollama-compatible `/api/generate` endpoint.
pub struct OllamaClient {
    client: reqwest::Client,
    settings: LlmSettings,
}

impl OllamaClient {
    pub fn new(settings: LlmSettings) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| format!("cannot build HTTP client: {}", e))?;
        Ok(Self { client, settings })
    }
}

#[async_trait]
impl LanguageModel for OllamaClient {
    fn name(&self) -> &str {
        &self.settings.model
    }

    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let url = format!("{}/api/generate", self.settings.endpoint.trim_end_matches('/'));
        let body = GenerateRequest {
            model: &self.settings.model,
            prompt,
            format: "json",
            stream: false,
            options: GenerateOptions {
                temperature: self.settings.temperature,
                num_predict: self.settings.max_tokens,
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transient(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::Transient(format!("model endpoint returned {}", status)));
        }
        if !status.is_success() {
            return Err(LlmError::Fatal(format!("model endpoint returned {}", status)));
        }

        let reply: GenerateResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Fatal(format!("unreadable model response: {}", e)))?;
        if reply.response.trim().is_empty() {
            return Err(LlmError::Fatal("model returned an empty response".to_string()));
        }
        Ok(reply.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> OllamaClient {
        OllamaClient::new(LlmSettings {
            enabled: true,
            endpoint: server.uri(),
            model: "codellama:7b".into(),
            temperature: 0.1,
            max_tokens: 256,
            timeout_secs: 1,
            max_retries: 0,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_llm_complete_ok() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(serde_json::json!({
                "model": "codellama:7b",
                "stream": false,
                "options": {"num_predict": 256}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "codellama:7b",
                "response": "{\"kind\": \"compute\"}",
                "done": true
            })))
            .mount(&server)
            .await;

        let reply = client_for(&server).complete("classify").await.unwrap();
        assert_eq!(reply, "{\"kind\": \"compute\"}");
    }

    #[tokio::test]
    async fn test_llm_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let err = client_for(&server).complete("x").await.unwrap_err();
        assert!(matches!(err, LlmError::Transient(_)));
    }

    #[tokio::test]
    async fn test_llm_client_error_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let err = client_for(&server).complete("x").await.unwrap_err();
        assert!(matches!(err, LlmError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_llm_timeout_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;
        let err = client_for(&server).complete("x").await.unwrap_err();
        assert!(matches!(err, LlmError::Transient(_)));
    }

    #[tokio::test]
    async fn test_llm_empty_response_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"response": "  "})),
            )
            .mount(&server)
            .await;
        let err = client_for(&server).complete("x").await.unwrap_err();
        assert_eq!(err, LlmError::Fatal("model returned an empty response".into()));
    }
}
