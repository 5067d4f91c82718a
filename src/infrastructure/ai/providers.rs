//! HTTP model providers.
//!
//! Three backends share the provider port: a local OpenAI-compatible
//! inference endpoint, the Anthropic API, and the OpenAI API. The
//! planner tries them in configured order.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::streaming::{extract_delta_text, SseBuffer};
use crate::domain::errors::PlannerError;
use crate::domain::models::config::{AiConfig, ProviderConfig};
use crate::domain::ports::{CompletionRequest, ModelProvider, StreamProgress};

const ANTHROPIC_DEFAULT_ENDPOINT: &str = "https://api.anthropic.com";
const OPENAI_DEFAULT_ENDPOINT: &str = "https://api.openai.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Build the provider failover chain from configuration.
pub fn build_providers(config: &AiConfig) -> Vec<Arc<dyn ModelProvider>> {
    let timeout = Duration::from_secs(config.request_timeout_seconds);
    let mut providers: Vec<Arc<dyn ModelProvider>> = Vec::new();

    for entry in config.providers.iter().filter(|p| p.enabled) {
        match entry.kind.as_str() {
            "local" => providers.push(Arc::new(OpenAiCompatProvider::new(
                "local",
                entry,
                timeout,
            ))),
            "openai" => providers.push(Arc::new(OpenAiCompatProvider::new(
                "openai",
                entry,
                timeout,
            ))),
            "anthropic" => providers.push(Arc::new(AnthropicProvider::new(entry, timeout))),
            other => warn!(kind = other, "unknown provider kind, skipping"),
        }
    }

    info!(providers = providers.len(), "model providers configured");
    providers
}

fn api_key(entry: &ProviderConfig) -> Option<String> {
    if entry.api_key_env.is_empty() {
        return None;
    }
    std::env::var(&entry.api_key_env).ok().filter(|k| !k.is_empty())
}

/// Last `max_bytes` of `text`, nudged to a UTF-8 boundary.
fn tail_snippet(text: &str, max_bytes: usize) -> String {
    let mut start = text.len().saturating_sub(max_bytes);
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

/// OpenAI-compatible chat-completions backend; also fronts local
/// inference servers that speak the same protocol.
pub struct OpenAiCompatProvider {
    name: &'static str,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
    timeout: Duration,
}

impl OpenAiCompatProvider {
    pub fn new(name: &'static str, entry: &ProviderConfig, timeout: Duration) -> Self {
        let endpoint = if entry.endpoint.is_empty() {
            OPENAI_DEFAULT_ENDPOINT.to_string()
        } else {
            entry.endpoint.trim_end_matches('/').to_string()
        };
        Self {
            name,
            endpoint,
            model: entry.model.clone(),
            api_key: api_key(entry),
            client: http_client(timeout),
            timeout,
        }
    }

    fn request_body(&self, request: &CompletionRequest, stream: bool) -> Value {
        json!({
            "model": self.model,
            "messages": [{"role": "user", "content": request.prompt}],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": stream,
        })
    }

    fn builder(&self, stream: bool, request: &CompletionRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.endpoint))
            .json(&self.request_body(request, stream));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, PlannerError> {
        let response = self.builder(false, request).send().await.map_err(|e| {
            if e.is_timeout() {
                PlannerError::Timeout {
                    provider: self.name.into(),
                    seconds: self.timeout.as_secs(),
                }
            } else {
                PlannerError::RequestFailed {
                    provider: self.name.into(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PlannerError::BadStatus {
                provider: self.name.into(),
                status: status.as_u16(),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| PlannerError::MalformedResponse {
                provider: self.name.into(),
                reason: e.to_string(),
            })?;

        body.get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| PlannerError::MalformedResponse {
                provider: self.name.into(),
                reason: "no choices[0].message.content".into(),
            })
    }

    async fn complete_streaming(
        &self,
        request: &CompletionRequest,
        progress: Arc<RwLock<StreamProgress>>,
    ) -> Result<String, PlannerError> {
        let started = Instant::now();
        let response = self.builder(true, request).send().await.map_err(|e| {
            PlannerError::RequestFailed {
                provider: self.name.into(),
                reason: e.to_string(),
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PlannerError::BadStatus {
                provider: self.name.into(),
                status: status.as_u16(),
            });
        }

        let mut stream = response.bytes_stream();
        let mut buffer = SseBuffer::new();
        let mut text = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| PlannerError::RequestFailed {
                provider: self.name.into(),
                reason: e.to_string(),
            })?;
            for event in buffer.push(&String::from_utf8_lossy(&chunk)) {
                if let Some(delta) = extract_delta_text(&event) {
                    text.push_str(&delta);
                    let mut progress = progress.write().await;
                    progress.tokens_generated += 1;
                    progress.elapsed_seconds = started.elapsed().as_secs();
                    progress.last_snippet = tail_snippet(&text, 120);
                }
            }
        }

        {
            let mut progress = progress.write().await;
            progress.done = true;
            progress.elapsed_seconds = started.elapsed().as_secs();
        }

        if text.is_empty() {
            return Err(PlannerError::MalformedResponse {
                provider: self.name.into(),
                reason: "empty stream".into(),
            });
        }
        Ok(text)
    }

    fn supports_streaming(&self) -> bool {
        true
    }
}

/// Anthropic messages API backend.
pub struct AnthropicProvider {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
    timeout: Duration,
}

impl AnthropicProvider {
    pub fn new(entry: &ProviderConfig, timeout: Duration) -> Self {
        let endpoint = if entry.endpoint.is_empty() {
            ANTHROPIC_DEFAULT_ENDPOINT.to_string()
        } else {
            entry.endpoint.trim_end_matches('/').to_string()
        };
        Self {
            endpoint,
            model: entry.model.clone(),
            api_key: api_key(entry),
            client: http_client(timeout),
            timeout,
        }
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, PlannerError> {
        let mut builder = self
            .client
            .post(format!("{}/v1/messages", self.endpoint))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&json!({
                "model": self.model,
                "max_tokens": request.max_tokens,
                "temperature": request.temperature,
                "messages": [{"role": "user", "content": request.prompt}],
            }));
        if let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                PlannerError::Timeout {
                    provider: "anthropic".into(),
                    seconds: self.timeout.as_secs(),
                }
            } else {
                PlannerError::RequestFailed {
                    provider: "anthropic".into(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PlannerError::BadStatus {
                provider: "anthropic".into(),
                status: status.as_u16(),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| PlannerError::MalformedResponse {
                provider: "anthropic".into(),
                reason: e.to_string(),
            })?;

        body.get("content")
            .and_then(|content| content.get(0))
            .and_then(|block| block.get("text"))
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| PlannerError::MalformedResponse {
                provider: "anthropic".into(),
                reason: "no content[0].text".into(),
            })
    }

    async fn complete_streaming(
        &self,
        request: &CompletionRequest,
        progress: Arc<RwLock<StreamProgress>>,
    ) -> Result<String, PlannerError> {
        // No token streaming wired for this backend; run the request
        // to completion and mark progress done.
        let text = self.complete(request).await?;
        let mut progress = progress.write().await;
        progress.done = true;
        progress.last_snippet = tail_snippet(&text, 120);
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: &str, endpoint: &str) -> ProviderConfig {
        ProviderConfig {
            kind: kind.into(),
            endpoint: endpoint.into(),
            api_key_env: String::new(),
            model: "test-model".into(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_openai_compat_complete() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"content":"{\"ok\":true}"}}]}"#)
            .create_async()
            .await;

        let provider = OpenAiCompatProvider::new(
            "local",
            &entry("local", &server.url()),
            Duration::from_secs(5),
        );
        let text = provider
            .complete(&CompletionRequest::new("plan", 0.3))
            .await
            .unwrap();
        assert_eq!(text, "{\"ok\":true}");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_openai_compat_bad_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(503)
            .create_async()
            .await;

        let provider = OpenAiCompatProvider::new(
            "local",
            &entry("local", &server.url()),
            Duration::from_secs(5),
        );
        let err = provider
            .complete(&CompletionRequest::new("plan", 0.3))
            .await
            .unwrap_err();
        assert!(matches!(err, PlannerError::BadStatus { status: 503, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_anthropic_complete() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_body(r#"{"content":[{"type":"text","text":"hello"}]}"#)
            .create_async()
            .await;

        let provider =
            AnthropicProvider::new(&entry("anthropic", &server.url()), Duration::from_secs(5));
        let text = provider
            .complete(&CompletionRequest::new("plan", 0.3))
            .await
            .unwrap();
        assert_eq!(text, "hello");
    }

    #[tokio::test]
    async fn test_malformed_body_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(r#"{"unexpected": "shape"}"#)
            .create_async()
            .await;

        let provider = OpenAiCompatProvider::new(
            "local",
            &entry("local", &server.url()),
            Duration::from_secs(5),
        );
        let err = provider
            .complete(&CompletionRequest::new("plan", 0.3))
            .await
            .unwrap_err();
        assert!(matches!(err, PlannerError::MalformedResponse { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_build_providers_skips_disabled_and_unknown() {
        let config = AiConfig {
            providers: vec![
                entry("local", "http://127.0.0.1:8080"),
                ProviderConfig {
                    enabled: false,
                    ..entry("openai", "")
                },
                entry("carrier-pigeon", ""),
            ],
            ..AiConfig::default()
        };
        let providers = build_providers(&config);
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].name(), "local");
    }
}
