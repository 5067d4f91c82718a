//! Model provider port.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::errors::PlannerError;

/// A single completion request to a model backend.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>, temperature: f64) -> Self {
        Self {
            prompt: prompt.into(),
            temperature,
            max_tokens: 2000,
        }
    }
}

/// Shared streaming progress the notifier polls at its own cadence.
#[derive(Debug, Clone, Default)]
pub struct StreamProgress {
    pub tokens_generated: u64,
    pub last_snippet: String,
    pub elapsed_seconds: u64,
    pub done: bool,
}

/// A language-model backend. Providers are tried in configured order;
/// non-2xx responses, malformed output, and timeouts advance the
/// planner to the next provider.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Run a completion to completion and return the raw text.
    async fn complete(&self, request: &CompletionRequest) -> Result<String, PlannerError>;

    /// Run a completion with token streaming, updating `progress` as
    /// tokens arrive. Dropping the returned future cancels the
    /// underlying request.
    async fn complete_streaming(
        &self,
        request: &CompletionRequest,
        progress: Arc<RwLock<StreamProgress>>,
    ) -> Result<String, PlannerError>;

    /// Whether this provider supports token streaming.
    fn supports_streaming(&self) -> bool {
        false
    }
}
