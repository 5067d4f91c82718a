//! Planner: builds prompts, drives the model backends, and parses
//! structured plans.
//!
//! Providers are tried in configured order. A provider fails over on
//! non-2xx status, malformed JSON (after markdown-fence stripping),
//! or timeout. Each provider call runs under the shared pacing gate
//! and an exponential retry policy. Dropping a planning future
//! cancels the in-flight provider request.

use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::domain::errors::PlannerError;
use crate::domain::models::batch::RemediationBatch;
use crate::domain::models::plan::{FixStrategy, RemediationPlan};
use crate::domain::models::{EventSource, SecurityEvent};
use crate::domain::ports::{CompletionRequest, ModelProvider, StreamProgress};
use crate::infrastructure::ai::{RequestGate, RetryPolicy};

/// Prior attempt context carried into re-planning prompts.
#[derive(Debug, Clone)]
pub struct PriorAttempt {
    pub strategy: String,
    pub result: String,
    pub error: Option<String>,
}

pub struct Planner {
    providers: Vec<Arc<dyn ModelProvider>>,
    gate: RequestGate,
    retry: RetryPolicy,
    temperature: f64,
    progress: Arc<RwLock<StreamProgress>>,
}

impl Planner {
    pub fn new(
        providers: Vec<Arc<dyn ModelProvider>>,
        gate: RequestGate,
        retry: RetryPolicy,
        temperature: f64,
    ) -> Self {
        Self {
            providers,
            gate,
            retry,
            // Focused output for structured plans.
            temperature: temperature.min(0.3),
            progress: Arc::new(RwLock::new(StreamProgress::default())),
        }
    }

    /// Streaming progress record for live status rendering.
    pub fn progress(&self) -> Arc<RwLock<StreamProgress>> {
        self.progress.clone()
    }

    /// Produce a coordinated plan for a whole batch.
    pub async fn plan(
        &self,
        batch: &RemediationBatch,
        prior_attempts: &[PriorAttempt],
    ) -> Result<RemediationPlan, PlannerError> {
        let prompt = Self::build_plan_prompt(batch, prior_attempts);
        let raw = self.complete_with_failover(&prompt).await?;
        let (text, provider) = raw;

        let mut plan = Self::parse_plan(&text).ok_or_else(|| PlannerError::MalformedResponse {
            provider: provider.clone(),
            reason: "response did not contain a valid plan".into(),
        })?;
        plan.model = provider;
        info!(
            phases = plan.phases.len(),
            confidence = plan.confidence,
            "coordinated plan produced"
        );
        Ok(plan)
    }

    /// Produce a narrower single-event strategy. Falls back to a
    /// canned per-source strategy when every provider fails.
    pub async fn strategy(
        &self,
        event: &SecurityEvent,
        prior_attempts: &[PriorAttempt],
    ) -> FixStrategy {
        let prompt = Self::build_strategy_prompt(event, prior_attempts);
        match self.complete_with_failover(&prompt).await {
            Ok((text, _)) => Self::parse_strategy(&text)
                .unwrap_or_else(|| Self::fallback_strategy(event.source)),
            Err(e) => {
                warn!(error = %e, "strategy generation failed, using fallback");
                Self::fallback_strategy(event.source)
            }
        }
    }

    /// General-purpose summarization (change notes).
    pub async fn summarize(&self, text: &str) -> Result<String, PlannerError> {
        let prompt = format!(
            "Summarize the following repository changes for a non-technical \
             audience. Group related changes; keep it under 10 bullet points.\n\n{text}"
        );
        let (summary, _) = self.complete_with_failover(&prompt).await?;
        Ok(summary.trim().to_string())
    }

    /// Try each provider in order under the gate + retry policy.
    async fn complete_with_failover(
        &self,
        prompt: &str,
    ) -> Result<(String, String), PlannerError> {
        if self.providers.is_empty() {
            return Err(PlannerError::NoProviders);
        }

        {
            let mut progress = self.progress.write().await;
            *progress = StreamProgress::default();
        }

        let request = CompletionRequest::new(prompt, self.temperature);
        let mut last_error = String::new();

        for provider in &self.providers {
            let attempt = self
                .retry
                .execute(|| async {
                    self.gate.acquire().await;
                    if provider.supports_streaming() {
                        provider
                            .complete_streaming(&request, self.progress.clone())
                            .await
                    } else {
                        provider.complete(&request).await
                    }
                })
                .await;

            match attempt {
                Ok(text) => return Ok((text, provider.name().to_string())),
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "provider failed, trying next");
                    last_error = format!("{}: {e}", provider.name());
                }
            }
        }

        Err(PlannerError::AllProvidersFailed(last_error))
    }

    fn build_plan_prompt(batch: &RemediationBatch, prior_attempts: &[PriorAttempt]) -> String {
        let mut prompt = format!(
            "# Coordinated Security Remediation\n\n\
             You are a senior security engineer producing ONE coordinated \
             remediation plan.\n\n\
             - Analyze all {count} events TOGETHER.\n\
             - Detect dependencies and conflicts between fixes.\n\
             - Produce a single sequential pipeline of phases.\n\n\
             ## Events in batch:\n",
            count = batch.len()
        );

        for (i, event) in batch.events.iter().enumerate() {
            let details =
                serde_json::to_string_pretty(&event.details).unwrap_or_else(|_| "{}".into());
            prompt.push_str(&format!(
                "\n### Event {n}: {source} ({severity})\n```\n{details}\n```\n",
                n = i + 1,
                source = event.source,
                severity = event.severity,
            ));
        }

        if !prior_attempts.is_empty() {
            prompt.push_str("\n## Previous failed attempts:\n");
            for (i, attempt) in prior_attempts.iter().enumerate() {
                prompt.push_str(&format!(
                    "\nAttempt {n}:\n- Strategy: {}\n- Result: {}\n- Error: {}\n",
                    attempt.strategy,
                    attempt.result,
                    attempt.error.as_deref().unwrap_or("N/A"),
                    n = i + 1,
                ));
            }
            prompt.push_str("\nLearn from these failures and adjust the plan.\n");
        }

        prompt.push_str(
            "\n## Output\n\
             Respond with JSON only:\n\
             {\n\
               \"description\": \"one-line plan summary\",\n\
               \"confidence\": 0.XX,\n\
               \"estimated_duration_minutes\": NN,\n\
               \"requires_restart\": true|false,\n\
               \"phases\": [\n\
                 {\"name\": \"Phase 1: ...\", \"description\": \"...\",\n\
                  \"steps\": [\"...\"], \"estimated_minutes\": N}\n\
               ],\n\
               \"rollback_plan\": \"how rollback works\"\n\
             }\n",
        );
        prompt
    }

    fn build_strategy_prompt(event: &SecurityEvent, prior_attempts: &[PriorAttempt]) -> String {
        let details = serde_json::to_string_pretty(&event.details).unwrap_or_else(|_| "{}".into());
        let mut prompt = format!(
            "You are a security engineer producing a fix strategy.\n\n\
             **Source:** {source}\n**Severity:** {severity}\n\n\
             ## Event details:\n```\n{details}\n```\n",
            source = event.source,
            severity = event.severity,
        );

        if !prior_attempts.is_empty() {
            prompt.push_str("\n## Previous failed attempts:\n");
            for attempt in prior_attempts {
                prompt.push_str(&format!(
                    "- {} -> {} ({})\n",
                    attempt.strategy,
                    attempt.result,
                    attempt.error.as_deref().unwrap_or("no error recorded"),
                ));
            }
        }

        prompt.push_str(
            "\nRespond with JSON only:\n\
             {\"description\": \"...\", \"confidence\": 0.XX,\n\
              \"steps\": [\"...\"], \"analysis\": \"...\"}\n",
        );
        prompt
    }

    /// Extract JSON from either the raw body or a fenced code block.
    fn extract_json(content: &str) -> Option<String> {
        let fence = Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").ok()?;
        if let Some(captures) = fence.captures(content) {
            return Some(captures.get(1)?.as_str().to_string());
        }
        // Fall back to the outermost braces in the raw body.
        let start = content.find('{')?;
        let end = content.rfind('}')?;
        (end > start).then(|| content[start..=end].to_string())
    }

    /// Coerce a `confidence` field that may arrive as number or string.
    fn coerce_confidence(value: &Value) -> Option<f64> {
        match value.get("confidence")? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().trim_end_matches('%').parse::<f64>().ok(),
            _ => None,
        }
    }

    fn parse_plan(content: &str) -> Option<RemediationPlan> {
        let json = Self::extract_json(content)?;
        let mut value: Value = serde_json::from_str(&json).ok()?;

        // Required fields; confidence must coerce to float.
        value.get("description")?.as_str()?;
        let confidence = Self::coerce_confidence(&value)?;
        value["confidence"] = Value::from(confidence);

        serde_json::from_value(value).ok()
    }

    fn parse_strategy(content: &str) -> Option<FixStrategy> {
        let json = Self::extract_json(content)?;
        let mut value: Value = serde_json::from_str(&json).ok()?;
        value.get("description")?.as_str()?;
        let confidence = Self::coerce_confidence(&value)?;
        value["confidence"] = Value::from(confidence);
        serde_json::from_value(value).ok()
    }

    /// Canned strategies used when no backend is reachable.
    fn fallback_strategy(source: EventSource) -> FixStrategy {
        match source {
            EventSource::VulnerabilityScan => FixStrategy {
                description: "Update vulnerable package to fixed version".into(),
                confidence: 0.7,
                steps: vec![
                    "Identify package".into(),
                    "Update to fixed version".into(),
                    "Rebuild image".into(),
                    "Redeploy".into(),
                ],
                analysis: None,
            },
            EventSource::NetworkIps => FixStrategy {
                description: "Ban IP and update firewall rules".into(),
                confidence: 0.9,
                steps: vec![
                    "Verify threat".into(),
                    "Add permanent ban".into(),
                    "Update firewall".into(),
                ],
                analysis: None,
            },
            EventSource::HostIps => FixStrategy {
                description: "Verify ban and extend duration".into(),
                confidence: 0.8,
                steps: vec!["Check ban status".into(), "Extend ban duration".into()],
                analysis: None,
            },
            EventSource::FileIntegrity => FixStrategy {
                description: "Restore file from backup".into(),
                confidence: 0.6,
                steps: vec![
                    "Verify change".into(),
                    "Check backup".into(),
                    "Restore file".into(),
                    "Update integrity baseline".into(),
                ],
                analysis: None,
            },
        }
    }
}
