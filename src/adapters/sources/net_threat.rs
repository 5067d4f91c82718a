//! Network threat-feed adapter.
//!
//! Polls the feed's active ban decisions (a CLI that prints JSON) and
//! emits HIGH events for decisions not seen by this adapter instance.
//! The feed has already mitigated the symptom, so these events are
//! self-resolving.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use tokio::sync::Mutex;

use super::run_tool_command;
use crate::domain::errors::WatcherError;
use crate::domain::models::{EventDetails, EventSource, SecurityEvent, Severity};
use crate::domain::ports::SourceAdapter;

#[derive(Debug, Deserialize)]
struct Decision {
    /// The banned address.
    #[serde(alias = "ip")]
    value: String,
    #[serde(default)]
    scenario: String,
    #[serde(default)]
    country: Option<String>,
}

pub struct NetThreatAdapter {
    decisions_command: String,
    seen: Mutex<HashSet<String>>,
}

impl NetThreatAdapter {
    pub fn new(decisions_command: impl Into<String>) -> Self {
        Self {
            decisions_command: decisions_command.into(),
            seen: Mutex::new(HashSet::new()),
        }
    }

    fn parse(raw: &str) -> Result<Vec<Decision>, WatcherError> {
        if raw.trim().is_empty() || raw.trim() == "null" {
            return Ok(Vec::new());
        }
        serde_json::from_str(raw).map_err(|e| WatcherError::ParseFailed {
            source_name: EventSource::NetworkIps.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl SourceAdapter for NetThreatAdapter {
    fn source(&self) -> EventSource {
        EventSource::NetworkIps
    }

    async fn poll(&self) -> Result<Vec<SecurityEvent>, WatcherError> {
        let output = run_tool_command(self.source().as_str(), &self.decisions_command).await?;
        if !output.status.success() {
            return Err(WatcherError::PollFailed {
                source_name: self.source().to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let decisions = Self::parse(&String::from_utf8_lossy(&output.stdout))?;

        let mut seen = self.seen.lock().await;
        let mut events = Vec::new();
        for decision in decisions {
            let key = format!("{}:{}", decision.value, decision.scenario);
            if seen.insert(key) {
                events.push(SecurityEvent::new(
                    EventSource::NetworkIps,
                    Severity::High,
                    EventDetails::NetworkThreat {
                        ip: decision.value,
                        scenario: decision.scenario,
                        country: decision.country,
                    },
                ));
            }
        }
        Ok(events)
    }
}
