//! Remediation batches: events collected in one window, handled by one plan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::event::{EventSource, SecurityEvent};

/// Lifecycle of a batch. Terminal states: Completed, Failed, Rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Collecting,
    Analyzing,
    AwaitingApproval,
    Executing,
    Completed,
    Failed,
    Rejected,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collecting => "collecting",
            Self::Analyzing => "analyzing",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Rejected)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events scheduled together under one coordinated plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationBatch {
    pub batch_id: u64,
    pub events: Vec<SecurityEvent>,
    pub created_at: DateTime<Utc>,
    pub status: BatchStatus,
    /// Reason recorded when the batch terminates in Failed/Rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl RemediationBatch {
    pub fn new(batch_id: u64) -> Self {
        Self {
            batch_id,
            events: Vec::new(),
            created_at: Utc::now(),
            status: BatchStatus::Collecting,
            failure_reason: None,
        }
    }

    pub fn add_event(&mut self, event: SecurityEvent) {
        self.events.push(event);
    }

    /// Highest event severity priority in the batch (queue ordering).
    pub fn severity_priority(&self) -> u8 {
        self.events
            .iter()
            .map(|e| e.severity.priority())
            .max()
            .unwrap_or(0)
    }

    /// Distinct event sources represented in the batch.
    pub fn sources(&self) -> BTreeSet<EventSource> {
        self.events.iter().map(|e| e.source).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
