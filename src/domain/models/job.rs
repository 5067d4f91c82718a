//! Remediation jobs: per-event retry context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::event::SecurityEvent;

/// Outcome of a single remediation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptResult {
    Success,
    Failure,
    Partial,
}

impl AttemptResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Partial => "partial",
        }
    }
}

impl fmt::Display for AttemptResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution of one strategy against one event.
///
/// Attempts within a job are totally ordered and strictly increasing
/// in `attempt_number`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationAttempt {
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
    pub strategy: String,
    pub result: AttemptResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub duration_seconds: f64,
    pub ai_confidence: f64,
}

/// Job status across retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    RequiresApproval,
    Rejected,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::RequiresApproval => "requires_approval",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Rejected)
    }
}

/// Per-event retry context: the event plus its attempt history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationJob {
    pub job_id: Uuid,
    pub event: SecurityEvent,
    pub created_at: DateTime<Utc>,
    pub attempts: Vec<RemediationAttempt>,
    pub status: JobStatus,
    pub max_attempts: u32,
    pub approval_required: bool,
    /// Opaque handle to the notifier message carrying the approval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_handle: Option<String>,
}

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

impl RemediationJob {
    pub fn new(event: SecurityEvent) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            event,
            created_at: Utc::now(),
            attempts: Vec::new(),
            status: JobStatus::Pending,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            // Conservative default: re-evaluated once the plan and
            // impact assessment arrive.
            approval_required: true,
            approval_handle: None,
        }
    }

    /// Number the next attempt would carry.
    pub fn next_attempt_number(&self) -> u32 {
        self.attempts.len() as u32 + 1
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts.len() as u32 >= self.max_attempts
    }

    /// Record an attempt, keeping attempt numbers strictly increasing.
    pub fn record_attempt(&mut self, mut attempt: RemediationAttempt) {
        attempt.attempt_number = self.next_attempt_number();
        self.attempts.push(attempt);
    }

    /// Attempt history formatted for re-planning prompts.
    pub fn attempt_history(&self) -> Vec<(String, String, Option<String>)> {
        self.attempts
            .iter()
            .map(|a| {
                (
                    a.strategy.clone(),
                    a.result.as_str().to_string(),
                    a.error_message.clone(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::event::{EventDetails, EventSource, Severity};

    fn job() -> RemediationJob {
        RemediationJob::new(SecurityEvent::new(
            EventSource::HostIps,
            Severity::Medium,
            EventDetails::HostBan {
                ip: "198.51.100.1".into(),
                jail: "sshd".into(),
            },
        ))
    }

    fn attempt(result: AttemptResult) -> RemediationAttempt {
        RemediationAttempt {
            attempt_number: 0,
            timestamp: Utc::now(),
            strategy: "harden jail".into(),
            result,
            error_message: None,
            duration_seconds: 1.5,
            ai_confidence: 0.9,
        }
    }

    #[test]
    fn test_attempt_numbers_strictly_increase() {
        let mut j = job();
        j.record_attempt(attempt(AttemptResult::Failure));
        j.record_attempt(attempt(AttemptResult::Failure));
        j.record_attempt(attempt(AttemptResult::Success));

        let numbers: Vec<u32> = j.attempts.iter().map(|a| a.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        for pair in j.attempts.windows(2) {
            assert_eq!(pair[1].attempt_number, pair[0].attempt_number + 1);
        }
    }

    #[test]
    fn test_exhaustion_at_max_attempts() {
        let mut j = job();
        assert!(!j.attempts_exhausted());
        for _ in 0..DEFAULT_MAX_ATTEMPTS {
            j.record_attempt(attempt(AttemptResult::Failure));
        }
        assert!(j.attempts_exhausted());
    }

    #[test]
    fn test_new_job_requires_approval() {
        assert!(job().approval_required);
        assert_eq!(job().status, JobStatus::Pending);
    }
}
