//! Domain error types.
//!
//! One enum per component, built with thiserror. The orchestrator
//! distinguishes a handful of error kinds (transient, timeout,
//! validation refusal, verification failure, state corruption,
//! circuit-open) via the classifier helpers on each enum.

use thiserror::Error;

/// Errors from source adapters and the event watcher.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// Adapter poll failed; the cycle is skipped.
    #[error("adapter poll failed for {source_name}: {reason}")]
    PollFailed { source_name: String, reason: String },

    /// Adapter poll exceeded its bounded time.
    #[error("adapter poll timed out for {source_name} after {seconds}s")]
    PollTimeout { source_name: String, seconds: u64 },

    /// Tool output could not be parsed.
    #[error("unparseable tool output from {source_name}: {reason}")]
    ParseFailed { source_name: String, reason: String },

    /// Seen-event cache could not be persisted.
    #[error("seen-event cache flush failed: {0}")]
    CacheFlushFailed(String),
}

impl WatcherError {
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::PollFailed { .. } | Self::PollTimeout { .. } | Self::CacheFlushFailed(_)
        )
    }
}

/// Errors from the command executor.
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// Command matched the destructive-pattern blocklist, was empty,
    /// or contained NUL bytes. Never retried.
    #[error("refused unsafe command: {0}")]
    RefusedUnsafe(String),

    /// Child process exceeded its timeout and was killed.
    #[error("command timed out after {seconds}s: {command}")]
    Timeout { command: String, seconds: u64 },

    /// Command could not be tokenized in VALIDATE mode.
    #[error("command syntax error: {0}")]
    SyntaxError(String),

    /// Process could not be spawned.
    #[error("failed to spawn command: {0}")]
    SpawnFailed(String),
}

impl ExecutorError {
    /// Validation refusals are contract-level; they must not consume
    /// retry budget for the same strategy.
    pub const fn is_refusal(&self) -> bool {
        matches!(self, Self::RefusedUnsafe(_) | Self::SyntaxError(_))
    }

    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::SpawnFailed(_))
    }
}

/// Errors from the planner and its model providers.
#[derive(Error, Debug)]
pub enum PlannerError {
    #[error("provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("provider {provider} returned status {status}")]
    BadStatus { provider: String, status: u16 },

    #[error("provider {provider} returned malformed output: {reason}")]
    MalformedResponse { provider: String, reason: String },

    #[error("provider {provider} timed out after {seconds}s")]
    Timeout { provider: String, seconds: u64 },

    /// Every configured provider failed.
    #[error("all providers failed: {0}")]
    AllProvidersFailed(String),

    #[error("no providers configured")]
    NoProviders,
}

impl PlannerError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RequestFailed { .. } | Self::Timeout { .. } => true,
            Self::BadStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Errors from the knowledge base.
#[derive(Error, Debug)]
pub enum KnowledgeBaseError {
    #[error("knowledge base query failed: {0}")]
    QueryFailed(String),

    #[error("knowledge base migration failed: {0}")]
    MigrationFailed(String),

    /// The store is running degraded; writes are dropped.
    #[error("knowledge base is read-only (degraded mode)")]
    ReadOnly,

    #[error("knowledge base open failed: {0}")]
    OpenFailed(String),
}

impl From<sqlx::Error> for KnowledgeBaseError {
    fn from(err: sqlx::Error) -> Self {
        Self::QueryFailed(err.to_string())
    }
}

/// Errors from the backup manager.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("backup source not found: {0}")]
    SourceNotFound(String),

    #[error("backup creation failed for {source_name}: {reason}")]
    CreationFailed { source_name: String, reason: String },

    /// Created backup failed post-creation verification.
    #[error("backup verification failed for {backup_id}: {reason}")]
    VerificationFailed { backup_id: String, reason: String },

    #[error("backup not found: {0}")]
    NotFound(String),

    #[error("restore failed for {backup_id}: {reason}")]
    RestoreFailed { backup_id: String, reason: String },
}

/// Errors from fixers.
#[derive(Error, Debug)]
pub enum FixerError {
    /// The fix would touch a whitelisted or protected target.
    /// Never retried; a different plan is needed.
    #[error("refused unsafe fix: {0}")]
    RefusedUnsafe(String),

    /// The fix ran but verification did not confirm success.
    /// Rolled back; counted against the retry budget.
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("fix execution failed: {0}")]
    ExecutionFailed(String),

    #[error("event payload unusable for this fixer: {0}")]
    BadEvent(String),
}

impl FixerError {
    pub const fn is_refusal(&self) -> bool {
        matches!(self, Self::RefusedUnsafe(_))
    }

    pub const fn is_verification_failure(&self) -> bool {
        matches!(self, Self::VerificationFailed(_))
    }
}

/// Errors from persisted JSON state.
#[derive(Error, Debug)]
pub enum StateError {
    /// File was unreadable and has been quarantined.
    #[error("state file corrupted and quarantined: {path}")]
    Corrupted { path: String },

    #[error("state I/O error for {path}: {reason}")]
    Io { path: String, reason: String },
}

/// Errors from service management.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("service not found: {0}")]
    NotFound(String),

    #[error("service {name} failed to stop within {seconds}s")]
    StopTimeout { name: String, seconds: u64 },

    #[error("service {name} failed to start: {reason}")]
    StartFailed { name: String, reason: String },

    #[error("service {name} unhealthy after start")]
    Unhealthy { name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_refusals_are_not_transient() {
        let err = ExecutorError::RefusedUnsafe("rm -rf /".into());
        assert!(err.is_refusal());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_executor_timeout_display() {
        let err = ExecutorError::Timeout {
            command: "sleep 100".into(),
            seconds: 5,
        };
        assert_eq!(err.to_string(), "command timed out after 5s: sleep 100");
        assert!(!err.is_refusal());
    }

    #[test]
    fn test_planner_status_transience() {
        assert!(PlannerError::BadStatus {
            provider: "local".into(),
            status: 503
        }
        .is_transient());
        assert!(PlannerError::BadStatus {
            provider: "local".into(),
            status: 429
        }
        .is_transient());
        assert!(!PlannerError::BadStatus {
            provider: "local".into(),
            status: 400
        }
        .is_transient());
        assert!(!PlannerError::MalformedResponse {
            provider: "local".into(),
            reason: "no json".into()
        }
        .is_transient());
    }

    #[test]
    fn test_fixer_error_classes() {
        assert!(FixerError::RefusedUnsafe("whitelisted ip".into()).is_refusal());
        assert!(FixerError::VerificationFailed("rule missing".into()).is_verification_failure());
        assert!(!FixerError::ExecutionFailed("boom".into()).is_refusal());
    }

    #[test]
    fn test_watcher_transience() {
        assert!(WatcherError::PollTimeout {
            source_name: "host_ips".into(),
            seconds: 30
        }
        .is_transient());
        assert!(!WatcherError::ParseFailed {
            source_name: "host_ips".into(),
            reason: "bad json".into()
        }
        .is_transient());
    }
}
