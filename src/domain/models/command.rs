//! Command execution results and modes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a command is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Actually execute.
    Live,
    /// Log and return synthetic success.
    DryRun,
    /// Tokenize only; any parse error fails with a syntax error.
    Validate,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::DryRun => "dry_run",
            Self::Validate => "validate",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_seconds: f64,
    pub timestamp: DateTime<Utc>,
    pub mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl CommandResult {
    /// Synthetic success for dry-run mode.
    pub fn dry_run(command: impl Into<String>) -> Self {
        let command = command.into();
        Self {
            stdout: format!("[DRY-RUN] would execute: {command}"),
            command,
            success: true,
            stderr: String::new(),
            exit_code: 0,
            duration_seconds: 0.0,
            timestamp: Utc::now(),
            mode: ExecutionMode::DryRun,
            error_message: None,
        }
    }
}
