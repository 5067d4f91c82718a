//! Command executor: a thin, safe wrapper over shell execution.
//!
//! Commands are validated against a destructive-pattern blocklist
//! before anything runs; refusals are contract-level and never
//! retried. LIVE execution runs under a timeout that kills the child
//! and reports exit code -1 with a distinguished timeout error kind.

use chrono::Utc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use regex::RegexSet;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::domain::errors::ExecutorError;
use crate::domain::models::config::ExecutorConfig;
use crate::domain::models::{CommandResult, ExecutionMode};

/// Destructive patterns refused outright.
const BLOCKED_PATTERNS: &[&str] = &[
    r"rm\s+-rf\s+/(\s|$)",
    r"dd\s+if=.*of=/dev/",
    r"mkfs\.",
    r":\(\)\s*\{\s*:\|:&\s*\};:",
    r"chmod\s+-R\s+777",
    r"chown\s+-R\s+",
    r"\bshutdown\b",
    r"\breboot\b",
    r"\bhalt\b",
    r"init\s+0",
    r"init\s+6",
];

/// Per-call options for `execute`.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub timeout: Option<Duration>,
    pub mode: Option<ExecutionMode>,
    pub sudo: bool,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub capture: bool,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self {
            capture: true,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_sudo(mut self) -> Self {
        self.sudo = true;
        self
    }
}

/// Execution statistics over the retained history.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutorStats {
    pub total_executions: u64,
    pub successful: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub average_duration_seconds: f64,
}

const MAX_HISTORY: usize = 1000;

pub struct CommandExecutor {
    config: ExecutorConfig,
    /// Global dry-run switch from `auto_remediation.dry_run`.
    dry_run: bool,
    blocklist: RegexSet,
    history: Arc<Mutex<VecDeque<CommandResult>>>,
}

impl CommandExecutor {
    pub fn new(config: ExecutorConfig, dry_run: bool) -> Self {
        let blocklist = RegexSet::new(BLOCKED_PATTERNS).expect("blocklist patterns are valid");
        info!(
            mode = if dry_run { "DRY-RUN" } else { "LIVE" },
            "command executor ready"
        );
        Self {
            config,
            dry_run,
            blocklist,
            history: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Execute one shell command.
    pub async fn execute(
        &self,
        command: &str,
        options: ExecuteOptions,
    ) -> Result<CommandResult, ExecutorError> {
        let started = Instant::now();

        self.validate(command)?;

        let mode = options.mode.unwrap_or(if self.dry_run {
            ExecutionMode::DryRun
        } else {
            ExecutionMode::Live
        });

        let mut timeout = options
            .timeout
            .unwrap_or(Duration::from_secs(self.config.default_timeout_seconds));
        let max_timeout = Duration::from_secs(self.config.max_timeout_seconds);
        if timeout > max_timeout {
            warn!(
                requested = timeout.as_secs(),
                cap = max_timeout.as_secs(),
                "timeout capped"
            );
            timeout = max_timeout;
        }

        let command = if options.sudo && !command.trim_start().starts_with("sudo") {
            format!("sudo {command}")
        } else {
            command.to_string()
        };

        debug!(%command, mode = %mode, "executing");

        let mut result = match mode {
            ExecutionMode::Validate => Self::validate_syntax(&command),
            ExecutionMode::DryRun => CommandResult::dry_run(&command),
            ExecutionMode::Live => self.execute_live(&command, timeout, &options).await,
        };
        result.duration_seconds = started.elapsed().as_secs_f64();

        if result.success {
            debug!(duration = result.duration_seconds, "command succeeded");
        } else {
            error!(
                duration = result.duration_seconds,
                error = result.error_message.as_deref().unwrap_or(""),
                "command failed"
            );
        }

        let mut history = self.history.lock().await;
        history.push_back(result.clone());
        if history.len() > MAX_HISTORY {
            history.pop_front();
        }

        Ok(result)
    }

    /// Execute commands sequentially, optionally stopping at the
    /// first failure.
    pub async fn execute_batch(
        &self,
        commands: &[String],
        stop_on_error: bool,
        options: ExecuteOptions,
    ) -> Result<Vec<CommandResult>, ExecutorError> {
        let mut results = Vec::with_capacity(commands.len());
        for (idx, command) in commands.iter().enumerate() {
            debug!(idx = idx + 1, total = commands.len(), %command, "batch step");
            let result = self.execute(command, options.clone()).await?;
            let failed = !result.success;
            results.push(result);
            if failed && stop_on_error {
                warn!(idx = idx + 1, "batch stopped on error");
                break;
            }
        }
        Ok(results)
    }

    fn validate(&self, command: &str) -> Result<(), ExecutorError> {
        if command.trim().is_empty() {
            return Err(ExecutorError::RefusedUnsafe("empty command".into()));
        }
        if command.contains('\0') {
            return Err(ExecutorError::RefusedUnsafe(
                "command contains NUL bytes".into(),
            ));
        }
        if self.blocklist.is_match(command) {
            return Err(ExecutorError::RefusedUnsafe(format!(
                "command matches destructive pattern: {command}"
            )));
        }
        Ok(())
    }

    /// VALIDATE mode: tokenize only.
    fn validate_syntax(command: &str) -> CommandResult {
        match shell_tokenize(command) {
            Ok(_) => CommandResult {
                command: command.to_string(),
                success: true,
                stdout: "syntax validation passed".into(),
                stderr: String::new(),
                exit_code: 0,
                duration_seconds: 0.0,
                timestamp: Utc::now(),
                mode: ExecutionMode::Validate,
                error_message: None,
            },
            Err(reason) => CommandResult {
                command: command.to_string(),
                success: false,
                stdout: String::new(),
                stderr: format!("syntax error: {reason}"),
                exit_code: 1,
                duration_seconds: 0.0,
                timestamp: Utc::now(),
                mode: ExecutionMode::Validate,
                error_message: Some(reason),
            },
        }
    }

    async fn execute_live(
        &self,
        command: &str,
        timeout: Duration,
        options: &ExecuteOptions,
    ) -> CommandResult {
        let mut cmd = Command::new("/bin/bash");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(if options.capture {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(if options.capture {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return CommandResult {
                    command: command.to_string(),
                    success: false,
                    stdout: String::new(),
                    stderr: e.to_string(),
                    exit_code: -1,
                    duration_seconds: 0.0,
                    timestamp: Utc::now(),
                    mode: ExecutionMode::Live,
                    error_message: Some(format!("spawn failed: {e}")),
                }
            }
        };
        let child_pid = child.id();

        let wait = child.wait_with_output();
        tokio::pin!(wait);

        match tokio::time::timeout(timeout, &mut wait).await {
            Ok(Ok(output)) => {
                let stdout = self.decode(&output.stdout);
                let stderr = self.decode(&output.stderr);
                let exit_code = output.status.code().unwrap_or(-1);
                let success = output.status.success();
                CommandResult {
                    command: command.to_string(),
                    success,
                    stdout,
                    error_message: if success { None } else { Some(stderr.clone()) },
                    stderr,
                    exit_code,
                    duration_seconds: 0.0,
                    timestamp: Utc::now(),
                    mode: ExecutionMode::Live,
                }
            }
            Ok(Err(e)) => CommandResult {
                command: command.to_string(),
                success: false,
                stdout: String::new(),
                stderr: e.to_string(),
                exit_code: -1,
                duration_seconds: 0.0,
                timestamp: Utc::now(),
                mode: ExecutionMode::Live,
                error_message: Some(e.to_string()),
            },
            Err(_) => {
                // SIGTERM first, SIGKILL 2s later if the child lingers.
                if let Some(pid) = child_pid {
                    let pid = Pid::from_raw(pid as i32);
                    let _ = kill(pid, Signal::SIGTERM);
                    if tokio::time::timeout(Duration::from_secs(2), &mut wait)
                        .await
                        .is_err()
                    {
                        let _ = kill(pid, Signal::SIGKILL);
                        let _ = tokio::time::timeout(Duration::from_secs(1), &mut wait).await;
                    }
                }
                let err = ExecutorError::Timeout {
                    command: command.to_string(),
                    seconds: timeout.as_secs(),
                };
                CommandResult {
                    command: command.to_string(),
                    success: false,
                    stdout: String::new(),
                    stderr: err.to_string(),
                    exit_code: -1,
                    duration_seconds: 0.0,
                    timestamp: Utc::now(),
                    mode: ExecutionMode::Live,
                    error_message: Some(err.to_string()),
                }
            }
        }
    }

    fn decode(&self, bytes: &[u8]) -> String {
        let capped = if bytes.len() > self.config.max_output_bytes {
            &bytes[..self.config.max_output_bytes]
        } else {
            bytes
        };
        String::from_utf8_lossy(capped).into_owned()
    }

    pub async fn history(&self, limit: usize) -> Vec<CommandResult> {
        let history = self.history.lock().await;
        history.iter().rev().take(limit).cloned().collect()
    }

    pub async fn stats(&self) -> ExecutorStats {
        let history = self.history.lock().await;
        let total = history.len() as u64;
        let successful = history.iter().filter(|r| r.success).count() as u64;
        let avg = if total > 0 {
            history.iter().map(|r| r.duration_seconds).sum::<f64>() / total as f64
        } else {
            0.0
        };
        ExecutorStats {
            total_executions: total,
            successful,
            failed: total - successful,
            success_rate: if total > 0 {
                successful as f64 / total as f64
            } else {
                0.0
            },
            average_duration_seconds: avg,
        }
    }
}

/// Minimal shell tokenizer for VALIDATE mode: splits on whitespace
/// respecting single/double quotes and backslash escapes.
fn shell_tokenize(command: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = command.chars();
    let mut in_single = false;
    let mut in_double = false;

    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '\\' if !in_single => match chars.next() {
                Some(escaped) => current.push(escaped),
                None => return Err("trailing backslash".into()),
            },
            c if c.is_whitespace() && !in_single && !in_double => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }

    if in_single || in_double {
        return Err("unterminated quote".into());
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(dry_run: bool) -> CommandExecutor {
        CommandExecutor::new(ExecutorConfig::default(), dry_run)
    }

    #[tokio::test]
    async fn test_blocklist_refuses_destructive_commands() {
        let exec = executor(false);
        for command in [
            "rm -rf /",
            "dd if=/dev/zero of=/dev/sda",
            "mkfs.ext4 /dev/sda1",
            "chmod -R 777 /var",
            "shutdown -h now",
        ] {
            let err = exec
                .execute(command, ExecuteOptions::new())
                .await
                .unwrap_err();
            assert!(err.is_refusal(), "{command} should be refused");
        }
    }

    #[tokio::test]
    async fn test_empty_and_nul_refused() {
        let exec = executor(false);
        assert!(exec
            .execute("   ", ExecuteOptions::new())
            .await
            .unwrap_err()
            .is_refusal());
        assert!(exec
            .execute("echo a\0b", ExecuteOptions::new())
            .await
            .unwrap_err()
            .is_refusal());
    }

    #[tokio::test]
    async fn test_dry_run_returns_synthetic_success() {
        let exec = executor(true);
        let result = exec
            .execute("echo never-runs", ExecuteOptions::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.mode, ExecutionMode::DryRun);
        assert!(result.stdout.contains("would execute"));
    }

    #[tokio::test]
    async fn test_live_captures_output() {
        let exec = executor(false);
        let result = exec
            .execute("echo hello-vigil", ExecuteOptions::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("hello-vigil"));
    }

    #[tokio::test]
    async fn test_live_failure_sets_error() {
        let exec = executor(false);
        let result = exec
            .execute("ls /definitely/not/a/path", ExecuteOptions::new())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.exit_code != 0);
        assert!(result.error_message.is_some());
    }

    #[tokio::test]
    async fn test_timeout_kills_and_reports_minus_one() {
        let exec = executor(false);
        let result = exec
            .execute(
                "sleep 5",
                ExecuteOptions::new().with_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
        assert!(result.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_validate_mode_checks_syntax_only() {
        let exec = executor(false);
        let ok = exec
            .execute(
                "echo 'quoted arg'",
                ExecuteOptions::new().with_mode(ExecutionMode::Validate),
            )
            .await
            .unwrap();
        assert!(ok.success);

        let bad = exec
            .execute(
                "echo 'unterminated",
                ExecuteOptions::new().with_mode(ExecutionMode::Validate),
            )
            .await
            .unwrap();
        assert!(!bad.success);
        assert!(bad.stderr.contains("syntax error"));
    }

    #[tokio::test]
    async fn test_batch_stops_on_error() {
        let exec = executor(false);
        let commands = vec![
            "true".to_string(),
            "false".to_string(),
            "echo unreachable".to_string(),
        ];
        let results = exec
            .execute_batch(&commands, true, ExecuteOptions::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 2);

        let results = exec
            .execute_batch(&commands, false, ExecuteOptions::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn test_history_and_stats() {
        let exec = executor(false);
        exec.execute("true", ExecuteOptions::new()).await.unwrap();
        exec.execute("false", ExecuteOptions::new()).await.unwrap();

        let stats = exec.stats().await;
        assert_eq!(stats.total_executions, 2);
        assert_eq!(stats.successful, 1);
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);

        let history = exec.history(10).await;
        assert_eq!(history.len(), 2);
        // Most recent first.
        assert_eq!(history[0].command, "false");
    }

    #[test]
    fn test_tokenizer() {
        assert_eq!(
            shell_tokenize("a 'b c' d").unwrap(),
            vec!["a", "b c", "d"]
        );
        assert!(shell_tokenize("a 'b").is_err());
        assert!(shell_tokenize("a \\").is_err());
    }
}
