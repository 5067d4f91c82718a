//! File-integrity fixer: restore, quarantine, or approve changes.
//!
//! Changes are categorized into unauthorized (critical-path
//! modifications not approved in the plan), suspicious (new files),
//! and legitimate (everything else). Unauthorized changes are
//! restored from version control or the system backup; suspicious
//! files are quarantined, with a malware scan when a scanner is
//! available; legitimate changes are approved by refreshing the
//! baseline. Restores on critical paths are refused unless the plan
//! text explicitly approves the path.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{FixOutcome, Fixer};
use crate::domain::errors::FixerError;
use crate::domain::models::plan::FixStrategy;
use crate::domain::models::{EventDetails, EventSource, SecurityEvent};
use crate::services::backup::BackupManager;
use crate::services::executor::{CommandExecutor, ExecuteOptions};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Category {
    Unauthorized,
    Suspicious,
    Legitimate,
}

#[derive(Debug, Clone)]
struct FileChange {
    path: String,
    change_kind: String,
}

pub struct IntegrityFixer {
    executor: Arc<CommandExecutor>,
    backup_manager: Arc<BackupManager>,
    critical_prefixes: Vec<String>,
    quarantine_dir: String,
    baseline_update_command: String,
}

impl IntegrityFixer {
    pub fn new(
        executor: Arc<CommandExecutor>,
        backup_manager: Arc<BackupManager>,
        critical_prefixes: Vec<String>,
        quarantine_dir: String,
        baseline_update_command: String,
    ) -> Self {
        Self {
            executor,
            backup_manager,
            critical_prefixes,
            quarantine_dir,
            baseline_update_command,
        }
    }

    fn extract_changes(events: &[SecurityEvent]) -> Result<Vec<FileChange>, FixerError> {
        let mut changes = Vec::new();
        for event in events {
            match &event.details {
                EventDetails::IntegrityChange { path, change_kind } => changes.push(FileChange {
                    path: path.clone(),
                    change_kind: change_kind.clone(),
                }),
                other => {
                    return Err(FixerError::BadEvent(format!(
                        "integrity fixer cannot handle payload: {other:?}"
                    )))
                }
            }
        }
        if changes.is_empty() {
            return Err(FixerError::BadEvent("no file changes in events".into()));
        }
        Ok(changes)
    }

    fn is_critical(&self, path: &str) -> bool {
        self.critical_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix))
    }

    /// Plan text approves a path only when it contains "approve" and
    /// names the path.
    fn plan_approves(strategy: &FixStrategy, path: &str) -> bool {
        let text = strategy.description.to_lowercase();
        text.contains("approve") && strategy.description.contains(path)
    }

    fn categorize(&self, change: &FileChange, strategy: &FixStrategy) -> Category {
        if self.is_critical(&change.path) {
            if Self::plan_approves(strategy, &change.path) {
                return Category::Legitimate;
            }
            return Category::Unauthorized;
        }
        if change.change_kind == "added" {
            if Self::plan_approves(strategy, &change.path) {
                return Category::Legitimate;
            }
            return Category::Suspicious;
        }
        Category::Legitimate
    }

    async fn run(&self, command: &str, timeout: Duration) -> Result<bool, FixerError> {
        let result = self
            .executor
            .execute(
                command,
                ExecuteOptions::new().with_sudo().with_timeout(timeout),
            )
            .await
            .map_err(|e| FixerError::ExecutionFailed(e.to_string()))?;
        Ok(result.success)
    }

    /// Restore one unauthorized change: version control first, then
    /// the system backup copy.
    async fn restore(&self, change: &FileChange, strategy: &FixStrategy) -> Result<(), FixerError> {
        // Critical paths need explicit approval text in the plan
        // before any automated restore touches them.
        if self.is_critical(&change.path) && !Self::plan_approves(strategy, &change.path) {
            return Err(FixerError::RefusedUnsafe(format!(
                "auto-restore of critical path {} requires explicit approval in the plan",
                change.path
            )));
        }

        let parent = Path::new(&change.path)
            .parent()
            .map_or_else(|| "/".to_string(), |p| p.display().to_string());

        let git_restore = format!("git -C '{parent}' checkout -- '{}'", change.path);
        if self.run(&git_restore, Duration::from_secs(60)).await? {
            return Ok(());
        }

        let name = Path::new(&change.path)
            .file_name()
            .map_or_else(String::new, |n| n.to_string_lossy().into_owned());
        let copy_backup = format!("cp '/var/backups/{name}' '{}'", change.path);
        if self.run(&copy_backup, Duration::from_secs(60)).await? {
            return Ok(());
        }

        Err(FixerError::ExecutionFailed(format!(
            "no restore source for {}",
            change.path
        )))
    }

    /// Quarantine a suspicious file, scanning it first when a malware
    /// scanner is installed.
    async fn quarantine(&self, change: &FileChange) -> Result<(), FixerError> {
        let scanner_available = self
            .run("command -v clamscan", Duration::from_secs(10))
            .await
            .unwrap_or(false);
        if scanner_available {
            let infected = !self
                .run(
                    &format!("clamscan --no-summary '{}'", change.path),
                    Duration::from_secs(300),
                )
                .await?;
            if infected {
                warn!(path = %change.path, "malware scanner flagged quarantined file");
            }
        }

        let commands = [
            format!("mkdir -p '{}'", self.quarantine_dir),
            format!("mv '{}' '{}/'", change.path, self.quarantine_dir),
        ];
        for command in &commands {
            if !self.run(command, Duration::from_secs(60)).await? {
                return Err(FixerError::ExecutionFailed(format!(
                    "quarantine step failed: {command}"
                )));
            }
        }
        Ok(())
    }

    /// Refresh the integrity baseline; verification requires this to
    /// succeed.
    async fn update_baseline(&self) -> Result<(), FixerError> {
        if !self
            .run(&self.baseline_update_command, Duration::from_secs(1800))
            .await?
        {
            return Err(FixerError::VerificationFailed(
                "baseline database update failed".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Fixer for IntegrityFixer {
    fn source(&self) -> EventSource {
        EventSource::FileIntegrity
    }

    async fn fix(
        &self,
        events: &[SecurityEvent],
        strategy: &FixStrategy,
    ) -> Result<FixOutcome, FixerError> {
        let changes = Self::extract_changes(events)?;

        let mut unauthorized = Vec::new();
        let mut suspicious = Vec::new();
        let mut legitimate = Vec::new();
        for change in &changes {
            match self.categorize(change, strategy) {
                Category::Unauthorized => unauthorized.push(change.clone()),
                Category::Suspicious => suspicious.push(change.clone()),
                Category::Legitimate => legitimate.push(change.clone()),
            }
        }

        info!(
            unauthorized = unauthorized.len(),
            suspicious = suspicious.len(),
            legitimate = legitimate.len(),
            "integrity fix starting"
        );

        // Snapshot files we are about to overwrite, so a failed
        // verification can roll the restores back.
        let restore_targets: Vec<String> = unauthorized
            .iter()
            .map(|change| change.path.clone())
            .collect();
        let backups = self.backup_manager.create_batch_backup(&restore_targets).await;
        let backup_ids: Vec<String> = backups.values().map(|b| b.backup_id.clone()).collect();

        let applied: Result<String, FixerError> = async {
            let mut restored = 0;
            for change in &unauthorized {
                self.restore(change, strategy).await?;
                restored += 1;
            }

            let mut quarantined = 0;
            for change in &suspicious {
                self.quarantine(change).await?;
                quarantined += 1;
            }

            Ok(format!(
                "{restored} restored, {quarantined} quarantined, {} approved",
                legitimate.len()
            ))
        }
        .await;

        let message = match applied {
            Ok(message) => message,
            Err(e) => {
                let _ = self.backup_manager.rollback_batch(&backup_ids).await;
                return Err(e);
            }
        };

        if let Err(e) = self.update_baseline().await {
            warn!(error = %e, "baseline update failed, rolling back restores");
            let _ = self.backup_manager.rollback_batch(&backup_ids).await;
            return Err(e);
        }

        Ok(FixOutcome {
            message,
            backup_ids,
        })
    }
}
