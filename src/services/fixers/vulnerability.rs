//! Vulnerability fixer: package and image remediation.
//!
//! Strategy selection by plan text: npm|package.json -> package
//! manager audit fix; apt|debian|ubuntu -> system package upgrade;
//! "base image"|from -> base image update; npm together with apt ->
//! combined. Verification re-scans the image and requires the
//! vulnerability count to have decreased.

use async_trait::async_trait;
use serde_json::Value;
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FixMethod {
    NpmAudit,
    AptUpgrade,
    BaseImage,
    Combined,
}

/// Normalized view of the batch's scanner findings.
#[derive(Debug, Default)]
struct Findings {
    packages: Vec<String>,
    images: Vec<String>,
    total: usize,
}

pub struct VulnerabilityFixer {
    executor: Arc<CommandExecutor>,
    backup_manager: Arc<BackupManager>,
    /// Project roots that may carry package manifests.
    project_paths: Vec<String>,
    /// Re-scan command; the image reference is appended.
    rescan_command: String,
}

impl VulnerabilityFixer {
    pub fn new(
        executor: Arc<CommandExecutor>,
        backup_manager: Arc<BackupManager>,
        project_paths: Vec<String>,
        rescan_command: String,
    ) -> Self {
        Self {
            executor,
            backup_manager,
            project_paths,
            rescan_command,
        }
    }

    fn determine_method(strategy: &FixStrategy) -> FixMethod {
        let text = strategy.description.to_lowercase();
        let has_npm = text.contains("npm") || text.contains("package.json");
        let has_apt =
            text.contains("apt") || text.contains("debian") || text.contains("ubuntu");
        let has_base = text.contains("base image") || text.contains("from");

        if has_npm && has_apt {
            FixMethod::Combined
        } else if has_npm {
            FixMethod::NpmAudit
        } else if has_apt {
            FixMethod::AptUpgrade
        } else if has_base {
            FixMethod::BaseImage
        } else {
            FixMethod::NpmAudit
        }
    }

    fn extract_findings(events: &[SecurityEvent]) -> Result<Findings, FixerError> {
        let mut findings = Findings::default();
        for event in events {
            match &event.details {
                EventDetails::Vulnerability { package, image, .. } => {
                    if !findings.packages.contains(package) {
                        findings.packages.push(package.clone());
                    }
                    if let Some(image) = image {
                        if !findings.images.contains(image) {
                            findings.images.push(image.clone());
                        }
                    }
                    findings.total += 1;
                }
                EventDetails::VulnerabilityBatch {
                    critical,
                    high,
                    medium,
                    ..
                } => {
                    findings.total += (*critical + *high + *medium) as usize;
                }
                other => {
                    return Err(FixerError::BadEvent(format!(
                        "vulnerability fixer cannot handle payload: {other:?}"
                    )))
                }
            }
        }
        if findings.total == 0 {
            return Err(FixerError::BadEvent("no findings in events".into()));
        }
        Ok(findings)
    }

    async fn run(&self, command: &str, timeout: Duration) -> Result<bool, FixerError> {
        let result = self
            .executor
            .execute(command, ExecuteOptions::new().with_timeout(timeout))
            .await
            .map_err(|e| FixerError::ExecutionFailed(e.to_string()))?;
        Ok(result.success)
    }

    /// Back up the files each method is about to touch.
    async fn take_backups(&self, method: FixMethod) -> Vec<String> {
        let mut sources = Vec::new();
        for root in &self.project_paths {
            if matches!(method, FixMethod::NpmAudit | FixMethod::Combined) {
                for name in ["package.json", "package-lock.json"] {
                    let path = Path::new(root).join(name);
                    if path.is_file() {
                        sources.push(path.display().to_string());
                    }
                }
            }
            if matches!(method, FixMethod::BaseImage | FixMethod::Combined) {
                let dockerfile = Path::new(root).join("Dockerfile");
                if dockerfile.is_file() {
                    sources.push(dockerfile.display().to_string());
                }
            }
        }
        let backups = self.backup_manager.create_batch_backup(&sources).await;
        backups.values().map(|b| b.backup_id.clone()).collect()
    }

    async fn npm_audit_fix(&self) -> Result<usize, FixerError> {
        let mut fixed_projects = 0;
        for root in &self.project_paths {
            if !Path::new(root).join("package.json").is_file() {
                continue;
            }
            let command = format!("cd '{root}' && npm audit fix");
            if self.run(&command, Duration::from_secs(600)).await? {
                fixed_projects += 1;
            } else {
                warn!(project = %root, "npm audit fix reported failure");
            }
        }
        Ok(fixed_projects)
    }

    async fn apt_upgrade(&self, packages: &[String]) -> Result<(), FixerError> {
        if !self
            .run("apt-get update", Duration::from_secs(600))
            .await?
        {
            return Err(FixerError::ExecutionFailed("apt-get update failed".into()));
        }
        let target = if packages.is_empty() {
            "--only-upgrade -y".to_string()
        } else {
            format!("-y --only-upgrade {}", packages.join(" "))
        };
        if !self
            .run(
                &format!("apt-get install {target}"),
                Duration::from_secs(1800),
            )
            .await?
        {
            return Err(FixerError::ExecutionFailed(
                "system package upgrade failed".into(),
            ));
        }
        Ok(())
    }

    async fn rebuild_images(&self, images: &[String]) -> Result<usize, FixerError> {
        let mut rebuilt = 0;
        for root in &self.project_paths {
            if !Path::new(root).join("Dockerfile").is_file() {
                continue;
            }
            let tag = images.first().map_or("latest-rebuild", |image| image.as_str());
            let command = format!("cd '{root}' && docker build --pull -t '{tag}' .");
            if self.run(&command, Duration::from_secs(1800)).await? {
                rebuilt += 1;
            }
        }
        Ok(rebuilt)
    }

    /// Re-scan and require the finding count to have decreased.
    async fn verify(&self, images: &[String], before: usize) -> Result<usize, FixerError> {
        let target = images.first().map_or("", |image| image.as_str());
        let command = format!("{} {target}", self.rescan_command);
        let result = self
            .executor
            .execute(
                &command,
                ExecuteOptions::new().with_timeout(Duration::from_secs(900)),
            )
            .await
            .map_err(|e| FixerError::ExecutionFailed(e.to_string()))?;

        if !result.success {
            return Err(FixerError::VerificationFailed(
                "re-scan command failed".into(),
            ));
        }
        if result.stdout.starts_with("[DRY-RUN]") {
            return Ok(0);
        }

        let after = Self::count_findings(&result.stdout);
        if after >= before {
            return Err(FixerError::VerificationFailed(format!(
                "vulnerability count did not decrease ({before} -> {after})"
            )));
        }
        Ok(after)
    }

    fn count_findings(report: &str) -> usize {
        let Ok(value) = serde_json::from_str::<Value>(report) else {
            return usize::MAX;
        };
        let Some(results) = value.get("Results").and_then(Value::as_array) else {
            return 0;
        };
        results
            .iter()
            .filter_map(|result| result.get("Vulnerabilities").and_then(Value::as_array))
            .map(Vec::len)
            .sum()
    }
}

#[async_trait]
impl Fixer for VulnerabilityFixer {
    fn source(&self) -> EventSource {
        EventSource::VulnerabilityScan
    }

    async fn fix(
        &self,
        events: &[SecurityEvent],
        strategy: &FixStrategy,
    ) -> Result<FixOutcome, FixerError> {
        let findings = Self::extract_findings(events)?;
        let method = Self::determine_method(strategy);

        info!(
            ?method,
            findings = findings.total,
            images = findings.images.len(),
            "vulnerability fix starting"
        );

        let backup_ids = self.take_backups(method).await;

        let applied: Result<String, FixerError> = async {
            match method {
                FixMethod::NpmAudit => {
                    let projects = self.npm_audit_fix().await?;
                    Ok(format!("npm audit fix across {projects} project(s)"))
                }
                FixMethod::AptUpgrade => {
                    self.apt_upgrade(&findings.packages).await?;
                    Ok(format!(
                        "system packages upgraded: {}",
                        findings.packages.join(", ")
                    ))
                }
                FixMethod::BaseImage => {
                    let rebuilt = self.rebuild_images(&findings.images).await?;
                    Ok(format!("{rebuilt} image(s) rebuilt on updated base"))
                }
                FixMethod::Combined => {
                    let projects = self.npm_audit_fix().await?;
                    self.apt_upgrade(&findings.packages).await?;
                    Ok(format!(
                        "npm audit fix across {projects} project(s), system packages upgraded"
                    ))
                }
            }
        }
        .await;

        let message = match applied {
            Ok(message) => message,
            Err(e) => {
                let _ = self.backup_manager.rollback_batch(&backup_ids).await;
                return Err(e);
            }
        };

        if let Err(e) = self.verify(&findings.images, findings.total).await {
            warn!(error = %e, "verification failed, rolling back package manifests");
            let _ = self.backup_manager.rollback_batch(&backup_ids).await;
            return Err(e);
        }

        Ok(FixOutcome {
            message,
            backup_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::config::{BackupConfig, ExecutorConfig};
    use crate::domain::models::Severity;
    use tempfile::TempDir;

    fn fixer(dir: &TempDir) -> VulnerabilityFixer {
        let executor = Arc::new(CommandExecutor::new(ExecutorConfig::default(), true));
        let backup_manager = Arc::new(
            BackupManager::new(
                BackupConfig {
                    root: dir.path().display().to_string(),
                    ..BackupConfig::default()
                },
                executor.clone(),
                true,
            )
            .unwrap(),
        );
        VulnerabilityFixer::new(
            executor,
            backup_manager,
            vec![dir.path().display().to_string()],
            "trivy image --format json".into(),
        )
    }

    fn finding(cve: &str, package: &str) -> SecurityEvent {
        SecurityEvent::new(
            EventSource::VulnerabilityScan,
            Severity::Critical,
            EventDetails::Vulnerability {
                cve_id: cve.into(),
                package: package.into(),
                installed_version: "1.0.0".into(),
                fixed_version: Some("1.1.0".into()),
                image: Some("app:latest".into()),
            },
        )
    }

    #[test]
    fn test_method_selection_table() {
        let m = |text: &str| VulnerabilityFixer::determine_method(&FixStrategy::new(text, 0.9));
        assert_eq!(m("run npm audit fix"), FixMethod::NpmAudit);
        assert_eq!(m("update package.json deps"), FixMethod::NpmAudit);
        assert_eq!(m("apt upgrade openssl"), FixMethod::AptUpgrade);
        assert_eq!(m("patch the debian packages"), FixMethod::AptUpgrade);
        assert_eq!(m("update the base image"), FixMethod::BaseImage);
        assert_eq!(m("bump FROM to bookworm"), FixMethod::BaseImage);
        assert_eq!(m("npm audit plus apt upgrade"), FixMethod::Combined);
        assert_eq!(m("fix it"), FixMethod::NpmAudit);
    }

    #[test]
    fn test_count_findings() {
        let report = r#"{"Results":[{"Vulnerabilities":[{"a":1},{"b":2}]},{"Vulnerabilities":[{"c":3}]}]}"#;
        assert_eq!(VulnerabilityFixer::count_findings(report), 3);
        assert_eq!(VulnerabilityFixer::count_findings(r#"{"Results":[]}"#), 0);
        assert_eq!(VulnerabilityFixer::count_findings("{}"), 0);
        assert_eq!(VulnerabilityFixer::count_findings("not json"), usize::MAX);
    }

    #[tokio::test]
    async fn test_dry_run_fix_succeeds() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();

        let outcome = fixer(&dir)
            .fix(
                &[finding("CVE-2024-0001", "openssl")],
                &FixStrategy::new("npm audit fix for openssl", 0.92),
            )
            .await
            .unwrap();
        assert!(outcome.message.contains("npm audit fix"));
    }

    #[tokio::test]
    async fn test_empty_events_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            fixer(&dir)
                .fix(&[], &FixStrategy::new("npm audit", 0.9))
                .await
                .unwrap_err(),
            FixerError::BadEvent(_)
        ));
    }

    #[tokio::test]
    async fn test_batch_statistics_event_accepted() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        let event = SecurityEvent::new(
            EventSource::VulnerabilityScan,
            Severity::High,
            EventDetails::VulnerabilityBatch {
                critical: 1,
                high: 2,
                medium: 3,
                images: 1,
            },
        );
        let outcome = fixer(&dir)
            .fix(&[event], &FixStrategy::new("npm audit fix", 0.9))
            .await
            .unwrap();
        assert!(!outcome.message.is_empty());
    }
}
