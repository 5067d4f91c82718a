//! Host-IPS fixer: jail hardening and permanent bans.
//!
//! Strategy selection by plan text: harden|config|maxretry -> jail
//! hardening; permanent|ban -> permanent ban of the offending IPs;
//! combined -> both. The jail is auto-detected from event details,
//! then plan text (sshd, nginx, apache), defaulting to sshd.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{FixOutcome, Fixer};
use crate::domain::errors::FixerError;
use crate::domain::models::plan::FixStrategy;
use crate::domain::models::{EventDetails, EventSource, SecurityEvent};
use crate::services::backup::BackupManager;
use crate::services::executor::{CommandExecutor, ExecuteOptions};

/// Hardened retry count applied by jail hardening.
const HARDENED_MAX_RETRY: u32 = 2;
/// Hardened ban time in seconds (24h).
const HARDENED_BAN_TIME: u32 = 86_400;

const JAIL_CONFIG_PATH: &str = "/etc/fail2ban/jail.local";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FixMethod {
    Harden,
    PermanentBan,
    Combined,
}

pub struct HostIpsFixer {
    executor: Arc<CommandExecutor>,
    backup_manager: Arc<BackupManager>,
}

impl HostIpsFixer {
    pub fn new(executor: Arc<CommandExecutor>, backup_manager: Arc<BackupManager>) -> Self {
        Self {
            executor,
            backup_manager,
        }
    }

    fn determine_method(strategy: &FixStrategy) -> FixMethod {
        let text = strategy.description.to_lowercase();
        if text.contains("combined") {
            FixMethod::Combined
        } else if text.contains("harden") || text.contains("config") || text.contains("maxretry") {
            FixMethod::Harden
        } else if text.contains("permanent") || text.contains("ban") {
            FixMethod::PermanentBan
        } else {
            FixMethod::Harden
        }
    }

    /// Jail from event details first, then plan text, default sshd.
    fn detect_jail(events: &[SecurityEvent], strategy: &FixStrategy) -> String {
        for event in events {
            if let EventDetails::HostBan { jail, .. } = &event.details {
                if !jail.is_empty() {
                    return jail.clone();
                }
            }
        }
        let text = strategy.description.to_lowercase();
        if text.contains("nginx") {
            "nginx-http-auth".to_string()
        } else if text.contains("apache") {
            "apache-auth".to_string()
        } else {
            // Covers the explicit sshd/ssh mentions too.
            "sshd".to_string()
        }
    }

    fn extract_ips(events: &[SecurityEvent]) -> Vec<String> {
        let mut ips = Vec::new();
        for event in events {
            if let EventDetails::HostBan { ip, .. } = &event.details {
                if !ips.contains(ip) {
                    ips.push(ip.clone());
                }
            }
        }
        ips
    }

    async fn run(&self, command: &str) -> Result<bool, FixerError> {
        let result = self
            .executor
            .execute(
                command,
                ExecuteOptions::new()
                    .with_sudo()
                    .with_timeout(Duration::from_secs(30)),
            )
            .await
            .map_err(|e| FixerError::ExecutionFailed(e.to_string()))?;
        Ok(result.success)
    }

    async fn harden_jail(&self, jail: &str) -> Result<(), FixerError> {
        let commands = [
            format!("fail2ban-client set {jail} maxretry {HARDENED_MAX_RETRY}"),
            format!("fail2ban-client set {jail} bantime {HARDENED_BAN_TIME}"),
        ];
        for command in &commands {
            if !self.run(command).await? {
                return Err(FixerError::ExecutionFailed(format!(
                    "hardening command failed: {command}"
                )));
            }
        }
        Ok(())
    }

    async fn ban_permanently(&self, jail: &str, ips: &[String]) -> Result<usize, FixerError> {
        let mut banned = 0;
        for ip in ips {
            if self
                .run(&format!("fail2ban-client set {jail} banip {ip}"))
                .await?
            {
                banned += 1;
            } else {
                warn!(%ip, jail, "permanent ban failed");
            }
        }
        Ok(banned)
    }

    /// Verify the jail is active and, after hardening, configured as
    /// intended.
    async fn verify(&self, jail: &str, hardened: bool) -> Result<(), FixerError> {
        let status = self
            .executor
            .execute(
                &format!("fail2ban-client status {jail}"),
                ExecuteOptions::new()
                    .with_sudo()
                    .with_timeout(Duration::from_secs(30)),
            )
            .await
            .map_err(|e| FixerError::ExecutionFailed(e.to_string()))?;
        if !status.success {
            return Err(FixerError::VerificationFailed(format!(
                "jail {jail} is not active"
            )));
        }

        if hardened {
            let retry = self
                .executor
                .execute(
                    &format!("fail2ban-client get {jail} maxretry"),
                    ExecuteOptions::new()
                        .with_sudo()
                        .with_timeout(Duration::from_secs(30)),
                )
                .await
                .map_err(|e| FixerError::ExecutionFailed(e.to_string()))?;
            let configured = retry.stdout.trim() == HARDENED_MAX_RETRY.to_string()
                || retry.stdout.starts_with("[DRY-RUN]");
            if !(retry.success && configured) {
                return Err(FixerError::VerificationFailed(format!(
                    "jail {jail} maxretry not hardened (got '{}')",
                    retry.stdout.trim()
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Fixer for HostIpsFixer {
    fn source(&self) -> EventSource {
        EventSource::HostIps
    }

    async fn fix(
        &self,
        events: &[SecurityEvent],
        strategy: &FixStrategy,
    ) -> Result<FixOutcome, FixerError> {
        let method = Self::determine_method(strategy);
        let jail = Self::detect_jail(events, strategy);
        let ips = Self::extract_ips(events);

        info!(jail, ?method, ips = ips.len(), "host IPS fix starting");

        let backups = self
            .backup_manager
            .create_batch_backup(&[JAIL_CONFIG_PATH.to_string()])
            .await;
        let backup_ids: Vec<String> = backups.values().map(|b| b.backup_id.clone()).collect();

        let hardened = matches!(method, FixMethod::Harden | FixMethod::Combined);
        let result: Result<String, FixerError> = async {
            match method {
                FixMethod::Harden => {
                    self.harden_jail(&jail).await?;
                    Ok(format!("jail {jail} hardened"))
                }
                FixMethod::PermanentBan => {
                    if ips.is_empty() {
                        return Err(FixerError::BadEvent(
                            "no offending IPs to ban permanently".into(),
                        ));
                    }
                    let banned = self.ban_permanently(&jail, &ips).await?;
                    Ok(format!("{banned}/{} IPs banned in {jail}", ips.len()))
                }
                FixMethod::Combined => {
                    self.harden_jail(&jail).await?;
                    let banned = self.ban_permanently(&jail, &ips).await?;
                    Ok(format!("jail {jail} hardened, {banned} IPs banned"))
                }
            }
        }
        .await;

        let message = match result {
            Ok(message) => message,
            Err(e) => {
                let _ = self.backup_manager.rollback_batch(&backup_ids).await;
                return Err(e);
            }
        };

        if let Err(e) = self.verify(&jail, hardened).await {
            warn!(error = %e, "verification failed, rolling back jail config");
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

    fn fixer(dir: &TempDir) -> HostIpsFixer {
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
        HostIpsFixer::new(executor, backup_manager)
    }

    fn ban(ip: &str, jail: &str) -> SecurityEvent {
        SecurityEvent::new(
            EventSource::HostIps,
            Severity::Medium,
            EventDetails::HostBan {
                ip: ip.into(),
                jail: jail.into(),
            },
        )
    }

    #[test]
    fn test_method_selection_table() {
        let m = |text: &str| HostIpsFixer::determine_method(&FixStrategy::new(text, 0.9));
        assert_eq!(m("harden the jail"), FixMethod::Harden);
        assert_eq!(m("tighten jail config"), FixMethod::Harden);
        assert_eq!(m("lower maxretry"), FixMethod::Harden);
        assert_eq!(m("permanent ban of attackers"), FixMethod::PermanentBan);
        assert_eq!(m("ban the offending ips"), FixMethod::PermanentBan);
        assert_eq!(m("combined hardening and bans"), FixMethod::Combined);
        assert_eq!(m("something else entirely"), FixMethod::Harden);
    }

    #[test]
    fn test_jail_detection_precedence() {
        // Event details win.
        let events = vec![ban("198.51.100.2", "nginx-http-auth")];
        let strategy = FixStrategy::new("harden sshd", 0.9);
        assert_eq!(
            HostIpsFixer::detect_jail(&events, &strategy),
            "nginx-http-auth"
        );

        // Then plan text.
        let strategy = FixStrategy::new("harden the apache jail", 0.9);
        assert_eq!(HostIpsFixer::detect_jail(&[], &strategy), "apache-auth");

        // Default sshd.
        let strategy = FixStrategy::new("harden things", 0.9);
        assert_eq!(HostIpsFixer::detect_jail(&[], &strategy), "sshd");
    }

    #[tokio::test]
    async fn test_harden_flow_dry_run() {
        let dir = TempDir::new().unwrap();
        let outcome = fixer(&dir)
            .fix(
                &[ban("198.51.100.2", "sshd")],
                &FixStrategy::new("harden jail with stricter maxretry", 0.9),
            )
            .await
            .unwrap();
        assert!(outcome.message.contains("hardened"));
    }

    #[tokio::test]
    async fn test_permanent_ban_requires_ips() {
        let dir = TempDir::new().unwrap();
        // Strategy wants bans but no events carry IPs.
        let err = fixer(&dir)
            .fix(&[], &FixStrategy::new("permanent ban", 0.9))
            .await
            .unwrap_err();
        assert!(matches!(err, FixerError::BadEvent(_)));
    }

    #[tokio::test]
    async fn test_combined_flow_dry_run() {
        let dir = TempDir::new().unwrap();
        let outcome = fixer(&dir)
            .fix(
                &[ban("198.51.100.2", "sshd"), ban("198.51.100.3", "sshd")],
                &FixStrategy::new("combined response", 0.9),
            )
            .await
            .unwrap();
        assert!(outcome.message.contains("hardened"));
        assert!(outcome.message.contains("2 IPs banned"));
    }
}
