//! Network threat fixer: firewall blocks and threat-feed decisions.
//!
//! Strategy selection by plan text:
//! ufw|firewall -> permanent block; extended|duration -> extended feed
//! decision; range|subnet -> /24 block for coordinated attacks;
//! combined|both -> firewall block plus extended decision.
//!
//! Whitelisted addresses are refused with a distinct error, never
//! silently dropped.

use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
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
    UfwPermanent,
    ExtendedDecision,
    RangeBlocking,
    Combined,
}

pub struct NetworkFixer {
    executor: Arc<CommandExecutor>,
    backup_manager: Arc<BackupManager>,
    whitelist: HashSet<String>,
}

impl NetworkFixer {
    pub fn new(
        executor: Arc<CommandExecutor>,
        backup_manager: Arc<BackupManager>,
        whitelist: Vec<String>,
    ) -> Self {
        let mut whitelist: HashSet<String> = whitelist.into_iter().collect();
        whitelist.insert("127.0.0.1".to_string());
        whitelist.insert("::1".to_string());
        Self {
            executor,
            backup_manager,
            whitelist,
        }
    }

    fn determine_method(strategy: &FixStrategy) -> FixMethod {
        let text = strategy.description.to_lowercase();
        if text.contains("combined") || text.contains("both") {
            FixMethod::Combined
        } else if text.contains("range") || text.contains("subnet") {
            FixMethod::RangeBlocking
        } else if text.contains("extended") || text.contains("duration") {
            FixMethod::ExtendedDecision
        } else {
            // ufw | firewall | anything else
            FixMethod::UfwPermanent
        }
    }

    fn extract_ips(events: &[SecurityEvent]) -> Result<Vec<String>, FixerError> {
        let mut ips = Vec::new();
        for event in events {
            match &event.details {
                EventDetails::NetworkThreat { ip, .. } => {
                    if !ips.contains(ip) {
                        ips.push(ip.clone());
                    }
                }
                other => {
                    return Err(FixerError::BadEvent(format!(
                        "network fixer cannot handle payload: {other:?}"
                    )))
                }
            }
        }
        if ips.is_empty() {
            return Err(FixerError::BadEvent("no threat IPs in events".into()));
        }
        Ok(ips)
    }

    /// Refuse whitelisted or unparseable addresses outright.
    fn validate_ips(&self, ips: &[String]) -> Result<Vec<String>, FixerError> {
        let mut validated = Vec::new();
        for ip in ips {
            if self.whitelist.contains(ip) {
                return Err(FixerError::RefusedUnsafe(format!(
                    "refusing to block whitelisted address {ip}"
                )));
            }
            if ip.parse::<IpAddr>().is_err() {
                return Err(FixerError::RefusedUnsafe(format!(
                    "refusing to block unparseable address {ip}"
                )));
            }
            validated.push(ip.clone());
        }
        Ok(validated)
    }

    /// Ban duration parsed from the plan text; defaults to 24h.
    fn extract_duration(strategy: &FixStrategy) -> String {
        let pattern = Regex::new(r"(?i)(\d+)\s*(h|hour|hours|d|day|days)").expect("valid pattern");
        if let Some(captures) = pattern.captures(&strategy.description) {
            let value: u64 = captures[1].parse().unwrap_or(24);
            let hours = if captures[2].to_lowercase().starts_with('d') {
                value * 24
            } else {
                value
            };
            return format!("{hours}h");
        }
        "24h".to_string()
    }

    /// Group addresses by /24 and keep subnets with at least two
    /// members (coordinated attack indicator).
    fn coordinated_subnets(ips: &[String]) -> Vec<String> {
        let mut subnets: BTreeMap<String, usize> = BTreeMap::new();
        for ip in ips {
            if let Ok(IpAddr::V4(v4)) = ip.parse::<IpAddr>() {
                let octets = v4.octets();
                let subnet = format!("{}.{}.{}.0/24", octets[0], octets[1], octets[2]);
                *subnets.entry(subnet).or_insert(0) += 1;
            }
        }
        subnets
            .into_iter()
            .filter(|(_, count)| *count >= 2)
            .map(|(subnet, _)| subnet)
            .collect()
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

    async fn block_ips_ufw(&self, ips: &[String]) -> Result<usize, FixerError> {
        let mut blocked = 0;
        for ip in ips {
            if self.run(&format!("ufw deny from {ip}")).await? {
                blocked += 1;
            } else {
                warn!(%ip, "firewall deny rule failed");
            }
        }
        if blocked > 0 && !self.run("ufw reload").await? {
            warn!("firewall reload failed, rules may not be active");
        }
        Ok(blocked)
    }

    async fn extend_decisions(&self, ips: &[String], duration: &str) -> Result<usize, FixerError> {
        let mut added = 0;
        for ip in ips {
            let command = format!(
                "cscli decisions add --ip {ip} --duration {duration} --type ban \
                 --reason 'extended by vigil auto-remediation'"
            );
            if self.run(&command).await? {
                added += 1;
            }
        }
        Ok(added)
    }

    async fn block_subnets(&self, ips: &[String]) -> Result<Vec<String>, FixerError> {
        let subnets = Self::coordinated_subnets(ips);
        let mut blocked = Vec::new();
        for subnet in &subnets {
            if self.run(&format!("ufw deny from {subnet}")).await? {
                blocked.push(subnet.clone());
            }
        }
        if !blocked.is_empty() {
            let _ = self.run("ufw reload").await?;
        }
        Ok(blocked)
    }

    /// Verify every address appears in the firewall rule listing.
    async fn verify_blocking(&self, targets: &[String]) -> Result<(), FixerError> {
        for target in targets {
            let result = self
                .executor
                .execute(
                    &format!("ufw status | grep -F '{target}'"),
                    ExecuteOptions::new()
                        .with_sudo()
                        .with_timeout(Duration::from_secs(30)),
                )
                .await
                .map_err(|e| FixerError::ExecutionFailed(e.to_string()))?;
            // Dry-run synthesizes success without output.
            let listed = result.success
                && (result.stdout.contains("DENY") || result.stdout.starts_with("[DRY-RUN]"));
            if !listed {
                return Err(FixerError::VerificationFailed(format!(
                    "no firewall rule enumerated for {target}"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Fixer for NetworkFixer {
    fn source(&self) -> EventSource {
        EventSource::NetworkIps
    }

    async fn fix(
        &self,
        events: &[SecurityEvent],
        strategy: &FixStrategy,
    ) -> Result<FixOutcome, FixerError> {
        let ips = Self::extract_ips(events)?;
        let validated = self.validate_ips(&ips)?;
        let method = Self::determine_method(strategy);

        info!(ips = validated.len(), ?method, "network fix starting");

        // Firewall rules are about to change: snapshot them.
        let backups = self
            .backup_manager
            .create_batch_backup(&["/etc/ufw/user.rules".to_string()])
            .await;
        let backup_ids: Vec<String> = backups.values().map(|b| b.backup_id.clone()).collect();

        let (message, verify_targets) = match method {
            FixMethod::UfwPermanent => {
                let blocked = self.block_ips_ufw(&validated).await?;
                (
                    format!("{blocked}/{} IPs blocked via firewall", validated.len()),
                    validated.clone(),
                )
            }
            FixMethod::ExtendedDecision => {
                let duration = Self::extract_duration(strategy);
                let added = self.extend_decisions(&validated, &duration).await?;
                if added == 0 {
                    return Err(FixerError::ExecutionFailed(
                        "no threat-feed decisions added".into(),
                    ));
                }
                // Feed decisions are not firewall rules; nothing to
                // enumerate in ufw.
                (format!("{added} decisions extended to {duration}"), vec![])
            }
            FixMethod::RangeBlocking => {
                let blocked = self.block_subnets(&validated).await?;
                if blocked.is_empty() {
                    // No coordinated subnet: fall back to per-IP rules.
                    let count = self.block_ips_ufw(&validated).await?;
                    (
                        format!("no shared /24; {count} individual IPs blocked"),
                        validated.clone(),
                    )
                } else {
                    (format!("{} subnet(s) blocked", blocked.len()), blocked)
                }
            }
            FixMethod::Combined => {
                let blocked = self.block_ips_ufw(&validated).await?;
                let duration = Self::extract_duration(strategy);
                let added = self.extend_decisions(&validated, &duration).await?;
                (
                    format!("{blocked} firewall blocks, {added} extended decisions"),
                    validated.clone(),
                )
            }
        };

        if let Err(e) = self.verify_blocking(&verify_targets).await {
            warn!(error = %e, "verification failed, rolling back firewall rules");
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

    fn fixer(dir: &TempDir, whitelist: Vec<String>) -> NetworkFixer {
        // Dry-run executor: commands are logged, not run.
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
        NetworkFixer::new(executor, backup_manager, whitelist)
    }

    fn threat(ip: &str) -> SecurityEvent {
        SecurityEvent::new(
            EventSource::NetworkIps,
            Severity::High,
            EventDetails::NetworkThreat {
                ip: ip.into(),
                scenario: "ssh-bf".into(),
                country: None,
            },
        )
    }

    #[test]
    fn test_method_selection_table() {
        let m = |text: &str| NetworkFixer::determine_method(&FixStrategy::new(text, 0.9));
        assert_eq!(m("permanent ufw block"), FixMethod::UfwPermanent);
        assert_eq!(m("update firewall rules"), FixMethod::UfwPermanent);
        assert_eq!(m("extended ban duration 48h"), FixMethod::ExtendedDecision);
        assert_eq!(m("block the whole subnet"), FixMethod::RangeBlocking);
        assert_eq!(m("block the ip range"), FixMethod::RangeBlocking);
        assert_eq!(m("combined blocking"), FixMethod::Combined);
        assert_eq!(m("apply both measures"), FixMethod::Combined);
        assert_eq!(m("just do something"), FixMethod::UfwPermanent);
    }

    #[test]
    fn test_duration_extraction() {
        let d = |text: &str| NetworkFixer::extract_duration(&FixStrategy::new(text, 0.9));
        assert_eq!(d("extended ban for 48h"), "48h");
        assert_eq!(d("extend for 2 days"), "48h");
        assert_eq!(d("extended ban"), "24h");
    }

    #[test]
    fn test_coordinated_subnet_grouping() {
        let ips = vec![
            "203.0.113.5".to_string(),
            "203.0.113.6".to_string(),
            "203.0.113.7".to_string(),
            "198.51.100.1".to_string(),
        ];
        let subnets = NetworkFixer::coordinated_subnets(&ips);
        assert_eq!(subnets, vec!["203.0.113.0/24"]);
    }

    #[tokio::test]
    async fn test_whitelisted_ip_is_refused_not_dropped() {
        let dir = TempDir::new().unwrap();
        let fixer = fixer(&dir, vec!["192.0.2.10".to_string()]);
        let events = vec![threat("192.0.2.10")];
        let err = fixer
            .fix(&events, &FixStrategy::new("firewall block", 0.9))
            .await
            .unwrap_err();
        assert!(err.is_refusal());
    }

    #[tokio::test]
    async fn test_loopback_always_whitelisted() {
        let dir = TempDir::new().unwrap();
        let fixer = fixer(&dir, vec![]);
        let events = vec![threat("127.0.0.1")];
        assert!(fixer
            .fix(&events, &FixStrategy::new("firewall block", 0.9))
            .await
            .unwrap_err()
            .is_refusal());
    }

    #[tokio::test]
    async fn test_invalid_ip_is_refused() {
        let dir = TempDir::new().unwrap();
        let fixer = fixer(&dir, vec![]);
        let events = vec![threat("not-an-ip; rm x")];
        assert!(fixer
            .fix(&events, &FixStrategy::new("firewall block", 0.9))
            .await
            .unwrap_err()
            .is_refusal());
    }

    #[tokio::test]
    async fn test_subnet_block_for_coordinated_attack() {
        let dir = TempDir::new().unwrap();
        let fixer = fixer(&dir, vec![]);
        let events = vec![
            threat("203.0.113.5"),
            threat("203.0.113.6"),
            threat("203.0.113.7"),
        ];
        let outcome = fixer
            .fix(&events, &FixStrategy::new("block attacker subnet", 0.9))
            .await
            .unwrap();
        assert!(outcome.message.contains("1 subnet(s) blocked"));
    }

    #[tokio::test]
    async fn test_wrong_payload_is_bad_event() {
        let dir = TempDir::new().unwrap();
        let fixer = fixer(&dir, vec![]);
        let events = vec![SecurityEvent::new(
            EventSource::NetworkIps,
            Severity::High,
            EventDetails::HostBan {
                ip: "1.2.3.4".into(),
                jail: "sshd".into(),
            },
        )];
        assert!(matches!(
            fixer
                .fix(&events, &FixStrategy::new("firewall", 0.9))
                .await
                .unwrap_err(),
            FixerError::BadEvent(_)
        ));
    }
}
