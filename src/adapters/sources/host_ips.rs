//! Host intrusion-prevention adapter.
//!
//! Polls jail status output for banned addresses. Bans are already
//! enforced by the tool, so events are MEDIUM and self-resolving.

use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::Mutex;

use super::run_tool_command;
use crate::domain::errors::WatcherError;
use crate::domain::models::{EventDetails, EventSource, SecurityEvent, Severity};
use crate::domain::ports::SourceAdapter;

pub struct HostIpsAdapter {
    status_command: String,
    jails: Vec<String>,
    seen: Mutex<HashSet<String>>,
}

impl HostIpsAdapter {
    pub fn new(status_command: impl Into<String>, jails: Vec<String>) -> Self {
        Self {
            status_command: status_command.into(),
            jails,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Extract banned addresses from `status <jail>` output.
    ///
    /// The tool prints a `Banned IP list:` line with space-separated
    /// addresses.
    fn parse_banned_ips(output: &str) -> Vec<String> {
        for line in output.lines() {
            if let Some(rest) = line.split("Banned IP list:").nth(1) {
                return rest
                    .split_whitespace()
                    .map(ToString::to_string)
                    .collect();
            }
        }
        Vec::new()
    }
}

#[async_trait]
impl SourceAdapter for HostIpsAdapter {
    fn source(&self) -> EventSource {
        EventSource::HostIps
    }

    async fn poll(&self) -> Result<Vec<SecurityEvent>, WatcherError> {
        let mut events = Vec::new();
        let mut seen = self.seen.lock().await;

        for jail in &self.jails {
            let command = format!("{} {jail}", self.status_command);
            let output = run_tool_command(self.source().as_str(), &command).await?;
            if !output.status.success() {
                return Err(WatcherError::PollFailed {
                    source_name: self.source().to_string(),
                    reason: format!(
                        "jail {jail}: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                });
            }

            for ip in Self::parse_banned_ips(&String::from_utf8_lossy(&output.stdout)) {
                let key = format!("{ip}:{jail}");
                if seen.insert(key) {
                    events.push(SecurityEvent::new(
                        EventSource::HostIps,
                        Severity::Medium,
                        EventDetails::HostBan {
                            ip,
                            jail: jail.clone(),
                        },
                    ));
                }
            }
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_banned_ip_line() {
        let output = "Status for the jail: sshd\n\
                      |- Filter\n\
                      `- Actions\n\
                         |- Currently banned: 2\n\
                         `- Banned IP list: 198.51.100.7 198.51.100.8\n";
        let ips = HostIpsAdapter::parse_banned_ips(output);
        assert_eq!(ips, vec!["198.51.100.7", "198.51.100.8"]);
    }

    #[test]
    fn test_parse_no_bans() {
        let output = "Status for the jail: sshd\n`- Banned IP list:\n";
        assert!(HostIpsAdapter::parse_banned_ips(output).is_empty());
        assert!(HostIpsAdapter::parse_banned_ips("garbage").is_empty());
    }

    #[tokio::test]
    async fn test_poll_emits_once_per_ban() {
        let adapter = HostIpsAdapter::new(
            "echo 'Banned IP list: 198.51.100.7' #",
            vec!["sshd".to_string()],
        );
        let first = adapter.poll().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].severity, Severity::Medium);
        assert_eq!(first[0].signature(), "host:198.51.100.7:sshd");

        assert!(adapter.poll().await.unwrap().is_empty());
    }
}
