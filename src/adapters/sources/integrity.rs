//! File-integrity monitor adapter.
//!
//! Reads the integrity checker's report of changed files. Changes
//! under a configured list of critical path prefixes are CRITICAL,
//! everything else HIGH.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::SystemTime;
use tokio::sync::Mutex;

use crate::domain::errors::WatcherError;
use crate::domain::models::{EventDetails, EventSource, SecurityEvent, Severity};
use crate::domain::ports::SourceAdapter;

#[derive(Debug, Deserialize)]
struct IntegrityReport {
    #[serde(default)]
    changes: Vec<IntegrityEntry>,
}

#[derive(Debug, Deserialize)]
struct IntegrityEntry {
    file: String,
    #[serde(default = "default_change_type")]
    change_type: String,
}

fn default_change_type() -> String {
    "modified".to_string()
}

pub struct IntegrityAdapter {
    report_path: PathBuf,
    critical_prefixes: Vec<String>,
    last_report: Mutex<Option<SystemTime>>,
}

impl IntegrityAdapter {
    pub fn new(report_path: impl Into<PathBuf>, critical_prefixes: Vec<String>) -> Self {
        Self {
            report_path: report_path.into(),
            critical_prefixes,
            last_report: Mutex::new(None),
        }
    }

    fn classify(&self, path: &str) -> Severity {
        if self
            .critical_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix))
        {
            Severity::Critical
        } else {
            Severity::High
        }
    }
}

#[async_trait]
impl SourceAdapter for IntegrityAdapter {
    fn source(&self) -> EventSource {
        EventSource::FileIntegrity
    }

    async fn poll(&self) -> Result<Vec<SecurityEvent>, WatcherError> {
        let metadata = match tokio::fs::metadata(&self.report_path).await {
            Ok(m) => m,
            Err(_) => return Ok(Vec::new()),
        };
        let modified = metadata.modified().map_err(|e| WatcherError::PollFailed {
            source_name: self.source().to_string(),
            reason: e.to_string(),
        })?;

        let mut last = self.last_report.lock().await;
        if *last == Some(modified) {
            return Ok(Vec::new());
        }

        let raw = tokio::fs::read_to_string(&self.report_path)
            .await
            .map_err(|e| WatcherError::PollFailed {
                source_name: self.source().to_string(),
                reason: e.to_string(),
            })?;

        let report: IntegrityReport =
            serde_json::from_str(&raw).map_err(|e| WatcherError::ParseFailed {
                source_name: self.source().to_string(),
                reason: e.to_string(),
            })?;

        let events = report
            .changes
            .into_iter()
            .map(|entry| {
                let severity = self.classify(&entry.file);
                SecurityEvent::new(
                    EventSource::FileIntegrity,
                    severity,
                    EventDetails::IntegrityChange {
                        path: entry.file,
                        change_kind: entry.change_type,
                    },
                )
            })
            .collect();

        *last = Some(modified);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn adapter(path: &std::path::Path) -> IntegrityAdapter {
        IntegrityAdapter::new(
            path,
            vec!["/etc/shadow".to_string(), "/etc/ssh/".to_string()],
        )
    }

    #[tokio::test]
    async fn test_critical_prefix_classification() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(
            br#"{"changes": [
                {"file": "/etc/shadow", "change_type": "modified"},
                {"file": "/var/www/index.html", "change_type": "added"}
            ]}"#,
        )
        .unwrap();
        file.flush().unwrap();

        let events = adapter(file.path()).poll().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].severity, Severity::Critical);
        assert_eq!(events[0].signature(), "file:/etc/shadow:modified");
        assert_eq!(events[1].severity, Severity::High);
        assert_eq!(events[1].signature(), "file:/var/www/index.html:added");
    }

    #[tokio::test]
    async fn test_unchanged_report_yields_nothing() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(br#"{"changes": [{"file": "/etc/ssh/sshd_config"}]}"#)
            .unwrap();
        file.flush().unwrap();

        let a = adapter(file.path());
        assert_eq!(a.poll().await.unwrap().len(), 1);
        assert!(a.poll().await.unwrap().is_empty());
    }
}
