//! Vulnerability scanner adapter.
//!
//! Reads the scanner's JSON report and emits one event per finding.
//! Reports that carry only aggregate statistics (no per-finding rows)
//! produce a single batch-statistics event instead; the two shapes
//! yield the two signature forms (`scan:...` vs `scan_batch:...`).

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::SystemTime;
use tokio::sync::Mutex;

use crate::domain::errors::WatcherError;
use crate::domain::models::{EventDetails, EventSource, SecurityEvent, Severity};
use crate::domain::ports::SourceAdapter;

#[derive(Debug, Deserialize)]
struct ScanReport {
    #[serde(default, rename = "Results")]
    results: Vec<ScanResult>,
    #[serde(default, rename = "Stats")]
    stats: Option<ScanStats>,
}

#[derive(Debug, Deserialize)]
struct ScanResult {
    #[serde(default, rename = "Target")]
    target: String,
    #[serde(default, rename = "Vulnerabilities")]
    vulnerabilities: Vec<ScanFinding>,
}

#[derive(Debug, Deserialize)]
struct ScanFinding {
    #[serde(rename = "VulnerabilityID")]
    vulnerability_id: String,
    #[serde(rename = "PkgName")]
    pkg_name: String,
    #[serde(rename = "InstalledVersion")]
    installed_version: String,
    #[serde(default, rename = "FixedVersion")]
    fixed_version: Option<String>,
    #[serde(default, rename = "Severity")]
    severity: String,
}

#[derive(Debug, Deserialize)]
struct ScanStats {
    #[serde(default)]
    critical: u32,
    #[serde(default)]
    high: u32,
    #[serde(default)]
    medium: u32,
    #[serde(default)]
    images: u32,
}

pub struct ScannerAdapter {
    report_path: PathBuf,
    /// Modification time of the last report processed.
    last_report: Mutex<Option<SystemTime>>,
}

impl ScannerAdapter {
    pub fn new(report_path: impl Into<PathBuf>) -> Self {
        Self {
            report_path: report_path.into(),
            last_report: Mutex::new(None),
        }
    }

    fn parse(&self, raw: &str) -> Result<Vec<SecurityEvent>, WatcherError> {
        let report: ScanReport =
            serde_json::from_str(raw).map_err(|e| WatcherError::ParseFailed {
                source_name: EventSource::VulnerabilityScan.to_string(),
                reason: e.to_string(),
            })?;

        let mut events = Vec::new();
        for result in &report.results {
            for finding in &result.vulnerabilities {
                let severity = finding
                    .severity
                    .parse::<Severity>()
                    .unwrap_or(Severity::Unknown);
                events.push(SecurityEvent::new(
                    EventSource::VulnerabilityScan,
                    severity,
                    EventDetails::Vulnerability {
                        cve_id: finding.vulnerability_id.clone(),
                        package: finding.pkg_name.clone(),
                        installed_version: finding.installed_version.clone(),
                        fixed_version: finding.fixed_version.clone(),
                        image: if result.target.is_empty() {
                            None
                        } else {
                            Some(result.target.clone())
                        },
                    },
                ));
            }
        }

        // Aggregate-only reports: one batch-statistics event.
        if events.is_empty() {
            if let Some(stats) = &report.stats {
                let severity = if stats.critical > 0 {
                    Severity::Critical
                } else if stats.high > 0 {
                    Severity::High
                } else {
                    Severity::Medium
                };
                events.push(SecurityEvent::new(
                    EventSource::VulnerabilityScan,
                    severity,
                    EventDetails::VulnerabilityBatch {
                        critical: stats.critical,
                        high: stats.high,
                        medium: stats.medium,
                        images: stats.images,
                    },
                ));
            }
        }

        Ok(events)
    }
}

#[async_trait]
impl SourceAdapter for ScannerAdapter {
    fn source(&self) -> EventSource {
        EventSource::VulnerabilityScan
    }

    async fn poll(&self) -> Result<Vec<SecurityEvent>, WatcherError> {
        let metadata = match tokio::fs::metadata(&self.report_path).await {
            Ok(m) => m,
            // No report yet: nothing to emit this cycle.
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

        let events = self.parse(&raw)?;
        *last = Some(modified);
        Ok(events)
    }
}
