//! Security events: the normalized observations the pipeline runs on.
//!
//! Every source adapter emits `SecurityEvent`s; the watcher deduplicates
//! them by `signature()` and hands new ones to the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The security tool a signal originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// Container/image vulnerability scanner.
    VulnerabilityScan,
    /// Host intrusion prevention (jail bans).
    HostIps,
    /// Network threat feed (community ban decisions).
    NetworkIps,
    /// File-integrity monitor.
    FileIntegrity,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VulnerabilityScan => "vulnerability_scan",
            Self::HostIps => "host_ips",
            Self::NetworkIps => "network_ips",
            Self::FileIntegrity => "file_integrity",
        }
    }

    /// The free-form event tag adapters attach for this source.
    pub fn default_event_type(&self) -> &'static str {
        match self {
            Self::VulnerabilityScan => "vulnerability",
            Self::HostIps => "ban",
            Self::NetworkIps => "threat",
            Self::FileIntegrity => "integrity_violation",
        }
    }

    /// Whether conditions from this source persist until remediated.
    ///
    /// Bans and threat-feed decisions are already mitigated by the tool
    /// itself; vulnerabilities and integrity violations are not.
    pub fn is_persistent(&self) -> bool {
        matches!(self, Self::VulnerabilityScan | Self::FileIntegrity)
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vulnerability_scan" => Ok(Self::VulnerabilityScan),
            "host_ips" => Ok(Self::HostIps),
            "network_ips" => Ok(Self::NetworkIps),
            "file_integrity" => Ok(Self::FileIntegrity),
            other => Err(format!("unknown event source: {other}")),
        }
    }
}

/// Event severity, ordered by priority (CRITICAL highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Unknown,
}

impl Severity {
    /// Numeric priority for batch ordering: CRITICAL=4 .. UNKNOWN=0.
    pub fn priority(&self) -> u8 {
        match self {
            Self::Critical => 4,
            Self::High => 3,
            Self::Medium => 2,
            Self::Low => 1,
            Self::Unknown => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CRITICAL" => Ok(Self::Critical),
            "HIGH" => Ok(Self::High),
            "MEDIUM" => Ok(Self::Medium),
            "LOW" => Ok(Self::Low),
            "UNKNOWN" => Ok(Self::Unknown),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// Structured per-source event payload.
///
/// A tagged variant per source gives fixer dispatch compile-time
/// exhaustiveness while staying losslessly serializable for the
/// knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventDetails {
    /// One scanner finding.
    Vulnerability {
        cve_id: String,
        package: String,
        installed_version: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fixed_version: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<String>,
    },
    /// Aggregate scanner statistics (reports without per-finding rows).
    VulnerabilityBatch {
        critical: u32,
        high: u32,
        medium: u32,
        images: u32,
    },
    /// A network threat-feed decision.
    NetworkThreat {
        ip: String,
        scenario: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        country: Option<String>,
    },
    /// A host-IPS jail ban.
    HostBan { ip: String, jail: String },
    /// A file-integrity change.
    IntegrityChange { path: String, change_kind: String },
    /// Meta-event: an adapter failed several consecutive polls.
    AdapterFailure {
        adapter: String,
        consecutive_failures: u32,
        last_error: String,
    },
}

impl EventDetails {
    /// Filesystem paths this payload touches, for impact analysis.
    pub fn affected_paths(&self) -> Vec<String> {
        match self {
            Self::IntegrityChange { path, .. } => vec![path.clone()],
            _ => Vec::new(),
        }
    }
}

/// A normalized security observation. Immutable after emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub source: EventSource,
    pub event_type: String,
    pub severity: Severity,
    pub details: EventDetails,
    pub timestamp: DateTime<Utc>,
    pub event_id: String,
}

impl SecurityEvent {
    pub fn new(source: EventSource, severity: Severity, details: EventDetails) -> Self {
        let timestamp = Utc::now();
        let event_type = source.default_event_type().to_string();
        let event_id = format!(
            "{}_{}_{}",
            source.as_str(),
            event_type,
            timestamp.timestamp_millis()
        );
        Self {
            source,
            event_type,
            severity,
            details,
            timestamp,
            event_id,
        }
    }

    /// Deterministic signature identifying "the same issue".
    ///
    /// Two events with equal signatures must not both trigger
    /// remediation within their source's suppression window.
    pub fn signature(&self) -> String {
        match &self.details {
            EventDetails::Vulnerability {
                cve_id,
                package,
                installed_version,
                ..
            } => format!("scan:{cve_id}:{package}:{installed_version}"),
            EventDetails::VulnerabilityBatch {
                critical,
                high,
                medium,
                images,
            } => format!("scan_batch:{critical}c:{high}h:{medium}m:{images}i"),
            EventDetails::NetworkThreat { ip, scenario, .. } => format!("net:{ip}:{scenario}"),
            EventDetails::HostBan { ip, jail } => format!("host:{ip}:{jail}"),
            EventDetails::IntegrityChange { path, change_kind } => {
                format!("file:{path}:{change_kind}")
            }
            EventDetails::AdapterFailure { adapter, .. } => {
                format!("meta:{adapter}:adapter_failure")
            }
        }
    }

    /// Whether the underlying condition persists until fixed.
    pub fn is_persistent(&self) -> bool {
        self.source.is_persistent()
    }
}
