//! Impact assessment types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a fix's impact on running projects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactSeverity {
    None,
    Minimal,
    Moderate,
    Significant,
    Critical,
}

impl ImpactSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Minimal => "minimal",
            Self::Moderate => "moderate",
            Self::Significant => "significant",
            Self::Critical => "critical",
        }
    }

    /// Base downtime in seconds for this severity level.
    pub fn base_downtime_seconds(&self) -> u32 {
        match self {
            Self::None | Self::Minimal => 0,
            Self::Moderate => 30,
            Self::Significant => 60,
            Self::Critical => 120,
        }
    }
}

impl fmt::Display for ImpactSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed run state of a monitored project's processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    Running,
    Stopped,
    Unknown,
    Error,
}

/// Structured assessment of a fix's blast radius.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactAssessment {
    pub affected_projects: Vec<String>,
    pub impact_severity: ImpactSeverity,
    pub downtime_estimate_seconds: u32,
    pub risks: Vec<String>,
    pub mitigation_steps: Vec<String>,
    /// Order to stop services (start order is the reverse, with
    /// dependencies first).
    pub service_order: Vec<String>,
    pub requires_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(ImpactSeverity::Critical > ImpactSeverity::Significant);
        assert!(ImpactSeverity::Significant > ImpactSeverity::Moderate);
        assert!(ImpactSeverity::Moderate > ImpactSeverity::Minimal);
        assert!(ImpactSeverity::Minimal > ImpactSeverity::None);
    }

    #[test]
    fn test_base_downtime_ladder() {
        assert_eq!(ImpactSeverity::None.base_downtime_seconds(), 0);
        assert_eq!(ImpactSeverity::Minimal.base_downtime_seconds(), 0);
        assert_eq!(ImpactSeverity::Moderate.base_downtime_seconds(), 30);
        assert_eq!(ImpactSeverity::Significant.base_downtime_seconds(), 60);
        assert_eq!(ImpactSeverity::Critical.base_downtime_seconds(), 120);
    }
}
