//! Notifier port: the generic output sink.
//!
//! The core never inspects notifier internals; any platform can
//! implement this. The only return path is the approval decision.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Logical channels the core writes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    BotStatus,
    Critical,
    Alerts,
    Approvals,
    CodeFixes,
    DeploymentLog,
    Orchestrator,
    Stats,
    ProjectUpdates(String),
    CustomerAlerts(String),
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BotStatus => f.write_str("bot_status"),
            Self::Critical => f.write_str("critical"),
            Self::Alerts => f.write_str("alerts"),
            Self::Approvals => f.write_str("approvals"),
            Self::CodeFixes => f.write_str("code_fixes"),
            Self::DeploymentLog => f.write_str("deployment_log"),
            Self::Orchestrator => f.write_str("orchestrator"),
            Self::Stats => f.write_str("stats"),
            Self::ProjectUpdates(name) => write!(f, "project_updates:{name}"),
            Self::CustomerAlerts(name) => write!(f, "customer_alerts:{name}"),
        }
    }
}

/// Outcome of an approval request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub approver: Option<String>,
}

impl ApprovalDecision {
    pub fn rejected() -> Self {
        Self {
            approved: false,
            approver: None,
        }
    }

    pub fn approved_by(approver: impl Into<String>) -> Self {
        Self {
            approved: true,
            approver: Some(approver.into()),
        }
    }
}

/// Output sink for notifications and approval requests.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Fire-and-forget message to a logical channel.
    async fn send(&self, channel: ChannelKind, message: &str);

    /// Block until a human decision arrives or the timeout elapses.
    /// Timeout is treated as rejection by callers.
    async fn request_approval(&self, plan_summary: &str, timeout: Duration) -> ApprovalDecision;

    /// Edit an existing message (streaming status, dashboards).
    /// Returns the handle, which may change if the message had to be
    /// re-sent.
    async fn update_live(&self, handle: &str, new_content: &str) -> String;

    /// One-time bootstrap of required logical channels.
    async fn ensure_channels(&self, layout: &[ChannelKind]);
}
