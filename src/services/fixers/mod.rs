//! Fixers: source-specific executors of a plan's steps.
//!
//! Common shape: extract a normalized view of the events, pick a fix
//! method from the strategy text, back up anything about to change,
//! execute, verify, and roll back the backups on verification
//! failure.
//!
//! Fixers receive all of a batch's events for their source at once so
//! cross-event strategies (subnet blocks for coordinated attacks) see
//! the full picture.

pub mod host;
pub mod integrity;
pub mod network;
pub mod vulnerability;

pub use host::HostIpsFixer;
pub use integrity::IntegrityFixer;
pub use network::NetworkFixer;
pub use vulnerability::VulnerabilityFixer;

use async_trait::async_trait;

use crate::domain::errors::FixerError;
use crate::domain::models::plan::FixStrategy;
use crate::domain::models::{EventSource, SecurityEvent};

/// Result of a successful fix.
#[derive(Debug, Clone)]
pub struct FixOutcome {
    pub message: String,
    /// Backups taken by the fixer (already restored if it failed).
    pub backup_ids: Vec<String>,
}

#[async_trait]
pub trait Fixer: Send + Sync {
    fn source(&self) -> EventSource;

    /// Apply the strategy to this source's events from one batch.
    async fn fix(
        &self,
        events: &[SecurityEvent],
        strategy: &FixStrategy,
    ) -> Result<FixOutcome, FixerError>;
}
