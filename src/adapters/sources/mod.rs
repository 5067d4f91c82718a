//! Per-tool source adapters.
//!
//! Each adapter turns one tool's raw output into normalized
//! `SecurityEvent`s and keeps its own cursor so repeated polls
//! without new observations return nothing. Deduplication across
//! restarts stays with the watcher.

pub mod host_ips;
pub mod integrity;
pub mod net_threat;
pub mod scanner;

pub use host_ips::HostIpsAdapter;
pub use integrity::IntegrityAdapter;
pub use net_threat::NetThreatAdapter;
pub use scanner::ScannerAdapter;

use std::process::Output;
use tokio::process::Command;

use crate::domain::errors::WatcherError;

/// Run a tool command through the shell, capturing output.
pub(crate) async fn run_tool_command(source: &str, command: &str) -> Result<Output, WatcherError> {
    Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .output()
        .await
        .map_err(|e| WatcherError::PollFailed {
            source_name: source.to_string(),
            reason: e.to_string(),
        })
}
