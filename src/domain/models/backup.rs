//! Backup metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// What kind of snapshot a backup is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    File,
    Directory,
    Docker,
    Database,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
            Self::Docker => "docker",
            Self::Database => "database",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A verifiable snapshot taken before a mutation.
///
/// Invariant: nonzero size and an existing backup path (verified after
/// creation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupInfo {
    pub backup_id: String,
    pub kind: BackupKind,
    /// Original path / image reference / database name.
    pub source: String,
    /// Backup file path, or the backup image tag for docker backups.
    pub backup_path: String,
    pub timestamp: DateTime<Utc>,
    pub size_bytes: u64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}
