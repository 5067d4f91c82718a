//! Persisted JSON state files.
//!
//! `seen_events.json`, `project_monitor_state.json`,
//! `git_push_state.json`, and the completed-batch archive live under
//! the configured state directory. Formats are line-compatible JSON so
//! upgrades need no migration.
//!
//! An unreadable file is quarantined (renamed with a timestamp
//! suffix) and replaced with fresh state; callers surface the
//! corruption as an error-severity notification.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

use crate::domain::errors::StateError;
use crate::domain::models::batch::RemediationBatch;
use crate::domain::models::plan::RemediationPlan;

/// Handle to the state directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

/// Outcome of loading a state file.
pub struct Loaded<T> {
    pub value: T,
    /// True when the previous file was corrupt and got quarantined.
    pub quarantined: bool,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StateError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StateError::Io {
            path: root.display().to_string(),
            reason: e.to_string(),
        })?;
        fs::create_dir_all(root.join("batches")).map_err(|e| StateError::Io {
            path: root.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { root })
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.root.join(file)
    }

    /// Load a JSON state file, quarantining it if unreadable.
    ///
    /// A missing file yields the default without a quarantine.
    pub fn load<T>(&self, file: &str) -> Loaded<T>
    where
        T: DeserializeOwned + Default,
    {
        let path = self.path(file);
        if !path.exists() {
            return Loaded {
                value: T::default(),
                quarantined: false,
            };
        }

        match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(value) => Loaded {
                    value,
                    quarantined: false,
                },
                Err(e) => {
                    error!(path = %path.display(), error = %e, "state file unparseable, quarantining");
                    self.quarantine(&path);
                    Loaded {
                        value: T::default(),
                        quarantined: true,
                    }
                }
            },
            Err(e) => {
                error!(path = %path.display(), error = %e, "state file unreadable, quarantining");
                self.quarantine(&path);
                Loaded {
                    value: T::default(),
                    quarantined: true,
                }
            }
        }
    }

    /// Persist a JSON state file atomically (temp file + rename).
    pub fn save<T>(&self, file: &str, value: &T) -> Result<(), StateError>
    where
        T: Serialize,
    {
        let path = self.path(file);
        let tmp = path.with_extension("tmp");
        let json = serde_json::to_string_pretty(value).map_err(|e| StateError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        fs::write(&tmp, json).map_err(|e| StateError::Io {
            path: tmp.display().to_string(),
            reason: e.to_string(),
        })?;
        fs::rename(&tmp, &path).map_err(|e| StateError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    fn quarantine(&self, path: &Path) {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let target = path.with_extension(format!("corrupt.{stamp}"));
        if let Err(e) = fs::rename(path, &target) {
            warn!(path = %path.display(), error = %e, "failed to quarantine state file");
        }
    }

    /// Archive a terminal batch and its plan for `replay`.
    pub fn archive_batch(
        &self,
        batch: &RemediationBatch,
        plan: Option<&RemediationPlan>,
    ) -> Result<(), StateError> {
        #[derive(Serialize)]
        struct Archived<'a> {
            batch: &'a RemediationBatch,
            plan: Option<&'a RemediationPlan>,
        }
        self.save(
            &format!("batches/batch_{}.json", batch.batch_id),
            &Archived { batch, plan },
        )
    }

    /// Load an archived batch by id.
    pub fn load_archived_batch(
        &self,
        batch_id: u64,
    ) -> Result<(RemediationBatch, Option<RemediationPlan>), StateError> {
        #[derive(serde::Deserialize)]
        struct Archived {
            batch: RemediationBatch,
            plan: Option<RemediationPlan>,
        }
        let file = format!("batches/batch_{batch_id}.json");
        let path = self.path(&file);
        let raw = fs::read_to_string(&path).map_err(|e| StateError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let archived: Archived = serde_json::from_str(&raw).map_err(|_| StateError::Corrupted {
            path: path.display().to_string(),
        })?;
        Ok((archived.batch, archived.plan))
    }
}
