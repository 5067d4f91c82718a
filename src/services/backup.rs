//! Backup manager: verifiable snapshots before mutations.
//!
//! Four snapshot kinds, auto-detected from the source string:
//! plain files (optional gzip copy), directories (tar archive),
//! `docker:{image}` (backup retag), and `db:{name}` (pg_dump through
//! gzip). Every created backup is verified to exist with nonzero
//! size; oversized backups warn but do not fail.

use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::errors::BackupError;
use crate::domain::models::config::BackupConfig;
use crate::domain::models::{BackupInfo, BackupKind};
use crate::services::executor::{CommandExecutor, ExecuteOptions};

pub struct BackupManager {
    config: BackupConfig,
    executor: std::sync::Arc<CommandExecutor>,
    /// Append-only within a run; cleanup prunes by retention.
    registry: Mutex<HashMap<String, BackupInfo>>,
    /// Dry-run produces synthetic backups and restores.
    dry_run: bool,
}

impl BackupManager {
    pub fn new(
        config: BackupConfig,
        executor: std::sync::Arc<CommandExecutor>,
        dry_run: bool,
    ) -> Result<Self, BackupError> {
        std::fs::create_dir_all(&config.root).map_err(|e| BackupError::CreationFailed {
            source_name: config.root.clone(),
            reason: e.to_string(),
        })?;
        info!(root = %config.root, "backup manager ready");
        Ok(Self {
            config,
            executor,
            registry: Mutex::new(HashMap::new()),
            dry_run,
        })
    }

    /// Create a backup of `source`, auto-detecting the kind unless
    /// one is given.
    pub async fn create_backup(
        &self,
        source: &str,
        kind: Option<BackupKind>,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<BackupInfo, BackupError> {
        let kind = kind.unwrap_or_else(|| Self::detect_kind(source));
        let backup_id = self.generate_backup_id(source).await;

        debug!(%source, kind = %kind, %backup_id, "creating backup");

        if self.dry_run {
            let info = BackupInfo {
                backup_id: backup_id.clone(),
                kind,
                source: source.to_string(),
                backup_path: format!("[dry-run] {backup_id}"),
                timestamp: Utc::now(),
                size_bytes: 1,
                metadata: metadata.unwrap_or_default(),
            };
            self.registry
                .lock()
                .await
                .insert(backup_id, info.clone());
            return Ok(info);
        }

        let mut info = match kind {
            BackupKind::File => self.backup_file(source, &backup_id).await?,
            BackupKind::Directory => self.backup_directory(source, &backup_id).await?,
            BackupKind::Docker => self.backup_docker_image(source, &backup_id).await?,
            BackupKind::Database => self.backup_database(source, &backup_id).await?,
        };
        info.metadata = metadata.unwrap_or_default();

        self.verify(&info)?;

        let size_mb = info.size_bytes / (1024 * 1024);
        if size_mb > self.config.max_size_mb {
            warn!(
                backup_id = %info.backup_id,
                size_mb,
                cap_mb = self.config.max_size_mb,
                "backup exceeds size cap"
            );
        }

        info!(backup_id = %info.backup_id, size = info.size_bytes, "backup created");
        self.registry
            .lock()
            .await
            .insert(info.backup_id.clone(), info.clone());
        Ok(info)
    }

    /// Restore a backup by id. Returns true on success.
    pub async fn restore_backup(&self, backup_id: &str) -> Result<bool, BackupError> {
        let info = self
            .registry
            .lock()
            .await
            .get(backup_id)
            .cloned()
            .ok_or_else(|| BackupError::NotFound(backup_id.to_string()))?;

        info!(%backup_id, source = %info.source, "restoring backup");

        if self.dry_run {
            return Ok(true);
        }

        let restored = match info.kind {
            BackupKind::File => self.restore_file(&info).await,
            BackupKind::Directory => self.restore_directory(&info).await,
            BackupKind::Docker => self.restore_docker_image(&info).await,
            BackupKind::Database => self.restore_database(&info).await,
        };

        match restored {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(%backup_id, error = %e, "restore failed");
                Ok(false)
            }
        }
    }

    /// Best-effort batch backup: failed items are omitted from the map.
    pub async fn create_batch_backup(
        &self,
        sources: &[String],
    ) -> HashMap<String, BackupInfo> {
        let mut backups = HashMap::new();
        for source in sources {
            match self.create_backup(source, None, None).await {
                Ok(info) => {
                    backups.insert(source.clone(), info);
                }
                Err(e) => {
                    warn!(%source, error = %e, "batch backup item skipped");
                }
            }
        }
        info!(
            created = backups.len(),
            requested = sources.len(),
            "batch backup complete"
        );
        backups
    }

    /// Restore backups in reverse order. True iff every restore
    /// succeeded.
    pub async fn rollback_batch(&self, backup_ids: &[String]) -> bool {
        let mut all_ok = true;
        for backup_id in backup_ids.iter().rev() {
            match self.restore_backup(backup_id).await {
                Ok(true) => {}
                _ => {
                    warn!(%backup_id, "rollback restore failed");
                    all_ok = false;
                }
            }
        }
        all_ok
    }

    /// Remove backups older than the retention window. Returns how
    /// many were removed.
    pub async fn cleanup_old_backups(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.config.retention_days));
        let mut registry = self.registry.lock().await;
        let expired: Vec<String> = registry
            .values()
            .filter(|info| info.timestamp < cutoff)
            .map(|info| info.backup_id.clone())
            .collect();

        let mut removed = 0;
        for backup_id in expired {
            if let Some(info) = registry.get(&backup_id) {
                let path = Path::new(&info.backup_path);
                let gone = match info.kind {
                    // Docker backups are tags, not files.
                    BackupKind::Docker => true,
                    _ => std::fs::remove_file(path)
                        .or_else(|_| std::fs::remove_dir_all(path))
                        .is_ok(),
                };
                if gone {
                    registry.remove(&backup_id);
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(removed, "old backups cleaned up");
        }
        removed
    }

    pub async fn get_backup(&self, backup_id: &str) -> Option<BackupInfo> {
        self.registry.lock().await.get(backup_id).cloned()
    }

    fn detect_kind(source: &str) -> BackupKind {
        if source.starts_with("docker:") {
            BackupKind::Docker
        } else if source.starts_with("db:") {
            BackupKind::Database
        } else if Path::new(source).is_dir() {
            BackupKind::Directory
        } else {
            BackupKind::File
        }
    }

    async fn generate_backup_id(&self, source: &str) -> String {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let safe_name = Path::new(source)
            .file_name()
            .map_or_else(|| source.to_string(), |n| n.to_string_lossy().into_owned())
            .replace(['/', ' ', ':'], "_");
        let base = format!("backup_{safe_name}_{stamp}");

        // Same source twice in one second gets a suffix.
        let registry = self.registry.lock().await;
        if !registry.contains_key(&base) {
            return base;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{base}_{n}");
            if !registry.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    fn backup_root(&self) -> &Path {
        Path::new(&self.config.root)
    }

    async fn backup_file(&self, source: &str, backup_id: &str) -> Result<BackupInfo, BackupError> {
        if !Path::new(source).is_file() {
            return Err(BackupError::SourceNotFound(source.to_string()));
        }

        let backup_path = if self.config.compression {
            let path = self.backup_root().join(format!("{backup_id}.gz"));
            let result = self
                .executor
                .execute(
                    &format!("gzip -c '{source}' > '{}'", path.display()),
                    ExecuteOptions::new().with_timeout(Duration::from_secs(300)),
                )
                .await
                .map_err(|e| BackupError::CreationFailed {
                    source_name: source.to_string(),
                    reason: e.to_string(),
                })?;
            if !result.success {
                return Err(BackupError::CreationFailed {
                    source_name: source.to_string(),
                    reason: result.error_message.unwrap_or_default(),
                });
            }
            path
        } else {
            let path = self.backup_root().join(backup_id);
            std::fs::copy(source, &path).map_err(|e| BackupError::CreationFailed {
                source_name: source.to_string(),
                reason: e.to_string(),
            })?;
            path
        };

        Ok(self.info_for_path(BackupKind::File, source, backup_id, &backup_path))
    }

    async fn backup_directory(
        &self,
        source: &str,
        backup_id: &str,
    ) -> Result<BackupInfo, BackupError> {
        let src = Path::new(source);
        if !src.is_dir() {
            return Err(BackupError::SourceNotFound(source.to_string()));
        }

        let (flags, ext) = if self.config.compression {
            ("-czf", "tar.gz")
        } else {
            ("-cf", "tar")
        };
        let backup_path = self.backup_root().join(format!("{backup_id}.{ext}"));
        let parent = src.parent().unwrap_or_else(|| Path::new("/"));
        let base = src
            .file_name()
            .map_or_else(|| source.to_string(), |n| n.to_string_lossy().into_owned());

        let result = self
            .executor
            .execute(
                &format!(
                    "tar {flags} '{}' -C '{}' '{base}'",
                    backup_path.display(),
                    parent.display()
                ),
                ExecuteOptions::new().with_timeout(Duration::from_secs(600)),
            )
            .await
            .map_err(|e| BackupError::CreationFailed {
                source_name: source.to_string(),
                reason: e.to_string(),
            })?;
        if !result.success {
            return Err(BackupError::CreationFailed {
                source_name: source.to_string(),
                reason: result.error_message.unwrap_or_default(),
            });
        }

        Ok(self.info_for_path(BackupKind::Directory, source, backup_id, &backup_path))
    }

    async fn backup_docker_image(
        &self,
        source: &str,
        backup_id: &str,
    ) -> Result<BackupInfo, BackupError> {
        let image = source.trim_start_matches("docker:");
        let backup_tag = format!("{}_{backup_id}", image.replace(':', "_"));

        let result = self
            .executor
            .execute(
                &format!("docker tag {image} {backup_tag}"),
                ExecuteOptions::new().with_timeout(Duration::from_secs(60)),
            )
            .await
            .map_err(|e| BackupError::CreationFailed {
                source_name: source.to_string(),
                reason: e.to_string(),
            })?;
        if !result.success {
            return Err(BackupError::CreationFailed {
                source_name: source.to_string(),
                reason: result.error_message.unwrap_or_default(),
            });
        }

        let size = self
            .executor
            .execute(
                &format!("docker image inspect {backup_tag} --format='{{{{.Size}}}}'"),
                ExecuteOptions::new().with_timeout(Duration::from_secs(30)),
            )
            .await
            .ok()
            .filter(|r| r.success)
            .and_then(|r| r.stdout.trim().parse::<u64>().ok())
            .unwrap_or(1);

        Ok(BackupInfo {
            backup_id: backup_id.to_string(),
            kind: BackupKind::Docker,
            source: image.to_string(),
            backup_path: backup_tag,
            timestamp: Utc::now(),
            size_bytes: size,
            metadata: HashMap::new(),
        })
    }

    async fn backup_database(
        &self,
        source: &str,
        backup_id: &str,
    ) -> Result<BackupInfo, BackupError> {
        let db_name = source.trim_start_matches("db:");
        let backup_path = self.backup_root().join(format!("{backup_id}.sql.gz"));

        let result = self
            .executor
            .execute(
                &format!("pg_dump {db_name} | gzip > '{}'", backup_path.display()),
                ExecuteOptions::new().with_timeout(Duration::from_secs(600)),
            )
            .await
            .map_err(|e| BackupError::CreationFailed {
                source_name: source.to_string(),
                reason: e.to_string(),
            })?;
        if !result.success {
            return Err(BackupError::CreationFailed {
                source_name: source.to_string(),
                reason: result.error_message.unwrap_or_default(),
            });
        }

        let mut info = self.info_for_path(BackupKind::Database, db_name, backup_id, &backup_path);
        info.source = db_name.to_string();
        Ok(info)
    }

    fn info_for_path(
        &self,
        kind: BackupKind,
        source: &str,
        backup_id: &str,
        backup_path: &Path,
    ) -> BackupInfo {
        let size_bytes = std::fs::metadata(backup_path).map(|m| m.len()).unwrap_or(0);
        BackupInfo {
            backup_id: backup_id.to_string(),
            kind,
            source: source.to_string(),
            backup_path: backup_path.display().to_string(),
            timestamp: Utc::now(),
            size_bytes,
            metadata: HashMap::new(),
        }
    }

    fn verify(&self, info: &BackupInfo) -> Result<(), BackupError> {
        if info.kind != BackupKind::Docker && !Path::new(&info.backup_path).exists() {
            return Err(BackupError::VerificationFailed {
                backup_id: info.backup_id.clone(),
                reason: "backup path missing".into(),
            });
        }
        if info.size_bytes == 0 {
            return Err(BackupError::VerificationFailed {
                backup_id: info.backup_id.clone(),
                reason: "backup is empty".into(),
            });
        }
        Ok(())
    }

    async fn restore_file(&self, info: &BackupInfo) -> Result<(), BackupError> {
        if info.backup_path.ends_with(".gz") {
            let result = self
                .executor
                .execute(
                    &format!("gzip -dc '{}' > '{}'", info.backup_path, info.source),
                    ExecuteOptions::new().with_timeout(Duration::from_secs(300)),
                )
                .await
                .map_err(|e| self.restore_err(info, e.to_string()))?;
            if !result.success {
                return Err(self.restore_err(info, result.error_message.unwrap_or_default()));
            }
        } else {
            std::fs::copy(&info.backup_path, &info.source)
                .map_err(|e| self.restore_err(info, e.to_string()))?;
        }
        Ok(())
    }

    async fn restore_directory(&self, info: &BackupInfo) -> Result<(), BackupError> {
        let source = Path::new(&info.source);
        if source.exists() {
            std::fs::remove_dir_all(source).map_err(|e| self.restore_err(info, e.to_string()))?;
        }
        let parent: PathBuf = source
            .parent()
            .map_or_else(|| PathBuf::from("/"), Path::to_path_buf);

        let result = self
            .executor
            .execute(
                &format!("tar -xf '{}' -C '{}'", info.backup_path, parent.display()),
                ExecuteOptions::new().with_timeout(Duration::from_secs(600)),
            )
            .await
            .map_err(|e| self.restore_err(info, e.to_string()))?;
        if !result.success {
            return Err(self.restore_err(info, result.error_message.unwrap_or_default()));
        }
        Ok(())
    }

    async fn restore_docker_image(&self, info: &BackupInfo) -> Result<(), BackupError> {
        let result = self
            .executor
            .execute(
                &format!("docker tag {} {}", info.backup_path, info.source),
                ExecuteOptions::new().with_timeout(Duration::from_secs(60)),
            )
            .await
            .map_err(|e| self.restore_err(info, e.to_string()))?;
        if !result.success {
            return Err(self.restore_err(info, result.error_message.unwrap_or_default()));
        }
        Ok(())
    }

    async fn restore_database(&self, info: &BackupInfo) -> Result<(), BackupError> {
        let result = self
            .executor
            .execute(
                &format!("gzip -dc '{}' | psql {}", info.backup_path, info.source),
                ExecuteOptions::new().with_timeout(Duration::from_secs(600)),
            )
            .await
            .map_err(|e| self.restore_err(info, e.to_string()))?;
        if !result.success {
            return Err(self.restore_err(info, result.error_message.unwrap_or_default()));
        }
        Ok(())
    }

    fn restore_err(&self, info: &BackupInfo, reason: String) -> BackupError {
        BackupError::RestoreFailed {
            backup_id: info.backup_id.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::config::ExecutorConfig;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn manager(root: &Path, compression: bool) -> BackupManager {
        let executor = Arc::new(CommandExecutor::new(ExecutorConfig::default(), false));
        let config = BackupConfig {
            root: root.display().to_string(),
            retention_days: 7,
            compression,
            max_size_mb: 1000,
        };
        BackupManager::new(config, executor, false).unwrap()
    }

    #[tokio::test]
    async fn test_file_backup_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let backup_root = dir.path().join("backups");
        std::fs::create_dir_all(&backup_root).unwrap();

        let target = dir.path().join("config.yaml");
        std::fs::write(&target, "original: true\n").unwrap();

        let mgr = manager(&backup_root, false);
        let info = mgr
            .create_backup(&target.display().to_string(), None, None)
            .await
            .unwrap();
        assert_eq!(info.kind, BackupKind::File);
        assert!(info.size_bytes > 0);

        std::fs::write(&target, "mutated: true\n").unwrap();
        assert!(mgr.restore_backup(&info.backup_id).await.unwrap());
        assert_eq!(
            std::fs::read_to_string(&target).unwrap(),
            "original: true\n"
        );
    }

    #[tokio::test]
    async fn test_compressed_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let backup_root = dir.path().join("backups");
        std::fs::create_dir_all(&backup_root).unwrap();

        let target = dir.path().join("jail.local");
        std::fs::write(&target, "[sshd]\nmaxretry = 5\n").unwrap();

        let mgr = manager(&backup_root, true);
        let info = mgr
            .create_backup(&target.display().to_string(), None, None)
            .await
            .unwrap();
        assert!(info.backup_path.ends_with(".gz"));

        std::fs::write(&target, "[sshd]\nmaxretry = 2\n").unwrap();
        assert!(mgr.restore_backup(&info.backup_id).await.unwrap());
        assert_eq!(
            std::fs::read_to_string(&target).unwrap(),
            "[sshd]\nmaxretry = 5\n"
        );
    }

    #[tokio::test]
    async fn test_directory_backup_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let backup_root = dir.path().join("backups");
        std::fs::create_dir_all(&backup_root).unwrap();

        let target = dir.path().join("conf.d");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("a.conf"), "alpha").unwrap();
        std::fs::write(target.join("b.conf"), "beta").unwrap();

        let mgr = manager(&backup_root, true);
        let info = mgr
            .create_backup(&target.display().to_string(), None, None)
            .await
            .unwrap();
        assert_eq!(info.kind, BackupKind::Directory);

        std::fs::remove_file(target.join("a.conf")).unwrap();
        std::fs::write(target.join("b.conf"), "changed").unwrap();

        assert!(mgr.restore_backup(&info.backup_id).await.unwrap());
        assert_eq!(std::fs::read_to_string(target.join("a.conf")).unwrap(), "alpha");
        assert_eq!(std::fs::read_to_string(target.join("b.conf")).unwrap(), "beta");
    }

    #[tokio::test]
    async fn test_missing_source_fails() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(dir.path(), false);
        let err = mgr
            .create_backup("/nonexistent/file.txt", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::SourceNotFound(_)));
    }

    #[tokio::test]
    async fn test_batch_backup_is_best_effort() {
        let dir = TempDir::new().unwrap();
        let backup_root = dir.path().join("backups");
        std::fs::create_dir_all(&backup_root).unwrap();

        let good = dir.path().join("good.txt");
        std::fs::write(&good, "data").unwrap();

        let mgr = manager(&backup_root, false);
        let sources = vec![
            good.display().to_string(),
            "/nonexistent/bad.txt".to_string(),
        ];
        let backups = mgr.create_batch_backup(&sources).await;
        assert_eq!(backups.len(), 1);
        assert!(backups.contains_key(&good.display().to_string()));
    }

    #[tokio::test]
    async fn test_rollback_batch_reverse_order_and_result() {
        let dir = TempDir::new().unwrap();
        let backup_root = dir.path().join("backups");
        std::fs::create_dir_all(&backup_root).unwrap();

        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, "a1").unwrap();
        std::fs::write(&b, "b1").unwrap();

        let mgr = manager(&backup_root, false);
        let info_a = mgr
            .create_backup(&a.display().to_string(), None, None)
            .await
            .unwrap();
        let info_b = mgr
            .create_backup(&b.display().to_string(), None, None)
            .await
            .unwrap();

        std::fs::write(&a, "a2").unwrap();
        std::fs::write(&b, "b2").unwrap();

        let ids = vec![info_a.backup_id.clone(), info_b.backup_id.clone()];
        assert!(mgr.rollback_batch(&ids).await);
        assert_eq!(std::fs::read_to_string(&a).unwrap(), "a1");
        assert_eq!(std::fs::read_to_string(&b).unwrap(), "b1");

        // Unknown id makes the rollback report failure.
        let ids = vec![info_a.backup_id, "backup_missing_00000000".to_string()];
        assert!(!mgr.rollback_batch(&ids).await);
    }

    #[tokio::test]
    async fn test_detect_kind() {
        assert_eq!(
            BackupManager::detect_kind("docker:app:latest"),
            BackupKind::Docker
        );
        assert_eq!(BackupManager::detect_kind("db:maindb"), BackupKind::Database);
        assert_eq!(
            BackupManager::detect_kind("/no/such/file"),
            BackupKind::File
        );
    }

    #[tokio::test]
    async fn test_dry_run_backups_are_synthetic() {
        let dir = TempDir::new().unwrap();
        let executor = Arc::new(CommandExecutor::new(ExecutorConfig::default(), true));
        let config = BackupConfig {
            root: dir.path().display().to_string(),
            ..BackupConfig::default()
        };
        let mgr = BackupManager::new(config, executor, true).unwrap();

        let info = mgr
            .create_backup("/etc/never/read.conf", None, None)
            .await
            .unwrap();
        assert!(info.backup_path.starts_with("[dry-run]"));
        assert!(mgr.restore_backup(&info.backup_id).await.unwrap());
    }
}
