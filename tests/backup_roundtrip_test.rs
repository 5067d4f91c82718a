//! Backup round-trip property: after rollback, sources hash the same
//! as before the backup.

use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use vigil::domain::models::config::{BackupConfig, ExecutorConfig};
use vigil::services::backup::BackupManager;
use vigil::services::executor::CommandExecutor;

fn hash_file(path: &Path) -> Vec<u8> {
    let bytes = std::fs::read(path).unwrap();
    Sha256::digest(&bytes).to_vec()
}

fn manager(root: &Path, compression: bool) -> BackupManager {
    let executor = Arc::new(CommandExecutor::new(ExecutorConfig::default(), false));
    BackupManager::new(
        BackupConfig {
            root: root.display().to_string(),
            retention_days: 7,
            compression,
            max_size_mb: 1000,
        },
        executor,
        false,
    )
    .unwrap()
}

#[tokio::test]
async fn test_rollback_batch_restores_original_hashes() {
    let dir = TempDir::new().unwrap();
    let backup_root = dir.path().join("backups");
    std::fs::create_dir_all(&backup_root).unwrap();

    let config_file = dir.path().join("jail.local");
    let rules_file = dir.path().join("user.rules");
    std::fs::write(&config_file, "[sshd]\nmaxretry = 5\nbantime = 600\n").unwrap();
    std::fs::write(&rules_file, "-A ufw-user-input -s 192.0.2.1 -j DROP\n").unwrap();

    let hash_config = hash_file(&config_file);
    let hash_rules = hash_file(&rules_file);

    let mgr = manager(&backup_root, true);
    let sources = vec![
        config_file.display().to_string(),
        rules_file.display().to_string(),
    ];
    let backups = mgr.create_batch_backup(&sources).await;
    assert_eq!(backups.len(), 2);

    // Mutate both files the way a botched fix would.
    std::fs::write(&config_file, "[sshd]\nmaxretry = 1\nbantime = -1\n").unwrap();
    std::fs::write(&rules_file, "ruined\n").unwrap();
    assert_ne!(hash_file(&config_file), hash_config);

    let ids: Vec<String> = sources
        .iter()
        .map(|source| backups[source].backup_id.clone())
        .collect();
    assert!(mgr.rollback_batch(&ids).await);

    // Byte-identical restores.
    assert_eq!(hash_file(&config_file), hash_config);
    assert_eq!(hash_file(&rules_file), hash_rules);
}

#[tokio::test]
async fn test_directory_roundtrip_preserves_tree_content() {
    let dir = TempDir::new().unwrap();
    let backup_root = dir.path().join("backups");
    std::fs::create_dir_all(&backup_root).unwrap();

    let tree = dir.path().join("conf.d");
    std::fs::create_dir_all(tree.join("nested")).unwrap();
    std::fs::write(tree.join("a.conf"), "alpha").unwrap();
    std::fs::write(tree.join("nested/b.conf"), "beta").unwrap();

    let mgr = manager(&backup_root, true);
    let info = mgr
        .create_backup(&tree.display().to_string(), None, None)
        .await
        .unwrap();

    std::fs::remove_dir_all(&tree).unwrap();
    assert!(mgr.restore_backup(&info.backup_id).await.unwrap());

    assert_eq!(std::fs::read_to_string(tree.join("a.conf")).unwrap(), "alpha");
    assert_eq!(
        std::fs::read_to_string(tree.join("nested/b.conf")).unwrap(),
        "beta"
    );
}

#[tokio::test]
async fn test_backup_then_immediate_restore_is_identity() {
    let dir = TempDir::new().unwrap();
    let backup_root = dir.path().join("backups");
    std::fs::create_dir_all(&backup_root).unwrap();

    let file = dir.path().join("config.yaml");
    std::fs::write(&file, "key: value\n").unwrap();
    let before = hash_file(&file);

    let mgr = manager(&backup_root, false);
    let info = mgr
        .create_backup(&file.display().to_string(), None, None)
        .await
        .unwrap();
    assert!(mgr.restore_backup(&info.backup_id).await.unwrap());

    assert_eq!(hash_file(&file), before);
}
