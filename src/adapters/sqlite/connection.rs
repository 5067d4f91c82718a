//! SQLite connection pool management.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::errors::KnowledgeBaseError;

pub async fn create_pool(database_path: &str) -> Result<SqlitePool, KnowledgeBaseError> {
    ensure_database_directory(database_path)?;

    let url = format!("sqlite:{database_path}");
    let connect_options = SqliteConnectOptions::from_str(&url)
        .map_err(|e| KnowledgeBaseError::OpenFailed(e.to_string()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        // Single writer, multiple readers: writes serialize at the
        // database level, reads stay unblocked under WAL.
        .max_connections(5)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(3))
        .connect_with(connect_options)
        .await
        .map_err(|e| KnowledgeBaseError::OpenFailed(e.to_string()))?;

    Ok(pool)
}

pub async fn create_test_pool() -> Result<SqlitePool, KnowledgeBaseError> {
    let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(|e| KnowledgeBaseError::OpenFailed(e.to_string()))?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .shared_cache(true);

    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(connect_options)
        .await
        .map_err(|e| KnowledgeBaseError::OpenFailed(e.to_string()))
}

fn ensure_database_directory(database_path: &str) -> Result<(), KnowledgeBaseError> {
    if database_path == ":memory:" || database_path.is_empty() {
        return Ok(());
    }
    let path = Path::new(database_path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .map_err(|e| KnowledgeBaseError::OpenFailed(e.to_string()))?;
        }
    }
    Ok(())
}

pub async fn verify_connection(pool: &SqlitePool) -> Result<(), KnowledgeBaseError> {
    sqlx::query("SELECT 1")
        .fetch_one(pool)
        .await
        .map_err(|e| KnowledgeBaseError::OpenFailed(e.to_string()))?;
    Ok(())
}
