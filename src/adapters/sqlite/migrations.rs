//! Embedded schema migrations for the knowledge base.

use sqlx::SqlitePool;

use crate::domain::errors::KnowledgeBaseError;

#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All five relations plus indexes, created on first open.
pub fn embedded_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "fixes table",
            sql: r"
                CREATE TABLE IF NOT EXISTS fixes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp TEXT NOT NULL DEFAULT (datetime('now')),
                    event_signature TEXT NOT NULL,
                    event_source TEXT NOT NULL,
                    event_type TEXT,
                    severity TEXT,
                    strategy_description TEXT,
                    confidence REAL,
                    result TEXT CHECK(result IN ('success', 'failure', 'partial')),
                    error_message TEXT,
                    duration_seconds REAL,
                    retry_count INTEGER DEFAULT 0,
                    metadata TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_fixes_signature ON fixes(event_signature);
                CREATE INDEX IF NOT EXISTS idx_fixes_source ON fixes(event_source);
                CREATE INDEX IF NOT EXISTS idx_fixes_result ON fixes(result);
            ",
        },
        Migration {
            version: 2,
            description: "vulnerabilities table",
            sql: r"
                CREATE TABLE IF NOT EXISTS vulnerabilities (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp TEXT NOT NULL DEFAULT (datetime('now')),
                    source TEXT NOT NULL,
                    cve_id TEXT,
                    severity TEXT,
                    package TEXT,
                    version TEXT,
                    fixed_version TEXT,
                    status TEXT CHECK(status IN ('open', 'fixed', 'wontfix', 'investigating')),
                    fix_id INTEGER,
                    metadata TEXT,
                    FOREIGN KEY (fix_id) REFERENCES fixes(id)
                );
                CREATE INDEX IF NOT EXISTS idx_vulnerabilities_cve ON vulnerabilities(cve_id);
            ",
        },
        Migration {
            version: 3,
            description: "strategies table",
            sql: r"
                CREATE TABLE IF NOT EXISTS strategies (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    strategy_name TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    success_count INTEGER DEFAULT 0,
                    failure_count INTEGER DEFAULT 0,
                    avg_confidence REAL,
                    total_duration_seconds REAL DEFAULT 0,
                    last_used TEXT,
                    metadata TEXT,
                    UNIQUE(strategy_name, event_type)
                );
                CREATE INDEX IF NOT EXISTS idx_strategies_type ON strategies(event_type);
            ",
        },
        Migration {
            version: 4,
            description: "code_changes table",
            sql: r"
                CREATE TABLE IF NOT EXISTS code_changes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp TEXT NOT NULL DEFAULT (datetime('now')),
                    project TEXT NOT NULL,
                    commit_hash TEXT,
                    message TEXT,
                    author TEXT,
                    files_changed INTEGER,
                    category TEXT,
                    metadata TEXT
                );
            ",
        },
        Migration {
            version: 5,
            description: "log_patterns table",
            sql: r"
                CREATE TABLE IF NOT EXISTS log_patterns (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp TEXT NOT NULL DEFAULT (datetime('now')),
                    tool_name TEXT NOT NULL,
                    pattern_type TEXT,
                    pattern_text TEXT,
                    count INTEGER DEFAULT 1,
                    severity TEXT,
                    metadata TEXT
                );
            ",
        },
    ]
}

pub struct Migrator {
    pool: SqlitePool,
}

impl Migrator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Apply pending embedded migrations. Returns how many ran.
    pub async fn run(&self) -> Result<usize, KnowledgeBaseError> {
        self.ensure_migrations_table().await?;
        let current = self.current_version().await?;

        let pending: Vec<Migration> = embedded_migrations()
            .into_iter()
            .filter(|m| m.version > current)
            .collect();

        for migration in &pending {
            self.apply(migration).await?;
        }

        Ok(pending.len())
    }

    async fn ensure_migrations_table(&self) -> Result<(), KnowledgeBaseError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now')),
                description TEXT
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| KnowledgeBaseError::MigrationFailed(e.to_string()))?;
        Ok(())
    }

    async fn current_version(&self) -> Result<i64, KnowledgeBaseError> {
        let row: (Option<i64>,) =
            sqlx::query_as("SELECT MAX(version) FROM schema_migrations")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| KnowledgeBaseError::MigrationFailed(e.to_string()))?;
        Ok(row.0.unwrap_or(0))
    }

    async fn apply(&self, migration: &Migration) -> Result<(), KnowledgeBaseError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| KnowledgeBaseError::MigrationFailed(e.to_string()))?;

        // SQLite executes one statement per call; split on ';'.
        for statement in migration.sql.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    KnowledgeBaseError::MigrationFailed(format!(
                        "migration {} failed: {e}",
                        migration.version
                    ))
                })?;
        }

        sqlx::query("INSERT INTO schema_migrations (version, description) VALUES (?, ?)")
            .bind(migration.version)
            .bind(migration.description)
            .execute(&mut *tx)
            .await
            .map_err(|e| KnowledgeBaseError::MigrationFailed(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| KnowledgeBaseError::MigrationFailed(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::connection::create_test_pool;

    #[tokio::test]
    async fn test_migrations_apply_once() {
        let pool = create_test_pool().await.unwrap();
        let migrator = Migrator::new(pool.clone());

        let applied = migrator.run().await.unwrap();
        assert_eq!(applied, embedded_migrations().len());

        // Second run is a no-op.
        let applied = migrator.run().await.unwrap();
        assert_eq!(applied, 0);
    }

    #[tokio::test]
    async fn test_all_tables_exist_after_migration() {
        let pool = create_test_pool().await.unwrap();
        Migrator::new(pool.clone()).run().await.unwrap();

        for table in [
            "fixes",
            "vulnerabilities",
            "strategies",
            "code_changes",
            "log_patterns",
        ] {
            let row: (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            )
            .bind(table)
            .fetch_one(&pool)
            .await
            .unwrap();
            assert_eq!(row.0, 1, "missing table {table}");
        }
    }
}
