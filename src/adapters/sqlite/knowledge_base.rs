//! Knowledge base: persistent record of fixes, vulnerabilities,
//! strategies, code changes, and log patterns.
//!
//! Single writer, multiple concurrent readers. Existing rows are never
//! mutated except the `strategies` accumulators. If the store cannot
//! be opened the knowledge base runs in read-only degraded mode:
//! writes are dropped with a warning and statistics queries return
//! defaults, so orchestration continues with default retry pacing.

use chrono::{Duration, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use super::connection::create_pool;
use super::migrations::Migrator;
use crate::domain::errors::KnowledgeBaseError;
use crate::domain::models::{AttemptResult, SecurityEvent};

/// Timestamp format matching SQLite's `datetime('now')`.
const SQLITE_TS: &str = "%Y-%m-%d %H:%M:%S";

/// Group-by-result counts over a window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SuccessRate {
    pub success: u64,
    pub failure: u64,
    pub partial: u64,
    pub total: u64,
    pub success_rate: f64,
}

/// One strategy row with derived success rate.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyStats {
    pub strategy_name: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_confidence: f64,
    pub avg_duration_seconds: f64,
    pub success_rate: f64,
}

/// Aggregated dashboard view.
#[derive(Debug, Clone, Serialize)]
pub struct LearningSummary {
    pub period_days: u32,
    pub total_fixes: u64,
    pub success_stats: SuccessRate,
    pub top_strategies: Vec<StrategyStats>,
    pub total_vulnerabilities: u64,
}

enum Backend {
    Live(SqlitePool),
    Degraded,
}

pub struct KnowledgeBase {
    backend: Backend,
}

impl KnowledgeBase {
    /// Open (or create) the store at `path`, running migrations.
    /// Any failure degrades to read-only mode with a warning.
    pub async fn open(path: &str) -> Self {
        match Self::try_open(path).await {
            Ok(kb) => kb,
            Err(e) => {
                warn!(error = %e, path, "knowledge base unavailable, running degraded");
                Self {
                    backend: Backend::Degraded,
                }
            }
        }
    }

    async fn try_open(path: &str) -> Result<Self, KnowledgeBaseError> {
        let pool = create_pool(path).await?;
        Migrator::new(pool.clone()).run().await?;
        info!(path, "knowledge base ready");
        Ok(Self {
            backend: Backend::Live(pool),
        })
    }

    /// Build a knowledge base over an existing pool (tests).
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, KnowledgeBaseError> {
        Migrator::new(pool.clone()).run().await?;
        Ok(Self {
            backend: Backend::Live(pool),
        })
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.backend, Backend::Degraded)
    }

    fn pool(&self) -> Option<&SqlitePool> {
        match &self.backend {
            Backend::Live(pool) => Some(pool),
            Backend::Degraded => None,
        }
    }

    /// Record one fix attempt and update the strategy accumulators in
    /// the same transaction. Returns the fix row id, or None when
    /// degraded.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_fix(
        &self,
        event: &SecurityEvent,
        strategy_description: &str,
        confidence: f64,
        result: AttemptResult,
        error_message: Option<&str>,
        duration_seconds: f64,
        retry_count: u32,
    ) -> Result<Option<i64>, KnowledgeBaseError> {
        let Some(pool) = self.pool() else {
            warn!("knowledge base degraded, dropping fix record");
            return Ok(None);
        };

        let now = Utc::now().format(SQLITE_TS).to_string();
        let metadata = serde_json::to_string(&event.details)
            .map_err(|e| KnowledgeBaseError::QueryFailed(e.to_string()))?;

        let mut tx = pool
            .begin()
            .await
            .map_err(|e| KnowledgeBaseError::QueryFailed(e.to_string()))?;

        let fix_id = sqlx::query(
            r"INSERT INTO fixes (
                timestamp, event_signature, event_source, event_type, severity,
                strategy_description, confidence, result, error_message,
                duration_seconds, retry_count, metadata
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&now)
        .bind(event.signature())
        .bind(event.source.as_str())
        .bind(&event.event_type)
        .bind(event.severity.as_str())
        .bind(strategy_description)
        .bind(confidence)
        .bind(result.as_str())
        .bind(error_message)
        .bind(duration_seconds)
        .bind(i64::from(retry_count))
        .bind(&metadata)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let (success_inc, failure_inc) = match result {
            AttemptResult::Success => (1_i64, 0_i64),
            AttemptResult::Failure | AttemptResult::Partial => (0, 1),
        };

        // Running mean over the pre-update total; `excluded` carries
        // this attempt's values.
        sqlx::query(
            r"INSERT INTO strategies (
                strategy_name, event_type, success_count, failure_count,
                avg_confidence, total_duration_seconds, last_used
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(strategy_name, event_type) DO UPDATE SET
                success_count = success_count + excluded.success_count,
                failure_count = failure_count + excluded.failure_count,
                avg_confidence = (avg_confidence * (success_count + failure_count)
                                  + excluded.avg_confidence)
                                 / (success_count + failure_count + 1),
                total_duration_seconds = total_duration_seconds
                                         + excluded.total_duration_seconds,
                last_used = excluded.last_used",
        )
        .bind(strategy_description)
        .bind(&event.event_type)
        .bind(success_inc)
        .bind(failure_inc)
        .bind(confidence)
        .bind(duration_seconds)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit()
            .await
            .map_err(|e| KnowledgeBaseError::QueryFailed(e.to_string()))?;

        Ok(Some(fix_id))
    }

    /// Record a discovered vulnerability, optionally linked to a fix.
    pub async fn record_vulnerability(
        &self,
        source: &str,
        cve_id: &str,
        severity: &str,
        package: &str,
        version: &str,
        fixed_version: Option<&str>,
        fix_id: Option<i64>,
    ) -> Result<Option<i64>, KnowledgeBaseError> {
        let Some(pool) = self.pool() else {
            warn!("knowledge base degraded, dropping vulnerability record");
            return Ok(None);
        };

        let id = sqlx::query(
            r"INSERT INTO vulnerabilities (
                timestamp, source, cve_id, severity, package, version,
                fixed_version, status, fix_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 'open', ?)",
        )
        .bind(Utc::now().format(SQLITE_TS).to_string())
        .bind(source)
        .bind(cve_id)
        .bind(severity)
        .bind(package)
        .bind(version)
        .bind(fixed_version)
        .bind(fix_id)
        .execute(pool)
        .await?
        .last_insert_rowid();

        Ok(Some(id))
    }

    /// Record a pushed commit for change tracking.
    pub async fn record_code_change(
        &self,
        project: &str,
        commit_hash: &str,
        message: &str,
        author: &str,
        files_changed: u32,
        category: &str,
    ) -> Result<Option<i64>, KnowledgeBaseError> {
        let Some(pool) = self.pool() else {
            return Ok(None);
        };

        let id = sqlx::query(
            r"INSERT INTO code_changes (
                timestamp, project, commit_hash, message, author,
                files_changed, category
            ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Utc::now().format(SQLITE_TS).to_string())
        .bind(project)
        .bind(commit_hash)
        .bind(message)
        .bind(author)
        .bind(i64::from(files_changed))
        .bind(category)
        .execute(pool)
        .await?
        .last_insert_rowid();

        Ok(Some(id))
    }

    /// Record a matched log pattern.
    pub async fn record_log_pattern(
        &self,
        tool_name: &str,
        pattern_type: &str,
        pattern_text: &str,
        severity: &str,
    ) -> Result<Option<i64>, KnowledgeBaseError> {
        let Some(pool) = self.pool() else {
            return Ok(None);
        };

        let id = sqlx::query(
            r"INSERT INTO log_patterns (
                timestamp, tool_name, pattern_type, pattern_text, count, severity
            ) VALUES (?, ?, ?, ?, 1, ?)",
        )
        .bind(Utc::now().format(SQLITE_TS).to_string())
        .bind(tool_name)
        .bind(pattern_type)
        .bind(pattern_text)
        .bind(severity)
        .execute(pool)
        .await?
        .last_insert_rowid();

        Ok(Some(id))
    }

    /// Group-by-result counts for fixes over the window, optionally
    /// filtered by signature and/or source. Degraded mode returns an
    /// empty default (which feeds the default retry multiplier).
    pub async fn get_success_rate(
        &self,
        event_signature: Option<&str>,
        event_source: Option<&str>,
        days: u32,
    ) -> Result<SuccessRate, KnowledgeBaseError> {
        let Some(pool) = self.pool() else {
            return Ok(SuccessRate::default());
        };

        let cutoff = (Utc::now() - Duration::days(i64::from(days)))
            .format(SQLITE_TS)
            .to_string();

        let mut query = String::from("SELECT result, COUNT(*) AS n FROM fixes WHERE timestamp >= ?");
        if event_signature.is_some() {
            query.push_str(" AND event_signature = ?");
        }
        if event_source.is_some() {
            query.push_str(" AND event_source = ?");
        }
        query.push_str(" GROUP BY result");

        let mut q = sqlx::query(&query).bind(&cutoff);
        if let Some(sig) = event_signature {
            q = q.bind(sig);
        }
        if let Some(src) = event_source {
            q = q.bind(src);
        }

        let rows = q.fetch_all(pool).await?;

        let mut stats = SuccessRate::default();
        for row in rows {
            let result: String = row.get("result");
            let count: i64 = row.get("n");
            let count = count.max(0) as u64;
            match result.as_str() {
                "success" => stats.success = count,
                "failure" => stats.failure = count,
                "partial" => stats.partial = count,
                _ => {}
            }
            stats.total += count;
        }
        if stats.total > 0 {
            stats.success_rate = stats.success as f64 / stats.total as f64;
        }

        Ok(stats)
    }

    /// Best performing strategies for an event type, filtered to
    /// strategies tried at least three times.
    pub async fn get_best_strategies(
        &self,
        event_type: &str,
        limit: u32,
    ) -> Result<Vec<StrategyStats>, KnowledgeBaseError> {
        let Some(pool) = self.pool() else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            r"SELECT
                strategy_name,
                success_count,
                failure_count,
                avg_confidence,
                total_duration_seconds,
                (CAST(success_count AS REAL) / (success_count + failure_count)) AS success_rate
            FROM strategies
            WHERE event_type = ? AND (success_count + failure_count) >= 3
            ORDER BY success_rate DESC, avg_confidence DESC
            LIMIT ?",
        )
        .bind(event_type)
        .bind(i64::from(limit))
        .fetch_all(pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let success: i64 = row.get("success_count");
                let failure: i64 = row.get("failure_count");
                let total = (success + failure).max(1);
                let total_duration: f64 = row.get("total_duration_seconds");
                StrategyStats {
                    strategy_name: row.get("strategy_name"),
                    success_count: success.max(0) as u64,
                    failure_count: failure.max(0) as u64,
                    avg_confidence: row.get("avg_confidence"),
                    avg_duration_seconds: total_duration / total as f64,
                    success_rate: row.get("success_rate"),
                }
            })
            .collect())
    }

    /// Aggregated view for dashboards and the status CLI.
    pub async fn learning_summary(&self, days: u32) -> Result<LearningSummary, KnowledgeBaseError> {
        let success_stats = self.get_success_rate(None, None, days).await?;

        let Some(pool) = self.pool() else {
            return Ok(LearningSummary {
                period_days: days,
                total_fixes: 0,
                success_stats,
                top_strategies: Vec::new(),
                total_vulnerabilities: 0,
            });
        };

        let cutoff = (Utc::now() - Duration::days(i64::from(days)))
            .format(SQLITE_TS)
            .to_string();

        let total_fixes: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM fixes WHERE timestamp >= ?")
                .bind(&cutoff)
                .fetch_one(pool)
                .await?;

        let total_vulns: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM vulnerabilities WHERE timestamp >= ?")
                .bind(&cutoff)
                .fetch_one(pool)
                .await?;

        let top = sqlx::query(
            r"SELECT strategy_name, success_count, failure_count, avg_confidence,
                     total_duration_seconds
              FROM strategies
              ORDER BY (success_count + failure_count) DESC
              LIMIT 5",
        )
        .fetch_all(pool)
        .await?;

        let top_strategies = top
            .into_iter()
            .map(|row| {
                let success: i64 = row.get("success_count");
                let failure: i64 = row.get("failure_count");
                let total = (success + failure).max(1);
                let total_duration: f64 = row.get("total_duration_seconds");
                StrategyStats {
                    strategy_name: row.get("strategy_name"),
                    success_count: success.max(0) as u64,
                    failure_count: failure.max(0) as u64,
                    avg_confidence: row.get("avg_confidence"),
                    avg_duration_seconds: total_duration / total as f64,
                    success_rate: success as f64 / total as f64,
                }
            })
            .collect();

        Ok(LearningSummary {
            period_days: days,
            total_fixes: total_fixes.0.max(0) as u64,
            success_stats,
            top_strategies,
            total_vulnerabilities: total_vulns.0.max(0) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::connection::create_test_pool;
    use crate::domain::models::{EventDetails, EventSource, Severity};

    async fn kb() -> KnowledgeBase {
        let pool = create_test_pool().await.unwrap();
        KnowledgeBase::with_pool(pool).await.unwrap()
    }

    fn vuln_event() -> SecurityEvent {
        SecurityEvent::new(
            EventSource::VulnerabilityScan,
            Severity::Critical,
            EventDetails::Vulnerability {
                cve_id: "CVE-2024-0001".into(),
                package: "openssl".into(),
                installed_version: "1.0.0".into(),
                fixed_version: Some("1.1.0".into()),
                image: None,
            },
        )
    }

    #[tokio::test]
    async fn test_record_fix_creates_strategy_row() {
        let kb = kb().await;
        let event = vuln_event();

        let fix_id = kb
            .record_fix(
                &event,
                "update openssl",
                0.92,
                AttemptResult::Success,
                None,
                4.2,
                0,
            )
            .await
            .unwrap();
        assert!(fix_id.is_some());

        let best = kb.get_best_strategies("vulnerability", 5).await.unwrap();
        // Below the >=3 usage filter.
        assert!(best.is_empty());

        let summary = kb.learning_summary(30).await.unwrap();
        assert_eq!(summary.total_fixes, 1);
        assert_eq!(summary.top_strategies.len(), 1);
        assert_eq!(summary.top_strategies[0].success_count, 1);
        assert_eq!(summary.top_strategies[0].failure_count, 0);
    }

    #[tokio::test]
    async fn test_strategy_counts_match_fixes() {
        let kb = kb().await;
        let event = vuln_event();

        for result in [
            AttemptResult::Success,
            AttemptResult::Failure,
            AttemptResult::Success,
            AttemptResult::Partial,
        ] {
            kb.record_fix(&event, "update openssl", 0.9, result, None, 1.0, 0)
                .await
                .unwrap();
        }

        let summary = kb.learning_summary(30).await.unwrap();
        let strategy = &summary.top_strategies[0];
        // success + failure == count of matching fixes (partial counts
        // as failure in the accumulator).
        assert_eq!(strategy.success_count + strategy.failure_count, 4);
        assert_eq!(summary.total_fixes, 4);
    }

    #[tokio::test]
    async fn test_success_rate_by_signature() {
        let kb = kb().await;
        let event = vuln_event();

        kb.record_fix(&event, "s", 0.9, AttemptResult::Success, None, 1.0, 0)
            .await
            .unwrap();
        kb.record_fix(&event, "s", 0.9, AttemptResult::Failure, Some("boom"), 1.0, 1)
            .await
            .unwrap();

        let rate = kb
            .get_success_rate(Some(&event.signature()), None, 30)
            .await
            .unwrap();
        assert_eq!(rate.total, 2);
        assert_eq!(rate.success, 1);
        assert_eq!(rate.failure, 1);
        assert!((rate.success_rate - 0.5).abs() < f64::EPSILON);

        let other = kb
            .get_success_rate(Some("scan:CVE-OTHER:x:1"), None, 30)
            .await
            .unwrap();
        assert_eq!(other.total, 0);
        assert!((other.success_rate - 0.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_best_strategies_filter_and_order() {
        let kb = kb().await;
        let event = vuln_event();

        // "good" strategy: 3 successes.
        for _ in 0..3 {
            kb.record_fix(&event, "good", 0.95, AttemptResult::Success, None, 1.0, 0)
                .await
                .unwrap();
        }
        // "bad" strategy: 1 success, 2 failures.
        kb.record_fix(&event, "bad", 0.7, AttemptResult::Success, None, 1.0, 0)
            .await
            .unwrap();
        for _ in 0..2 {
            kb.record_fix(&event, "bad", 0.7, AttemptResult::Failure, None, 1.0, 0)
                .await
                .unwrap();
        }
        // "rare" strategy: only used once, filtered out.
        kb.record_fix(&event, "rare", 0.99, AttemptResult::Success, None, 1.0, 0)
            .await
            .unwrap();

        let best = kb.get_best_strategies("vulnerability", 5).await.unwrap();
        assert_eq!(best.len(), 2);
        assert_eq!(best[0].strategy_name, "good");
        assert!((best[0].success_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(best[1].strategy_name, "bad");
    }

    #[tokio::test]
    async fn test_vulnerability_links_to_fix() {
        let kb = kb().await;
        let event = vuln_event();

        let fix_id = kb
            .record_fix(&event, "s", 0.9, AttemptResult::Success, None, 1.0, 0)
            .await
            .unwrap()
            .unwrap();

        let vuln_id = kb
            .record_vulnerability(
                "vulnerability_scan",
                "CVE-2024-0001",
                "CRITICAL",
                "openssl",
                "1.0.0",
                Some("1.1.0"),
                Some(fix_id),
            )
            .await
            .unwrap();
        assert!(vuln_id.is_some());

        let summary = kb.learning_summary(30).await.unwrap();
        assert_eq!(summary.total_vulnerabilities, 1);
    }

    #[tokio::test]
    async fn test_degraded_mode_drops_writes() {
        let kb = KnowledgeBase::open("/dev/null/nonexistent/kb.db").await;
        assert!(kb.is_degraded());

        let event = vuln_event();
        let fix = kb
            .record_fix(&event, "s", 0.9, AttemptResult::Success, None, 1.0, 0)
            .await
            .unwrap();
        assert!(fix.is_none());

        let rate = kb.get_success_rate(None, None, 30).await.unwrap();
        assert_eq!(rate, SuccessRate::default());
    }
}
