//! Knowledge base on disk: persistence and the strategy-accumulator
//! invariant.

use tempfile::TempDir;
use vigil::adapters::sqlite::KnowledgeBase;
use vigil::domain::models::{AttemptResult, EventDetails, EventSource, SecurityEvent, Severity};

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
async fn test_fixes_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("knowledge.db").display().to_string();

    {
        let kb = KnowledgeBase::open(&path).await;
        assert!(!kb.is_degraded());
        kb.record_fix(
            &vuln_event(),
            "update openssl",
            0.92,
            AttemptResult::Success,
            None,
            3.5,
            0,
        )
        .await
        .unwrap();
    }

    // Reopen: data persisted, migrations idempotent.
    let kb = KnowledgeBase::open(&path).await;
    let rate = kb.get_success_rate(None, None, 30).await.unwrap();
    assert_eq!(rate.success, 1);
    assert_eq!(rate.total, 1);
}

#[tokio::test]
async fn test_strategy_accumulator_matches_fix_rows() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("knowledge.db").display().to_string();
    let kb = KnowledgeBase::open(&path).await;
    let event = vuln_event();

    let outcomes = [
        AttemptResult::Success,
        AttemptResult::Failure,
        AttemptResult::Success,
        AttemptResult::Success,
        AttemptResult::Partial,
    ];
    for (i, result) in outcomes.iter().enumerate() {
        kb.record_fix(
            &event,
            "update openssl",
            0.9,
            *result,
            matches!(result, AttemptResult::Failure).then_some("verify failed"),
            1.0,
            i as u32,
        )
        .await
        .unwrap();
    }

    // strategies.success_count + failure_count == matching fixes.
    let summary = kb.learning_summary(30).await.unwrap();
    let strategy = summary
        .top_strategies
        .iter()
        .find(|s| s.strategy_name == "update openssl")
        .expect("strategy row exists");
    assert_eq!(
        strategy.success_count + strategy.failure_count,
        outcomes.len() as u64
    );
    assert_eq!(strategy.success_count, 3);
    assert_eq!(summary.total_fixes, outcomes.len() as u64);

    // With >= 3 uses the strategy is eligible for ranking.
    let best = kb.get_best_strategies("vulnerability", 5).await.unwrap();
    assert_eq!(best.len(), 1);
    assert!((best[0].success_rate - 0.6).abs() < 1e-9);
}

#[tokio::test]
async fn test_signature_scoped_success_rate() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("knowledge.db").display().to_string();
    let kb = KnowledgeBase::open(&path).await;

    let scan_event = vuln_event();
    let ban_event = SecurityEvent::new(
        EventSource::HostIps,
        Severity::Medium,
        EventDetails::HostBan {
            ip: "198.51.100.9".into(),
            jail: "sshd".into(),
        },
    );

    kb.record_fix(&scan_event, "update", 0.9, AttemptResult::Success, None, 1.0, 0)
        .await
        .unwrap();
    kb.record_fix(&ban_event, "harden", 0.8, AttemptResult::Failure, Some("x"), 1.0, 0)
        .await
        .unwrap();

    let scan_rate = kb
        .get_success_rate(Some(&scan_event.signature()), None, 30)
        .await
        .unwrap();
    assert_eq!(scan_rate.total, 1);
    assert!((scan_rate.success_rate - 1.0).abs() < f64::EPSILON);

    let source_rate = kb
        .get_success_rate(None, Some("host_ips"), 30)
        .await
        .unwrap();
    assert_eq!(source_rate.total, 1);
    assert_eq!(source_rate.failure, 1);
}
