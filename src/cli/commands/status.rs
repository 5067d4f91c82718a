//! `vigil status` - print persisted pipeline state and the
//! knowledge-base summary.

use serde_json::json;
use std::collections::HashMap;

use crate::adapters::sqlite::KnowledgeBase;
use crate::domain::models::Config;
use crate::infrastructure::state::StateStore;
use crate::services::health_monitor::MonitorState;

pub async fn handle_status(config: Config, json_output: bool) -> anyhow::Result<()> {
    let state = StateStore::new(&config.state_dir)?;
    let kb = KnowledgeBase::open(&config.knowledge_base.path).await;

    let summary = kb.learning_summary(30).await?;
    let seen = state.load::<HashMap<String, u64>>("seen_events.json").value;
    let monitor = state.load::<MonitorState>("project_monitor_state.json").value;
    let pending = state
        .load::<Vec<crate::domain::models::RemediationBatch>>("pending_batches.json")
        .value;

    if json_output {
        let payload = json!({
            "knowledge_base": {
                "degraded": kb.is_degraded(),
                "period_days": summary.period_days,
                "total_fixes": summary.total_fixes,
                "success_rate": summary.success_stats.success_rate,
                "total_vulnerabilities": summary.total_vulnerabilities,
                "top_strategies": summary.top_strategies,
            },
            "seen_signatures": seen.len(),
            "pending_batches": pending.len(),
            "monitored_projects": monitor.projects,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    println!("vigil status");
    println!(
        "  knowledge base: {} ({} fixes in {}d, success rate {:.0}%)",
        if kb.is_degraded() { "DEGRADED" } else { "ok" },
        summary.total_fixes,
        summary.period_days,
        summary.success_stats.success_rate * 100.0
    );
    println!("  known vulnerabilities: {}", summary.total_vulnerabilities);
    println!("  seen event signatures: {}", seen.len());
    println!("  pending batches: {}", pending.len());
    for strategy in &summary.top_strategies {
        println!(
            "  strategy '{}': {}/{} ok (avg confidence {:.2})",
            strategy.strategy_name,
            strategy.success_count,
            strategy.success_count + strategy.failure_count,
            strategy.avg_confidence
        );
    }
    for (name, counters) in &monitor.projects {
        let uptime = if counters.total_checks > 0 {
            counters.successful_checks as f64 / counters.total_checks as f64 * 100.0
        } else {
            0.0
        };
        println!(
            "  project {name}: {}/{} checks ok ({uptime:.1}%)",
            counters.successful_checks, counters.total_checks
        );
    }
    Ok(())
}
