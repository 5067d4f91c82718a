//! Shared helpers for integration tests.

use std::path::Path;

use vigil::domain::models::config::ProviderConfig;
use vigil::domain::models::Config;

/// A config rooted in a temp directory with fast timings.
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.state_dir = root.join("state").display().to_string();
    config.knowledge_base.path = root.join("knowledge.db").display().to_string();
    config.backup.root = root.join("backups").display().to_string();
    config.auto_remediation.collection_window_seconds = 1;
    config.auto_remediation.dry_run = true;
    config.notifier.auto_approve = true;
    config
}

/// Point the planner at a mock OpenAI-compatible endpoint.
pub fn with_mock_provider(config: &mut Config, endpoint: &str) {
    config.ai.providers = vec![ProviderConfig {
        kind: "local".to_string(),
        endpoint: endpoint.to_string(),
        api_key_env: String::new(),
        model: "test-model".to_string(),
        enabled: true,
    }];
    config.ai.request_spacing_ms = 1;
}

/// Chat-completions body wrapping a plan JSON the planner can parse.
pub fn chat_completion_body(plan_json: &str) -> String {
    serde_json::json!({
        "choices": [{"message": {"content": plan_json}}]
    })
    .to_string()
}

pub fn plan_json(confidence: f64) -> String {
    format!(
        r#"{{"description": "update openssl", "confidence": {confidence},
            "estimated_duration_minutes": 5, "requires_restart": false,
            "phases": [{{"name": "Phase 1: update openssl",
                         "description": "apply the fix",
                         "steps": ["update"], "estimated_minutes": 5}}],
            "rollback_plan": "restore backups"}}"#
    )
}
