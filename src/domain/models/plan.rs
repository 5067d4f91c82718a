//! Remediation plans: structured planner output for one batch.

use serde::{Deserialize, Serialize};

/// One ordered segment of a plan. Phases run strictly in sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanPhase {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default = "default_phase_minutes")]
    pub estimated_minutes: u32,
}

fn default_phase_minutes() -> u32 {
    5
}

/// A coordinated remediation proposal. Never mutated after acceptance;
/// retries re-plan and produce a new plan object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationPlan {
    pub description: String,
    pub confidence: f64,
    #[serde(default)]
    pub phases: Vec<PlanPhase>,
    #[serde(default = "default_duration_minutes")]
    pub estimated_duration_minutes: u32,
    #[serde(default)]
    pub requires_restart: bool,
    #[serde(default)]
    pub rollback_plan: String,
    /// Which backend produced the plan (set by the planner, not the model).
    #[serde(default)]
    pub model: String,
}

fn default_duration_minutes() -> u32 {
    30
}

impl RemediationPlan {
    pub fn total_estimated_minutes(&self) -> u32 {
        let phase_sum: u32 = self.phases.iter().map(|p| p.estimated_minutes).sum();
        if phase_sum > 0 {
            phase_sum
        } else {
            self.estimated_duration_minutes
        }
    }

    /// A short outline for approval requests and notifications.
    pub fn outline(&self) -> String {
        let mut lines = vec![format!(
            "{} (confidence {:.0}%, ~{}min{})",
            self.description,
            self.confidence * 100.0,
            self.total_estimated_minutes(),
            if self.requires_restart {
                ", restart required"
            } else {
                ""
            }
        )];
        for (i, phase) in self.phases.iter().enumerate() {
            lines.push(format!("{}. {}: {}", i + 1, phase.name, phase.description));
        }
        lines.join("\n")
    }
}

/// A narrower single-event strategy used by the fixers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixStrategy {
    pub description: String,
    pub confidence: f64,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<String>,
}

impl FixStrategy {
    pub fn new(description: impl Into<String>, confidence: f64) -> Self {
        Self {
            description: description.into(),
            confidence,
            steps: Vec::new(),
            analysis: None,
        }
    }

    /// Derive a per-event strategy from a coordinated plan.
    pub fn from_plan(plan: &RemediationPlan) -> Self {
        Self {
            description: plan.description.clone(),
            confidence: plan.confidence,
            steps: plan
                .phases
                .iter()
                .flat_map(|p| p.steps.iter().cloned())
                .collect(),
            analysis: None,
        }
    }
}
