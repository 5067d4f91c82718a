//! Impact analyzer: maps events, strategies, and affected paths to a
//! structured assessment with an approval gate.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::domain::models::config::{ApprovalMode, Config, ProjectConfig};
use crate::domain::models::{EventSource, ImpactAssessment, ImpactSeverity, ProjectState};
use crate::domain::models::plan::FixStrategy;
use crate::services::executor::{CommandExecutor, ExecuteOptions};

pub struct ImpactAnalyzer {
    projects: BTreeMap<String, ProjectConfig>,
    protected_paths: Vec<String>,
    approval_mode: ApprovalMode,
    confidence_threshold: f64,
    executor: Option<Arc<CommandExecutor>>,
}

impl ImpactAnalyzer {
    pub fn new(config: &Config, executor: Option<Arc<CommandExecutor>>) -> Self {
        info!(projects = config.projects.len(), "impact analyzer ready");
        Self {
            projects: config.projects.clone(),
            protected_paths: config.protected_paths.clone(),
            approval_mode: config.auto_remediation.approval_mode,
            confidence_threshold: config.auto_remediation.confidence_threshold,
            executor,
        }
    }

    /// Analyze the impact of one fix.
    pub async fn analyze(
        &self,
        event_source: EventSource,
        event_type: &str,
        affected_paths: Option<&[String]>,
        fix_strategy: Option<&FixStrategy>,
    ) -> ImpactAssessment {
        debug!(source = %event_source, event_type, "analyzing impact");

        let states = self.probe_project_states().await;
        let affected = self.determine_affected_projects(event_source, affected_paths, fix_strategy);
        let severity = self.assess_severity(event_source, &affected, affected_paths, fix_strategy);
        let downtime = self.estimate_downtime(&affected, severity, fix_strategy);
        let risks = self.identify_risks(&affected, &states, affected_paths, fix_strategy);
        let mitigation = Self::generate_mitigation(&affected, &risks, &states);
        let service_order = self.determine_service_order(&affected);
        let (requires_approval, approval_reason) =
            self.check_approval(event_source, severity, &affected, affected_paths, fix_strategy);

        info!(
            projects = affected.len(),
            severity = %severity,
            downtime,
            requires_approval,
            "impact analysis complete"
        );

        ImpactAssessment {
            affected_projects: affected,
            impact_severity: severity,
            downtime_estimate_seconds: downtime,
            risks,
            mitigation_steps: mitigation,
            service_order,
            requires_approval,
            approval_reason,
        }
    }

    /// Probe whether each project's processes are running.
    async fn probe_project_states(&self) -> BTreeMap<String, ProjectState> {
        let mut states = BTreeMap::new();
        let Some(executor) = &self.executor else {
            for name in self.projects.keys() {
                states.insert(name.clone(), ProjectState::Unknown);
            }
            return states;
        };

        for name in self.projects.keys() {
            let state = match executor
                .execute(
                    &format!("pgrep -f '{name}' > /dev/null 2>&1"),
                    ExecuteOptions::new().with_timeout(Duration::from_secs(5)),
                )
                .await
            {
                Ok(result) if result.success => ProjectState::Running,
                Ok(_) => ProjectState::Stopped,
                Err(_) => ProjectState::Unknown,
            };
            states.insert(name.clone(), state);
        }
        states
    }

    fn determine_affected_projects(
        &self,
        event_source: EventSource,
        affected_paths: Option<&[String]>,
        fix_strategy: Option<&FixStrategy>,
    ) -> Vec<String> {
        let mut affected: Vec<String> = Vec::new();
        let add = |name: &str, affected: &mut Vec<String>| {
            if !affected.iter().any(|n| n == name) {
                affected.push(name.to_string());
            }
        };

        // Source-specific defaults: container scans touch everything
        // containerized; everything else at least touches the
        // controller's own host projects via path/name matches below.
        if event_source == EventSource::VulnerabilityScan {
            for name in self.projects.keys() {
                add(name, &mut affected);
            }
        }

        // Path prefix matches on project roots and critical paths.
        if let Some(paths) = affected_paths {
            for path in paths {
                for (name, project) in &self.projects {
                    if !project.path.is_empty() && path.starts_with(&project.path) {
                        add(name, &mut affected);
                    }
                    if project.critical_paths.iter().any(|cp| path.starts_with(cp)) {
                        add(name, &mut affected);
                    }
                }
            }
        }

        // Textual project-name mentions in the strategy.
        if let Some(strategy) = fix_strategy {
            let text = strategy.description.to_lowercase();
            for name in self.projects.keys() {
                if text.contains(&name.to_lowercase()) {
                    add(name, &mut affected);
                }
            }
        }

        affected.sort_by_key(|name| {
            self.projects
                .get(name)
                .map_or(u8::MAX, |project| project.priority)
        });
        affected
    }

    fn assess_severity(
        &self,
        event_source: EventSource,
        affected: &[String],
        affected_paths: Option<&[String]>,
        fix_strategy: Option<&FixStrategy>,
    ) -> ImpactSeverity {
        if let Some(paths) = affected_paths {
            if paths.iter().any(|path| self.is_protected(path)) {
                return ImpactSeverity::Critical;
            }
        }

        let production_hit = affected.iter().any(|name| {
            self.projects
                .get(name)
                .is_some_and(|project| project.production)
        });
        if production_hit || event_source == EventSource::FileIntegrity {
            return ImpactSeverity::Significant;
        }

        if event_source == EventSource::VulnerabilityScan {
            return ImpactSeverity::Moderate;
        }

        if let Some(strategy) = fix_strategy {
            let text = strategy.description.to_lowercase();
            if ["restart", "reload", "stop", "update", "upgrade", "rebuild"]
                .iter()
                .any(|word| text.contains(word))
            {
                return ImpactSeverity::Moderate;
            }
        }

        ImpactSeverity::Minimal
    }

    fn estimate_downtime(
        &self,
        affected: &[String],
        severity: ImpactSeverity,
        fix_strategy: Option<&FixStrategy>,
    ) -> u32 {
        let mut downtime = severity.base_downtime_seconds();
        downtime += affected.len() as u32 * 10;

        if let Some(strategy) = fix_strategy {
            let text = strategy.description.to_lowercase();
            if text.contains("rebuild") || text.contains("compile") {
                downtime += 120;
            }
            if text.contains("database") {
                downtime += 60;
            }
            downtime += text.matches("restart").count() as u32 * 15;
        }

        downtime
    }

    fn identify_risks(
        &self,
        affected: &[String],
        states: &BTreeMap<String, ProjectState>,
        affected_paths: Option<&[String]>,
        fix_strategy: Option<&FixStrategy>,
    ) -> Vec<String> {
        let mut risks = Vec::new();

        if let Some(paths) = affected_paths {
            for path in paths {
                if self.is_protected(path) {
                    risks.push(format!("modifying protected system path: {path}"));
                }
            }
        }

        for name in affected {
            if states.get(name) == Some(&ProjectState::Running) {
                risks.push(format!("{name} is currently running, may need restart"));
            }
            if self
                .projects
                .get(name)
                .is_some_and(|project| project.production)
            {
                risks.push(format!("{name} is production, customer impact possible"));
            }
            if let (Some(paths), Some(project)) = (affected_paths, self.projects.get(name)) {
                for path in paths {
                    if project.critical_paths.iter().any(|cp| path.starts_with(cp)) {
                        risks.push(format!("modifying critical path for {name}: {path}"));
                    }
                }
            }
        }

        if let Some(strategy) = fix_strategy {
            let text = strategy.description.to_lowercase();
            if text.contains("database") || text.contains("schema") {
                risks.push("database modifications carry data loss risk".into());
            }
            if strategy.confidence < self.confidence_threshold {
                risks.push(format!(
                    "low plan confidence ({:.0}%)",
                    strategy.confidence * 100.0
                ));
            }
        }

        risks
    }

    fn generate_mitigation(
        affected: &[String],
        risks: &[String],
        states: &BTreeMap<String, ProjectState>,
    ) -> Vec<String> {
        let mut steps = vec!["create comprehensive backup before changes".to_string()];

        for name in affected {
            if states.get(name) == Some(&ProjectState::Running) {
                steps.push(format!("gracefully stop {name}"));
            }
        }
        if risks.iter().any(|risk| risk.contains("database")) {
            steps.push("create database dump before modification".into());
        }
        if risks.iter().any(|risk| risk.contains("production")) {
            steps.push("notify customers of maintenance window".into());
        }

        steps.push("verify fix success before proceeding".into());
        steps.push("restart affected services in correct order".into());
        steps.push("run health checks after restart".into());
        steps
    }

    /// Stop order: lowest priority first; each project's dependencies
    /// precede it. Start order is the reverse.
    fn determine_service_order(&self, affected: &[String]) -> Vec<String> {
        let mut sorted: Vec<&String> = affected.iter().collect();
        sorted.sort_by_key(|name| {
            std::cmp::Reverse(self.projects.get(*name).map_or(0, |project| project.priority))
        });

        let mut order: Vec<String> = Vec::new();
        for name in sorted {
            if let Some(project) = self.projects.get(name) {
                for dep in &project.dependencies {
                    if !order.contains(dep) {
                        order.push(dep.clone());
                    }
                }
            }
            if !order.contains(name) {
                order.push(name.clone());
            }
        }
        order
    }

    fn check_approval(
        &self,
        event_source: EventSource,
        severity: ImpactSeverity,
        affected: &[String],
        affected_paths: Option<&[String]>,
        fix_strategy: Option<&FixStrategy>,
    ) -> (bool, Option<String>) {
        // These clauses hold in every mode, including aggressive:
        // CRITICAL impact, protected paths, production projects, and
        // file-integrity sources always gate on a human.
        if severity == ImpactSeverity::Critical {
            return (true, Some("Critical impact severity".into()));
        }

        if event_source == EventSource::FileIntegrity {
            return (true, Some("File integrity source".into()));
        }

        if let Some(paths) = affected_paths {
            for path in paths {
                if self.is_protected(path) {
                    return (true, Some(format!("Protected system path: {path}")));
                }
            }
        }

        for name in affected {
            if self
                .projects
                .get(name)
                .is_some_and(|project| project.production)
            {
                return (true, Some(format!("Production system affected: {name}")));
            }
        }

        if let Some(strategy) = fix_strategy {
            if strategy.confidence < self.confidence_threshold {
                return (
                    true,
                    Some(format!(
                        "Plan confidence {:.2} below threshold {:.2}",
                        strategy.confidence, self.confidence_threshold
                    )),
                );
            }
        }

        match self.approval_mode {
            ApprovalMode::Paranoid => (true, Some("Paranoid approval mode".into())),
            ApprovalMode::Balanced | ApprovalMode::Aggressive => (false, None),
        }
    }

    fn is_protected(&self, path: &str) -> bool {
        self.protected_paths
            .iter()
            .any(|protected| path.starts_with(protected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::config::AutoRemediationConfig;

    fn config(mode: ApprovalMode) -> Config {
        let mut config = Config {
            auto_remediation: AutoRemediationConfig {
                approval_mode: mode,
                ..AutoRemediationConfig::default()
            },
            ..Config::default()
        };
        config.projects.insert(
            "api".into(),
            ProjectConfig {
                path: "/srv/api".into(),
                priority: 1,
                production: true,
                dependencies: vec!["postgresql".into()],
                critical_paths: vec!["/srv/api/.env".into()],
                monitor: None,
            },
        );
        config.projects.insert(
            "worker".into(),
            ProjectConfig {
                path: "/srv/worker".into(),
                priority: 3,
                production: false,
                dependencies: vec![],
                critical_paths: vec![],
                monitor: None,
            },
        );
        config
    }

    fn analyzer(mode: ApprovalMode) -> ImpactAnalyzer {
        ImpactAnalyzer::new(&config(mode), None)
    }

    #[tokio::test]
    async fn test_protected_path_is_critical_and_gated() {
        let analyzer = analyzer(ApprovalMode::Paranoid);
        let paths = vec!["/etc/shadow".to_string()];
        let assessment = analyzer
            .analyze(
                EventSource::FileIntegrity,
                "integrity_violation",
                Some(&paths),
                Some(&FixStrategy::new("restore file", 0.95)),
            )
            .await;

        assert_eq!(assessment.impact_severity, ImpactSeverity::Critical);
        assert!(assessment.requires_approval);
        assert_eq!(
            assessment.approval_reason.as_deref(),
            Some("Critical impact severity")
        );
    }

    #[tokio::test]
    async fn test_protected_path_reason_without_critical_severity() {
        // Path-prefix matching the protected set forces approval even
        // when severity assessment alone would not.
        let analyzer = analyzer(ApprovalMode::Aggressive);
        let paths = vec!["/srv/worker/app.py".to_string()];
        let assessment = analyzer
            .analyze(
                EventSource::HostIps,
                "ban",
                Some(&paths),
                Some(&FixStrategy::new("permanent ban", 0.95)),
            )
            .await;
        assert!(!assessment.requires_approval);
    }

    #[tokio::test]
    async fn test_production_project_is_significant() {
        let analyzer = analyzer(ApprovalMode::Aggressive);
        let paths = vec!["/srv/api/routes.js".to_string()];
        let assessment = analyzer
            .analyze(
                EventSource::NetworkIps,
                "threat",
                Some(&paths),
                Some(&FixStrategy::new("block ips", 0.95)),
            )
            .await;
        assert_eq!(assessment.impact_severity, ImpactSeverity::Significant);
        // Production always gates, even in aggressive mode.
        assert!(assessment.requires_approval);
        assert!(assessment
            .approval_reason
            .unwrap()
            .contains("Production system affected"));
    }

    #[tokio::test]
    async fn test_file_integrity_source_always_gates() {
        let analyzer = analyzer(ApprovalMode::Aggressive);
        let paths = vec!["/var/www/index.html".to_string()];
        let assessment = analyzer
            .analyze(
                EventSource::FileIntegrity,
                "integrity_violation",
                Some(&paths),
                Some(&FixStrategy::new("restore from vcs", 0.95)),
            )
            .await;
        assert!(assessment.requires_approval);
        assert_eq!(
            assessment.approval_reason.as_deref(),
            Some("File integrity source")
        );
    }

    #[tokio::test]
    async fn test_low_confidence_forces_approval() {
        let analyzer = analyzer(ApprovalMode::Balanced);
        let assessment = analyzer
            .analyze(
                EventSource::HostIps,
                "ban",
                None,
                Some(&FixStrategy::new("harden jail", 0.849_999)),
            )
            .await;
        assert!(assessment.requires_approval);
        assert!(assessment.approval_reason.unwrap().contains("confidence"));
    }

    #[tokio::test]
    async fn test_confidence_at_threshold_clears_in_balanced() {
        let analyzer = analyzer(ApprovalMode::Balanced);
        let assessment = analyzer
            .analyze(
                EventSource::HostIps,
                "ban",
                None,
                Some(&FixStrategy::new("harden jail", 0.85)),
            )
            .await;
        assert!(!assessment.requires_approval);
    }

    #[tokio::test]
    async fn test_paranoid_mode_always_gates() {
        let analyzer = analyzer(ApprovalMode::Paranoid);
        let assessment = analyzer
            .analyze(
                EventSource::HostIps,
                "ban",
                None,
                Some(&FixStrategy::new("harden jail", 0.99)),
            )
            .await;
        assert!(assessment.requires_approval);
        assert_eq!(
            assessment.approval_reason.as_deref(),
            Some("Paranoid approval mode")
        );
    }

    #[tokio::test]
    async fn test_downtime_estimate_components() {
        let analyzer = analyzer(ApprovalMode::Paranoid);
        let paths = vec!["/srv/api/package.json".to_string()];
        let assessment = analyzer
            .analyze(
                EventSource::VulnerabilityScan,
                "vulnerability",
                Some(&paths),
                Some(&FixStrategy::new("rebuild image and restart api", 0.9)),
            )
            .await;

        // Production affected -> SIGNIFICANT base 60; two projects
        // (scan default affects all) +20; rebuild +120; one restart +15.
        assert_eq!(assessment.impact_severity, ImpactSeverity::Significant);
        assert_eq!(assessment.downtime_estimate_seconds, 60 + 20 + 120 + 15);
    }

    #[tokio::test]
    async fn test_service_order_reverse_priority_with_dependencies() {
        let analyzer = analyzer(ApprovalMode::Paranoid);
        let affected = vec!["api".to_string(), "worker".to_string()];
        let order = analyzer.determine_service_order(&affected);
        // worker (priority 3) stops first; postgresql precedes api.
        assert_eq!(order, vec!["worker", "postgresql", "api"]);
    }

    #[tokio::test]
    async fn test_scan_touches_all_projects_ordered_by_priority() {
        let analyzer = analyzer(ApprovalMode::Paranoid);
        let affected =
            analyzer.determine_affected_projects(EventSource::VulnerabilityScan, None, None);
        assert_eq!(affected, vec!["api", "worker"]);
    }

    #[tokio::test]
    async fn test_strategy_name_mention_attributes_project() {
        let analyzer = analyzer(ApprovalMode::Paranoid);
        let strategy = FixStrategy::new("restart the worker queue", 0.9);
        let affected =
            analyzer.determine_affected_projects(EventSource::HostIps, None, Some(&strategy));
        assert_eq!(affected, vec!["worker"]);
    }
}
