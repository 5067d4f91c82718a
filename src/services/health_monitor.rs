//! Project health monitor.
//!
//! One polling loop per configured project: HTTP probe against the
//! health URL, log-tail pattern scan, incident/recovery notifications
//! on state transitions, and an at-most-once-per-downtime remediation
//! command after a threshold of consecutive failures. A rolling
//! dashboard message is refreshed every five minutes. Strictly
//! independent of the remediation pipeline.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::adapters::sqlite::KnowledgeBase;
use crate::domain::models::config::{Config, MonitorConfig};
use crate::domain::models::ProjectHealthStatus;
use crate::domain::ports::{ChannelKind, Notifier};
use crate::infrastructure::state::StateStore;
use crate::services::executor::{CommandExecutor, ExecuteOptions};

/// Grace period before the first probe.
const STARTUP_GRACE_SECS: u64 = 10;
/// Dashboard refresh cadence.
const DASHBOARD_INTERVAL_SECS: u64 = 300;

const MONITOR_STATE_FILE: &str = "project_monitor_state.json";

/// Persisted counters, line-compatible across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_message_id: Option<String>,
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectCounters>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectCounters {
    pub total_checks: u64,
    pub successful_checks: u64,
    pub failed_checks: u64,
}

pub struct HealthMonitor {
    projects: BTreeMap<String, MonitorConfig>,
    notifier: Arc<dyn Notifier>,
    executor: Arc<CommandExecutor>,
    kb: Arc<KnowledgeBase>,
    state: StateStore,
    statuses: Arc<Mutex<HashMap<String, ProjectHealthStatus>>>,
    client: reqwest::Client,
    shutdown: watch::Sender<bool>,
}

impl HealthMonitor {
    pub fn new(
        config: &Config,
        notifier: Arc<dyn Notifier>,
        executor: Arc<CommandExecutor>,
        kb: Arc<KnowledgeBase>,
        state: StateStore,
    ) -> Self {
        let projects: BTreeMap<String, MonitorConfig> = config
            .projects
            .iter()
            .filter_map(|(name, project)| {
                project.monitor.clone().map(|monitor| (name.clone(), monitor))
            })
            .collect();

        // Resume historical counters.
        let persisted = state.load::<MonitorState>(MONITOR_STATE_FILE);
        let mut statuses = HashMap::new();
        for name in projects.keys() {
            let mut status = ProjectHealthStatus::new(name.clone());
            if let Some(counters) = persisted.value.projects.get(name) {
                status.total_checks = counters.total_checks;
                status.successful_checks = counters.successful_checks;
                status.failed_checks = counters.failed_checks;
            }
            statuses.insert(name.clone(), status);
        }

        let (shutdown, _) = watch::channel(false);
        info!(projects = projects.len(), "health monitor ready");
        Self {
            projects,
            notifier,
            executor,
            kb,
            state,
            statuses: Arc::new(Mutex::new(statuses)),
            client: reqwest::Client::new(),
            shutdown,
        }
    }

    /// Spawn per-project probe loops and the dashboard loop.
    pub fn start(self: &Arc<Self>) {
        for (name, monitor) in &self.projects {
            let this = self.clone();
            let name = name.clone();
            let monitor = monitor.clone();
            let mut shutdown = self.shutdown.subscribe();

            tokio::spawn(async move {
                sleep(Duration::from_secs(STARTUP_GRACE_SECS)).await;
                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return;
                            }
                        }
                        () = async {
                            this.check_project_logs(&name, &monitor).await;
                            this.check_project_health(&name, &monitor).await;
                            sleep(Duration::from_secs(monitor.check_interval)).await;
                        } => {}
                    }
                }
            });
        }

        let this = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                    () = sleep(Duration::from_secs(DASHBOARD_INTERVAL_SECS)) => {
                        this.update_dashboard().await;
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    pub async fn snapshot(&self) -> Vec<ProjectHealthStatus> {
        let statuses = self.statuses.lock().await;
        let mut all: Vec<ProjectHealthStatus> = statuses.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// One HTTP probe for one project.
    pub async fn check_project_health(&self, name: &str, monitor: &MonitorConfig) {
        let started = Instant::now();
        let response = self
            .client
            .get(&monitor.url)
            .timeout(Duration::from_secs(monitor.timeout))
            .send()
            .await;

        let probe: Result<(u16, f64), String> = match response {
            Ok(response) => {
                let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                Ok((response.status().as_u16(), elapsed))
            }
            Err(e) if e.is_timeout() => Err(format!("timeout after {}s", monitor.timeout)),
            Err(e) => Err(format!("connection error: {e}")),
        };

        match probe {
            Ok((status_code, elapsed_ms)) if status_code == monitor.expected_status => {
                let was_recovering = {
                    let mut statuses = self.statuses.lock().await;
                    statuses
                        .get_mut(name)
                        .map(|status| status.update_online(elapsed_ms))
                        .unwrap_or(false)
                };
                debug!(project = name, status_code, elapsed_ms, "health check ok");
                if was_recovering {
                    self.send_recovery(name).await;
                }
            }
            Ok((status_code, _)) => {
                let reason = format!(
                    "status {status_code} (expected {})",
                    monitor.expected_status
                );
                self.handle_offline(name, monitor, &reason).await;
            }
            Err(reason) => {
                self.handle_offline(name, monitor, &reason).await;
            }
        }

        self.save_state().await;
    }

    async fn handle_offline(&self, name: &str, monitor: &MonitorConfig, reason: &str) {
        let new_incident = {
            let mut statuses = self.statuses.lock().await;
            statuses
                .get_mut(name)
                .map(|status| status.update_offline(reason))
                .unwrap_or(false)
        };
        warn!(project = name, reason, "health check failed");

        if new_incident {
            self.notifier
                .send(
                    ChannelKind::ProjectUpdates(name.to_string()),
                    &format!("incident: {name} is offline ({reason})"),
                )
                .await;
        }
        self.attempt_remediation(name, monitor, reason).await;
    }

    async fn send_recovery(&self, name: &str) {
        let downtime = {
            let statuses = self.statuses.lock().await;
            statuses
                .get(name)
                .and_then(|status| status.last_offline_time)
                .map(|t| (chrono::Utc::now() - t).num_seconds())
                .unwrap_or(0)
        };
        info!(project = name, "recovered");
        self.notifier
            .send(
                ChannelKind::ProjectUpdates(name.to_string()),
                &format!("recovery: {name} back online after ~{downtime}s"),
            )
            .await;
    }

    /// Fire the remediation command at most once per downtime episode
    /// once the failure threshold is reached.
    async fn attempt_remediation(&self, name: &str, monitor: &MonitorConfig, reason: &str) {
        let Some(command) = &monitor.remediation_command else {
            return;
        };

        let should_run = {
            let mut statuses = self.statuses.lock().await;
            match statuses.get_mut(name) {
                Some(status)
                    if !status.remediation_triggered
                        && status.consecutive_failures >= monitor.remediation_threshold =>
                {
                    status.remediation_triggered = true;
                    true
                }
                _ => false,
            }
        };
        if !should_run {
            return;
        }

        warn!(project = name, %command, reason, "running auto-remediation");
        match self
            .executor
            .execute(
                command,
                ExecuteOptions::new().with_timeout(Duration::from_secs(300)),
            )
            .await
        {
            Ok(result) if result.success => {
                self.notifier
                    .send(
                        ChannelKind::ProjectUpdates(name.to_string()),
                        &format!("auto-remediation executed for {name}"),
                    )
                    .await;
            }
            Ok(result) => {
                error!(
                    project = name,
                    error = result.error_message.as_deref().unwrap_or(""),
                    "remediation command failed"
                );
            }
            Err(e) => {
                error!(project = name, error = %e, "remediation command refused");
            }
        }
    }

    /// Scan the configured log tail for the configured pattern.
    pub async fn check_project_logs(&self, name: &str, monitor: &MonitorConfig) {
        let (Some(log_file), Some(pattern)) = (&monitor.log_file, &monitor.log_pattern) else {
            return;
        };

        let tail = match read_tail(log_file, monitor.log_tail_bytes) {
            Ok(tail) => tail,
            Err(_) => {
                debug!(project = name, log_file, "log file not readable");
                return;
            }
        };

        if tail.contains(pattern.as_str()) {
            warn!(project = name, pattern, "log pattern detected");
            let _ = self
                .kb
                .record_log_pattern(name, "log_match", pattern, "HIGH")
                .await;
            self.attempt_remediation(name, monitor, &format!("log pattern: {pattern}"))
                .await;
        }
    }

    /// Rebuild and publish the rolling dashboard message.
    async fn update_dashboard(&self) {
        let snapshot = self.snapshot().await;
        let mut lines = vec![format!("project health ({} monitored)", snapshot.len())];
        for status in &snapshot {
            lines.push(format!(
                "{}: {} | uptime {:.1}% | avg {:.0}ms | failures {}",
                status.name,
                if status.is_online { "online" } else { "OFFLINE" },
                status.uptime_percentage(),
                status.average_response_time_ms(),
                status.consecutive_failures,
            ));
        }
        let content = lines.join("\n");

        let handle = {
            let persisted = self.state.load::<MonitorState>(MONITOR_STATE_FILE);
            persisted.value.dashboard_message_id.unwrap_or_default()
        };
        let new_handle = self.notifier.update_live(&handle, &content).await;
        if new_handle != handle {
            let mut persisted = self.state.load::<MonitorState>(MONITOR_STATE_FILE).value;
            persisted.dashboard_message_id = Some(new_handle);
            let _ = self.state.save(MONITOR_STATE_FILE, &persisted);
        }
    }

    async fn save_state(&self) {
        let statuses = self.statuses.lock().await;
        let mut persisted = self.state.load::<MonitorState>(MONITOR_STATE_FILE).value;
        for (name, status) in statuses.iter() {
            persisted.projects.insert(
                name.clone(),
                ProjectCounters {
                    total_checks: status.total_checks,
                    successful_checks: status.successful_checks,
                    failed_checks: status.failed_checks,
                },
            );
        }
        if let Err(e) = self.state.save(MONITOR_STATE_FILE, &persisted) {
            warn!(error = %e, "failed to persist monitor state");
        }
    }
}

fn read_tail(path: &str, tail_bytes: u64) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let size = file.metadata()?.len();
    let start = size.saturating_sub(tail_bytes);
    file.seek(SeekFrom::Start(start))?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::connection::create_test_pool;
    use crate::domain::models::config::{ExecutorConfig, ProjectConfig};
    use crate::domain::ports::ApprovalDecision;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct RecordingNotifier {
        messages: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, _channel: ChannelKind, message: &str) {
            self.messages.lock().await.push(message.to_string());
        }

        async fn request_approval(
            &self,
            _plan_summary: &str,
            _timeout: Duration,
        ) -> ApprovalDecision {
            ApprovalDecision::rejected()
        }

        async fn update_live(&self, handle: &str, _new_content: &str) -> String {
            if handle.is_empty() {
                "msg-1".to_string()
            } else {
                handle.to_string()
            }
        }

        async fn ensure_channels(&self, _layout: &[ChannelKind]) {}
    }

    async fn monitor_with_url(
        dir: &TempDir,
        url: &str,
        remediation: Option<String>,
    ) -> (Arc<HealthMonitor>, Arc<RecordingNotifier>, MonitorConfig) {
        let monitor_config = MonitorConfig {
            url: url.to_string(),
            expected_status: 200,
            check_interval: 1,
            timeout: 2,
            remediation_command: remediation,
            remediation_threshold: 2,
            log_file: None,
            log_pattern: None,
            log_tail_bytes: 50_000,
        };

        let mut config = Config::default();
        config.projects.insert(
            "api".into(),
            ProjectConfig {
                path: "/srv/api".into(),
                monitor: Some(monitor_config.clone()),
                ..ProjectConfig::default()
            },
        );

        let notifier = Arc::new(RecordingNotifier {
            messages: Mutex::new(Vec::new()),
        });
        let executor = Arc::new(CommandExecutor::new(ExecutorConfig::default(), false));
        let pool = create_test_pool().await.unwrap();
        let kb = Arc::new(KnowledgeBase::with_pool(pool).await.unwrap());
        let state = StateStore::new(dir.path()).unwrap();
        let monitor = Arc::new(HealthMonitor::new(
            &config,
            notifier.clone(),
            executor,
            kb,
            state,
        ));
        (monitor, notifier, monitor_config)
    }

    #[tokio::test]
    async fn test_online_offline_transitions_emit_once() {
        let dir = TempDir::new().unwrap();
        let mut server = mockito::Server::new_async().await;
        let ok = server
            .mock("GET", "/health")
            .with_status(200)
            .expect_at_least(1)
            .create_async()
            .await;

        let url = format!("{}/health", server.url());
        let (monitor, notifier, cfg) = monitor_with_url(&dir, &url, None).await;

        monitor.check_project_health("api", &cfg).await;
        ok.assert_async().await;
        {
            let snapshot = monitor.snapshot().await;
            assert!(snapshot[0].is_online);
            assert_eq!(snapshot[0].successful_checks, 1);
        }

        // Flip the endpoint to failing.
        server.reset();
        server
            .mock("GET", "/health")
            .with_status(503)
            .expect_at_least(2)
            .create_async()
            .await;

        monitor.check_project_health("api", &cfg).await;
        monitor.check_project_health("api", &cfg).await;

        let messages = notifier.messages.lock().await;
        let incidents = messages.iter().filter(|m| m.contains("incident")).count();
        assert_eq!(incidents, 1, "one incident per transition: {messages:?}");
    }

    #[tokio::test]
    async fn test_recovery_emitted_after_incident() {
        let dir = TempDir::new().unwrap();
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/health")
            .with_status(500)
            .create_async()
            .await;

        let url = format!("{}/health", server.url());
        let (monitor, notifier, cfg) = monitor_with_url(&dir, &url, None).await;
        monitor.check_project_health("api", &cfg).await;

        server.reset();
        server
            .mock("GET", "/health")
            .with_status(200)
            .create_async()
            .await;
        monitor.check_project_health("api", &cfg).await;

        let messages = notifier.messages.lock().await;
        assert!(messages.iter().any(|m| m.contains("recovery")));
    }

    #[tokio::test]
    async fn test_remediation_fires_once_per_episode() {
        let dir = TempDir::new().unwrap();
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/health")
            .with_status(500)
            .create_async()
            .await;

        let marker = dir.path().join("remediated");
        let command = format!("touch '{}.$$' && echo ran >> '{}'", marker.display(), marker.display());
        let url = format!("{}/health", server.url());
        let (monitor, _notifier, cfg) = monitor_with_url(&dir, &url, Some(command)).await;

        // Threshold is 2: first failure no remediation, second fires,
        // third suppressed within the same episode.
        for _ in 0..3 {
            monitor.check_project_health("api", &cfg).await;
        }

        let runs = std::fs::read_to_string(&marker).unwrap_or_default();
        assert_eq!(runs.matches("ran").count(), 1);
    }

    #[tokio::test]
    async fn test_counters_persist_across_restart() {
        let dir = TempDir::new().unwrap();
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/health")
            .with_status(200)
            .create_async()
            .await;
        let url = format!("{}/health", server.url());

        {
            let (monitor, _, cfg) = monitor_with_url(&dir, &url, None).await;
            monitor.check_project_health("api", &cfg).await;
            monitor.check_project_health("api", &cfg).await;
        }

        // New monitor over the same state dir resumes the counters.
        let (monitor, _, _cfg) = monitor_with_url(&dir, &url, None).await;
        let snapshot = monitor.snapshot().await;
        assert_eq!(snapshot[0].total_checks, 2);
        assert_eq!(snapshot[0].successful_checks, 2);
    }

    #[tokio::test]
    async fn test_log_pattern_triggers_remediation() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("app.log");
        std::fs::write(&log_path, "ok\nok\nFATAL: db connection lost\n").unwrap();

        let marker = dir.path().join("log_remediated");
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/health")
            .with_status(200)
            .create_async()
            .await;
        let url = format!("{}/health", server.url());
        let (monitor, _, mut cfg) =
            monitor_with_url(&dir, &url, Some(format!("echo ran >> '{}'", marker.display())))
                .await;
        cfg.log_file = Some(log_path.display().to_string());
        cfg.log_pattern = Some("FATAL: db connection lost".to_string());
        cfg.remediation_threshold = 0;

        monitor.check_project_logs("api", &cfg).await;
        let runs = std::fs::read_to_string(&marker).unwrap_or_default();
        assert_eq!(runs.matches("ran").count(), 1);
    }
}
