//! Configuration tree for the controller.
//!
//! Loaded hierarchically by `infrastructure::config::ConfigLoader`:
//! programmatic defaults, then `.vigil/config.yaml`, then
//! `.vigil/local.yaml`, then `VIGIL_*` environment variables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Policy that determines when auto-execution is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// All jobs require human approval.
    Paranoid,
    /// Transient failures summarized daily; refusals and verification
    /// failures escalate immediately.
    Balanced,
    /// Only verification failures on CRITICAL batches escalate
    /// immediately. CRITICAL impact still forces approval.
    Aggressive,
}

impl ApprovalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paranoid => "paranoid",
            Self::Balanced => "balanced",
            Self::Aggressive => "aggressive",
        }
    }
}

impl fmt::Display for ApprovalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "paranoid" => Ok(Self::Paranoid),
            "balanced" => Ok(Self::Balanced),
            "aggressive" => Ok(Self::Aggressive),
            other => Err(format!("unknown approval mode: {other}")),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    #[serde(default)]
    pub auto_remediation: AutoRemediationConfig,

    #[serde(default)]
    pub knowledge_base: KnowledgeBaseConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub sources: SourcesConfig,

    #[serde(default)]
    pub ai: AiConfig,

    #[serde(default)]
    pub github: GithubConfig,

    /// Monitored projects, keyed by name.
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectConfig>,

    /// Managed services, keyed by name.
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub notifier: NotifierConfig,

    /// Directory for persisted JSON state and the batch archive.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// System paths whose modification always requires approval.
    #[serde(default = "default_protected_paths")]
    pub protected_paths: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_remediation: AutoRemediationConfig::default(),
            knowledge_base: KnowledgeBaseConfig::default(),
            backup: BackupConfig::default(),
            sources: SourcesConfig::default(),
            ai: AiConfig::default(),
            github: GithubConfig::default(),
            projects: BTreeMap::new(),
            services: BTreeMap::new(),
            executor: ExecutorConfig::default(),
            logging: LoggingConfig::default(),
            notifier: NotifierConfig::default(),
            state_dir: default_state_dir(),
            protected_paths: default_protected_paths(),
        }
    }
}

fn default_state_dir() -> String {
    ".vigil/state".to_string()
}

fn default_protected_paths() -> Vec<String> {
    [
        "/etc/passwd",
        "/etc/shadow",
        "/etc/ssh",
        "/boot",
        "/etc/systemd/system",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

/// Auto-remediation pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AutoRemediationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_approval_mode")]
    pub approval_mode: ApprovalMode,

    #[serde(default)]
    pub dry_run: bool,

    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: u32,

    /// Seconds the circuit stays open before a HALF_OPEN probe.
    #[serde(default = "default_breaker_timeout")]
    pub circuit_breaker_timeout: u64,

    /// Per-source poll cadence overrides in seconds, keyed by source
    /// name (`vulnerability_scan`, `host_ips`, ...).
    #[serde(default)]
    pub scan_intervals: BTreeMap<String, u64>,

    /// Seconds the orchestrator collects events into a batch.
    #[serde(default = "default_collection_window")]
    pub collection_window_seconds: u64,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Total attempts per event (first try + retries).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Plans below this confidence are refused.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Seconds to wait for a human approval decision.
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout_seconds: u64,
}

const fn default_true() -> bool {
    true
}

const fn default_approval_mode() -> ApprovalMode {
    ApprovalMode::Paranoid
}

const fn default_breaker_threshold() -> u32 {
    5
}

const fn default_breaker_timeout() -> u64 {
    3600
}

const fn default_collection_window() -> u64 {
    10
}

const fn default_max_batch_size() -> usize {
    10
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_confidence_threshold() -> f64 {
    0.85
}

const fn default_approval_timeout() -> u64 {
    1800
}

impl Default for AutoRemediationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            approval_mode: ApprovalMode::Paranoid,
            dry_run: false,
            circuit_breaker_threshold: default_breaker_threshold(),
            circuit_breaker_timeout: default_breaker_timeout(),
            scan_intervals: BTreeMap::new(),
            collection_window_seconds: default_collection_window(),
            max_batch_size: default_max_batch_size(),
            max_attempts: default_max_attempts(),
            confidence_threshold: default_confidence_threshold(),
            approval_timeout_seconds: default_approval_timeout(),
        }
    }
}

/// Knowledge base configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct KnowledgeBaseConfig {
    #[serde(default = "default_kb_path")]
    pub path: String,

    #[serde(default = "default_kb_retention_days")]
    pub retention_days: u32,
}

fn default_kb_path() -> String {
    ".vigil/knowledge.db".to_string()
}

const fn default_kb_retention_days() -> u32 {
    90
}

impl Default for KnowledgeBaseConfig {
    fn default() -> Self {
        Self {
            path: default_kb_path(),
            retention_days: default_kb_retention_days(),
        }
    }
}

/// Backup manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BackupConfig {
    #[serde(default = "default_backup_root")]
    pub root: String,

    #[serde(default = "default_backup_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_true")]
    pub compression: bool,

    /// Soft cap; larger backups warn but still succeed.
    #[serde(default = "default_backup_max_size_mb")]
    pub max_size_mb: u64,
}

fn default_backup_root() -> String {
    ".vigil/backups".to_string()
}

const fn default_backup_retention_days() -> u32 {
    7
}

const fn default_backup_max_size_mb() -> u64 {
    1000
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            root: default_backup_root(),
            retention_days: default_backup_retention_days(),
            compression: true,
            max_size_mb: default_backup_max_size_mb(),
        }
    }
}

/// Per-tool source adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SourcesConfig {
    /// JSON scan report produced by the vulnerability scanner.
    #[serde(default = "default_scan_report_path")]
    pub scan_report_path: String,

    /// Integrity-check report file.
    #[serde(default = "default_integrity_report_path")]
    pub integrity_report_path: String,

    /// Command printing active threat-feed decisions as JSON.
    #[serde(default = "default_threat_decisions_command")]
    pub threat_decisions_command: String,

    /// Command printing jail ban status.
    #[serde(default = "default_jail_status_command")]
    pub jail_status_command: String,

    /// Jails to poll for bans.
    #[serde(default = "default_jails")]
    pub jails: Vec<String>,

    /// Path prefixes whose integrity changes are CRITICAL.
    #[serde(default = "default_critical_paths")]
    pub critical_paths: Vec<String>,

    /// Per-poll timeout in seconds.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_seconds: u64,

    /// Command re-scanning an image after a vulnerability fix; the
    /// image reference is appended.
    #[serde(default = "default_rescan_command")]
    pub rescan_command: String,

    /// Command refreshing the file-integrity baseline.
    #[serde(default = "default_baseline_update_command")]
    pub baseline_update_command: String,

    /// Where quarantined files are moved.
    #[serde(default = "default_quarantine_dir")]
    pub quarantine_dir: String,
}

fn default_scan_report_path() -> String {
    "/var/log/vigil/scan_report.json".to_string()
}

fn default_integrity_report_path() -> String {
    "/var/log/vigil/integrity_report.json".to_string()
}

fn default_threat_decisions_command() -> String {
    "cscli decisions list -o json".to_string()
}

fn default_jail_status_command() -> String {
    "fail2ban-client status".to_string()
}

fn default_jails() -> Vec<String> {
    vec!["sshd".to_string()]
}

fn default_critical_paths() -> Vec<String> {
    [
        "/etc/passwd",
        "/etc/shadow",
        "/etc/ssh/",
        "/etc/sudoers",
        "/boot/",
        "/root/.ssh/",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

const fn default_poll_timeout() -> u64 {
    30
}

fn default_rescan_command() -> String {
    "trivy image --format json".to_string()
}

fn default_baseline_update_command() -> String {
    "aide --update".to_string()
}

fn default_quarantine_dir() -> String {
    "/var/quarantine".to_string()
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            scan_report_path: default_scan_report_path(),
            integrity_report_path: default_integrity_report_path(),
            threat_decisions_command: default_threat_decisions_command(),
            jail_status_command: default_jail_status_command(),
            jails: default_jails(),
            critical_paths: default_critical_paths(),
            poll_timeout_seconds: default_poll_timeout(),
            rescan_command: default_rescan_command(),
            baseline_update_command: default_baseline_update_command(),
            quarantine_dir: default_quarantine_dir(),
        }
    }
}

/// Model backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AiConfig {
    /// Providers tried in order.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// Minimum spacing between provider requests in milliseconds.
    #[serde(default = "default_request_spacing_ms")]
    pub request_spacing_ms: u64,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Per-request timeout in seconds.
    #[serde(default = "default_ai_timeout")]
    pub request_timeout_seconds: u64,
}

const fn default_request_spacing_ms() -> u64 {
    500
}

const fn default_temperature() -> f64 {
    0.3
}

const fn default_ai_timeout() -> u64 {
    180
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            request_spacing_ms: default_request_spacing_ms(),
            temperature: default_temperature(),
            request_timeout_seconds: default_ai_timeout(),
        }
    }
}

/// One model provider entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProviderConfig {
    /// `local` (OpenAI-compatible endpoint), `anthropic`, or `openai`.
    pub kind: String,

    #[serde(default)]
    pub endpoint: String,

    /// Environment variable holding the API key, if any.
    #[serde(default)]
    pub api_key_env: String,

    pub model: String,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Webhook and repository polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GithubConfig {
    #[serde(default)]
    pub webhook_secret: String,

    #[serde(default = "default_webhook_port")]
    pub webhook_port: u16,

    #[serde(default)]
    pub webhook_public_url: String,

    /// Branches whose pushes produce notifications.
    #[serde(default = "default_deploy_branches")]
    pub deploy_branches: Vec<String>,

    /// Seconds between local repository polls. 0 disables polling.
    #[serde(default = "default_polling_interval")]
    pub local_polling_interval: u64,

    #[serde(default = "default_dedupe_ttl")]
    pub dedupe_ttl_seconds: u64,

    /// Local repositories to poll: name -> checkout path.
    #[serde(default)]
    pub repositories: BTreeMap<String, String>,
}

const fn default_webhook_port() -> u16 {
    8787
}

fn default_deploy_branches() -> Vec<String> {
    vec!["main".to_string(), "master".to_string()]
}

const fn default_polling_interval() -> u64 {
    300
}

const fn default_dedupe_ttl() -> u64 {
    300
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            webhook_secret: String::new(),
            webhook_port: default_webhook_port(),
            webhook_public_url: String::new(),
            deploy_branches: default_deploy_branches(),
            local_polling_interval: default_polling_interval(),
            dedupe_ttl_seconds: default_dedupe_ttl(),
            repositories: BTreeMap::new(),
        }
    }
}

/// One monitored project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProjectConfig {
    pub path: String,

    /// 1 = highest priority.
    #[serde(default = "default_project_priority")]
    pub priority: u8,

    /// Production projects always require approval for impact.
    #[serde(default)]
    pub production: bool,

    /// Services this project depends on (started first).
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Paths whose modification is critical for this project.
    #[serde(default)]
    pub critical_paths: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<MonitorConfig>,
}

const fn default_project_priority() -> u8 {
    2
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            priority: default_project_priority(),
            production: false,
            dependencies: Vec::new(),
            critical_paths: Vec::new(),
            monitor: None,
        }
    }
}

/// Health-monitoring settings for a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MonitorConfig {
    pub url: String,

    #[serde(default = "default_expected_status")]
    pub expected_status: u16,

    #[serde(default = "default_check_interval")]
    pub check_interval: u64,

    #[serde(default = "default_probe_timeout")]
    pub timeout: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation_command: Option<String>,

    #[serde(default = "default_remediation_threshold")]
    pub remediation_threshold: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_pattern: Option<String>,

    #[serde(default = "default_log_tail_bytes")]
    pub log_tail_bytes: u64,
}

const fn default_expected_status() -> u16 {
    200
}

const fn default_check_interval() -> u64 {
    60
}

const fn default_probe_timeout() -> u64 {
    10
}

const fn default_remediation_threshold() -> u32 {
    3
}

const fn default_log_tail_bytes() -> u64 {
    50_000
}

/// One managed service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ServiceConfig {
    /// Command whose success means the service is running.
    pub check_command: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_command: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_command: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<String>,

    #[serde(default = "default_graceful_timeout")]
    pub graceful_shutdown_timeout: u64,
}

const fn default_graceful_timeout() -> u64 {
    30
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            check_command: String::new(),
            start_command: None,
            stop_command: None,
            health_check: None,
            graceful_shutdown_timeout: default_graceful_timeout(),
        }
    }
}

/// Command executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExecutorConfig {
    /// Default per-command timeout in seconds.
    #[serde(default = "default_command_timeout")]
    pub default_timeout_seconds: u64,

    /// Hard cap on any single command timeout.
    #[serde(default = "default_max_command_timeout")]
    pub max_timeout_seconds: u64,

    /// Captured output cap in bytes per stream.
    #[serde(default = "default_output_cap")]
    pub max_output_bytes: usize,

    /// IPs that must never be blocked by the network fixer.
    #[serde(default = "default_whitelist")]
    pub ip_whitelist: Vec<String>,
}

const fn default_command_timeout() -> u64 {
    300
}

const fn default_max_command_timeout() -> u64 {
    3600
}

const fn default_output_cap() -> usize {
    1024 * 1024
}

fn default_whitelist() -> Vec<String> {
    vec!["127.0.0.1".to_string(), "::1".to_string()]
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: default_command_timeout(),
            max_timeout_seconds: default_max_command_timeout(),
            max_output_bytes: default_output_cap(),
            ip_whitelist: default_whitelist(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

/// Notifier configuration for the shipped log-backed sink.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NotifierConfig {
    /// Approve requests immediately instead of rejecting on timeout.
    /// Intended for dry-run soak testing only.
    #[serde(default)]
    pub auto_approve: bool,
}

impl Config {
    /// Effective poll interval for a source, seconds.
    pub fn scan_interval(&self, source: &str) -> u64 {
        if let Some(v) = self.auto_remediation.scan_intervals.get(source) {
            return *v;
        }
        match source {
            "vulnerability_scan" => 21_600,
            "file_integrity" => 900,
            _ => 30,
        }
    }
}
