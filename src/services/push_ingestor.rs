//! Push/change ingestor.
//!
//! Accepts webhook deliveries (push, pull request, release, workflow
//! run) and optionally polls local repositories for new commits,
//! synthesizing push events. Deduplication requires both the
//! in-memory inflight set (TTL-bounded) and the persisted
//! last-processed-commit map to agree that a commit is new before a
//! notification goes out. Change summaries come from the model
//! backend with a lexical-prefix fallback.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::adapters::sqlite::KnowledgeBase;
use crate::domain::models::config::GithubConfig;
use crate::domain::ports::{ChannelKind, Notifier};
use crate::infrastructure::state::StateStore;
use crate::services::planner::Planner;

const PUSH_STATE_FILE: &str = "git_push_state.json";

/// One commit in a push.
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
    pub author: String,
}

/// Lexical-fallback change classification.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    pub features: Vec<String>,
    pub fixes: Vec<String>,
    pub improvements: Vec<String>,
    pub other: Vec<String>,
}

impl ChangeSummary {
    pub fn render(&self) -> String {
        let mut sections = Vec::new();
        for (header, entries) in [
            ("New features:", &self.features),
            ("Fixes:", &self.fixes),
            ("Improvements:", &self.improvements),
            ("Other changes:", &self.other),
        ] {
            if !entries.is_empty() {
                let bullets: Vec<String> =
                    entries.iter().map(|entry| format!("- {entry}")).collect();
                sections.push(format!("{header}\n{}", bullets.join("\n")));
            }
        }
        sections.join("\n\n")
    }
}

/// Classify commit subjects by lexical prefix.
pub fn classify_commits(messages: &[String]) -> ChangeSummary {
    let mut summary = ChangeSummary::default();
    for message in messages {
        let subject = message.lines().next().unwrap_or_default().to_string();
        let lower = subject.to_lowercase();
        if lower.starts_with("feat") || lower.contains("feature") || lower.contains("add") {
            summary.features.push(subject);
        } else if lower.starts_with("fix") || lower.contains("bug") || lower.contains("issue") {
            summary.fixes.push(subject);
        } else if lower.starts_with("improve")
            || lower.contains("optimize")
            || lower.contains("enhance")
            || lower.contains("update")
        {
            summary.improvements.push(subject);
        } else {
            summary.other.push(subject);
        }
    }
    summary
}

pub struct PushIngestor {
    config: GithubConfig,
    planner: Arc<Planner>,
    kb: Arc<KnowledgeBase>,
    notifier: Arc<dyn Notifier>,
    state: StateStore,
    inflight: Mutex<HashMap<String, Instant>>,
    ready: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl PushIngestor {
    pub fn new(
        config: GithubConfig,
        planner: Arc<Planner>,
        kb: Arc<KnowledgeBase>,
        notifier: Arc<dyn Notifier>,
        state: StateStore,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            planner,
            kb,
            notifier,
            state,
            inflight: Mutex::new(HashMap::new()),
            ready: AtomicBool::new(false),
            shutdown,
        }
    }

    /// The webhook answers 202 until the pipeline reports ready.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Start the local repository polling loop when configured.
    pub fn start_polling(self: &Arc<Self>) {
        if self.config.local_polling_interval == 0 || self.config.repositories.is_empty() {
            return;
        }
        let this = self.clone();
        let interval = Duration::from_secs(self.config.local_polling_interval);
        let mut shutdown = self.shutdown.subscribe();
        info!(
            repos = this.config.repositories.len(),
            interval_secs = interval.as_secs(),
            "starting local repo polling"
        );
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                    () = sleep(interval) => {
                        this.poll_local_repos().await;
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Dispatch one verified webhook delivery.
    pub async fn handle_webhook(&self, event_type: &str, payload: &Value) -> Result<(), String> {
        match event_type {
            "push" => self.handle_push(payload).await,
            "pull_request" => {
                self.handle_simple_event(payload, "pull_request", |p| {
                    let action = p.get("action").and_then(Value::as_str).unwrap_or("?");
                    let title = p
                        .pointer("/pull_request/title")
                        .and_then(Value::as_str)
                        .unwrap_or("untitled");
                    format!("pull request {action}: {title}")
                })
                .await
            }
            "release" => {
                self.handle_simple_event(payload, "release", |p| {
                    let tag = p
                        .pointer("/release/tag_name")
                        .and_then(Value::as_str)
                        .unwrap_or("?");
                    format!("release published: {tag}")
                })
                .await
            }
            "workflow_run" => {
                self.handle_simple_event(payload, "workflow_run", |p| {
                    let name = p
                        .pointer("/workflow_run/name")
                        .and_then(Value::as_str)
                        .unwrap_or("workflow");
                    let conclusion = p
                        .pointer("/workflow_run/conclusion")
                        .and_then(Value::as_str)
                        .unwrap_or("in progress");
                    format!("CI {name}: {conclusion}")
                })
                .await
            }
            other => {
                debug!(event = other, "ignoring webhook event type");
                Ok(())
            }
        }
    }

    async fn handle_simple_event(
        &self,
        payload: &Value,
        kind: &str,
        describe: impl Fn(&Value) -> String,
    ) -> Result<(), String> {
        let repo = payload
            .pointer("/repository/full_name")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let message = format!("[{repo}] {}", describe(payload));
        info!(kind, repo, "webhook event");
        self.notifier.send(ChannelKind::DeploymentLog, &message).await;
        Ok(())
    }

    async fn handle_push(&self, payload: &Value) -> Result<(), String> {
        let repo = payload
            .pointer("/repository/full_name")
            .and_then(Value::as_str)
            .ok_or("push payload missing repository.full_name")?
            .to_string();
        let branch = payload
            .get("ref")
            .and_then(Value::as_str)
            .and_then(|r| r.strip_prefix("refs/heads/"))
            .ok_or("push payload missing branch ref")?
            .to_string();
        let head_sha = payload
            .get("after")
            .and_then(Value::as_str)
            .ok_or("push payload missing head sha")?
            .to_string();

        if !self.config.deploy_branches.contains(&branch) {
            debug!(repo, branch, "push to non-deploy branch ignored");
            return Ok(());
        }

        let commits: Vec<CommitInfo> = payload
            .get("commits")
            .and_then(Value::as_array)
            .map(|commits| {
                commits
                    .iter()
                    .filter_map(|commit| {
                        Some(CommitInfo {
                            sha: commit.get("id")?.as_str()?.to_string(),
                            message: commit.get("message")?.as_str()?.to_string(),
                            author: commit
                                .pointer("/author/name")
                                .and_then(Value::as_str)
                                .unwrap_or("unknown")
                                .to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        self.process_push(&repo, &branch, &head_sha, &commits).await
    }

    /// Shared path for webhook pushes and synthesized polling pushes.
    async fn process_push(
        &self,
        repo: &str,
        branch: &str,
        head_sha: &str,
        commits: &[CommitInfo],
    ) -> Result<(), String> {
        // Both dedup layers must agree before a notification is sent.
        if !self.mark_inflight(repo, branch, head_sha).await {
            debug!(repo, branch, head_sha, "commit already inflight");
            return Ok(());
        }
        if self.last_processed(repo, branch).as_deref() == Some(head_sha) {
            debug!(repo, branch, head_sha, "commit already processed");
            self.unmark_inflight(repo, branch, head_sha).await;
            return Ok(());
        }

        info!(repo, branch, commits = commits.len(), "processing push");

        let messages: Vec<String> = commits.iter().map(|c| c.message.clone()).collect();
        let summary = self.summarize(repo, &messages).await;
        self.notifier
            .send(
                ChannelKind::DeploymentLog,
                &format!("[{repo}:{branch}] {} commit(s)\n{summary}", commits.len()),
            )
            .await;

        for commit in commits {
            let category = lexical_category(&commit.message);
            let _ = self
                .kb
                .record_code_change(repo, &commit.sha, &commit.message, &commit.author, 0, category)
                .await;
        }

        self.set_last_processed(repo, branch, head_sha);
        self.unmark_inflight(repo, branch, head_sha).await;
        Ok(())
    }

    async fn summarize(&self, repo: &str, messages: &[String]) -> String {
        if messages.is_empty() {
            return "no commit details".to_string();
        }
        let joined = messages.join("\n");
        match self.planner.summarize(&joined).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(repo, error = %e, "model summary failed, using lexical fallback");
                classify_commits(messages).render()
            }
        }
    }

    /// Poll each configured local checkout for new commits on the
    /// deploy branches.
    pub async fn poll_local_repos(&self) {
        for (name, path) in &self.config.repositories {
            for branch in &self.config.deploy_branches {
                match local_head(path, branch).await {
                    Some(head_sha) => {
                        let last = self.last_processed(name, branch);
                        match last {
                            // First sighting: remember without
                            // notifying (avoids a replay storm on
                            // fresh state).
                            None => self.set_last_processed(name, branch, &head_sha),
                            Some(last_sha) if last_sha != head_sha => {
                                let commits =
                                    local_commits(path, &last_sha, &head_sha).await;
                                if let Err(e) = self
                                    .process_push(name, branch, &head_sha, &commits)
                                    .await
                                {
                                    warn!(repo = name, error = e, "local push processing failed");
                                }
                            }
                            Some(_) => {}
                        }
                    }
                    None => debug!(repo = name, branch, "branch not found in local checkout"),
                }
            }
        }
    }

    fn push_state(&self) -> HashMap<String, String> {
        self.state.load::<HashMap<String, String>>(PUSH_STATE_FILE).value
    }

    fn last_processed(&self, repo: &str, branch: &str) -> Option<String> {
        self.push_state().get(&format!("{repo}:{branch}")).cloned()
    }

    fn set_last_processed(&self, repo: &str, branch: &str, sha: &str) {
        let mut state = self.push_state();
        state.insert(format!("{repo}:{branch}"), sha.to_string());
        if let Err(e) = self.state.save(PUSH_STATE_FILE, &state) {
            warn!(error = %e, "failed to persist push state");
        }
    }

    /// Returns false when the commit is already inflight.
    async fn mark_inflight(&self, repo: &str, branch: &str, sha: &str) -> bool {
        let ttl = Duration::from_secs(self.config.dedupe_ttl_seconds);
        let key = format!("{repo}:{branch}:{sha}");
        let mut inflight = self.inflight.lock().await;
        inflight.retain(|_, stamped| stamped.elapsed() < ttl);
        if inflight.contains_key(&key) {
            return false;
        }
        inflight.insert(key, Instant::now());
        true
    }

    async fn unmark_inflight(&self, repo: &str, branch: &str, sha: &str) {
        self.inflight
            .lock()
            .await
            .remove(&format!("{repo}:{branch}:{sha}"));
    }
}

fn lexical_category(message: &str) -> &'static str {
    let lower = message.to_lowercase();
    if lower.starts_with("feat") || lower.contains("feature") || lower.contains("add") {
        "feature"
    } else if lower.starts_with("fix") || lower.contains("bug") || lower.contains("issue") {
        "fix"
    } else if lower.starts_with("improve")
        || lower.contains("optimize")
        || lower.contains("enhance")
        || lower.contains("update")
    {
        "improvement"
    } else {
        "other"
    }
}

async fn local_head(path: &str, branch: &str) -> Option<String> {
    let output = tokio::process::Command::new("git")
        .args(["-C", path, "rev-parse", branch])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!sha.is_empty()).then_some(sha)
}

async fn local_commits(path: &str, from: &str, to: &str) -> Vec<CommitInfo> {
    let range = format!("{from}..{to}");
    let Ok(output) = tokio::process::Command::new("git")
        .args([
            "-C",
            path,
            "log",
            "--pretty=format:%H%x09%an%x09%s",
            &range,
        ])
        .output()
        .await
    else {
        return Vec::new();
    };
    if !output.status.success() {
        return Vec::new();
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            Some(CommitInfo {
                sha: parts.next()?.to_string(),
                author: parts.next()?.to_string(),
                message: parts.next()?.to_string(),
            })
        })
        .collect()
}
