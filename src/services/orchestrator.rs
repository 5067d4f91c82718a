//! Remediation orchestrator.
//!
//! Collects events into batches inside a time window, requests one
//! coordinated plan per batch, gates execution on a single human
//! approval, and executes phases sequentially under a global
//! execution lock with bounded, knowledge-base-paced retries and
//! reverse-order rollback. Every attempt is recorded in the
//! knowledge base. A job-level circuit breaker halts new batches
//! after sustained failures.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::adapters::sqlite::KnowledgeBase;
use crate::domain::models::batch::{BatchStatus, RemediationBatch};
use crate::domain::models::config::{ApprovalMode, Config};
use crate::domain::models::job::{AttemptResult, RemediationAttempt, RemediationJob};
use crate::domain::models::plan::{FixStrategy, RemediationPlan};
use crate::domain::models::{EventDetails, EventSource, SecurityEvent, Severity};
use crate::domain::ports::{ChannelKind, Notifier};
use crate::infrastructure::state::StateStore;
use crate::services::backup::BackupManager;
use crate::services::circuit_breaker::{CircuitBreaker, CircuitStatus};
use crate::services::fixers::Fixer;
use crate::services::impact::ImpactAnalyzer;
use crate::services::planner::{Planner, PriorAttempt};
use crate::services::service_manager::ServiceManager;

const PENDING_BATCHES_FILE: &str = "pending_batches.json";

/// Adaptive retry delay: exponential base modulated by the
/// historical success rate for this signature.
///
/// Multiplier 0.5 at success rate >= 0.8, 1.0 in [0.4, 0.8), 2.0
/// below 0.4 (and 1.0 with no history). Floor 1s, ceiling 60s.
fn adaptive_delay_seconds(attempt: u32, success_rate: Option<f64>) -> u64 {
    let base = 2_u64.saturating_pow(attempt);
    let multiplier = match success_rate {
        Some(rate) if rate >= 0.8 => 0.5,
        Some(rate) if rate >= 0.4 => 1.0,
        Some(_) => 2.0,
        None => 1.0,
    };
    ((base as f64 * multiplier) as u64).clamp(1, 60)
}

/// Snapshot of orchestrator state for the status CLI.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OrchestratorStatus {
    pub current_batch_events: usize,
    pub pending_batches: usize,
    pub currently_executing: Option<u64>,
    pub completed_batches: u64,
    pub failed_batches: u64,
    pub circuit: CircuitStatus,
}

struct BatchState {
    current: Option<RemediationBatch>,
    next_batch_id: u64,
    pending: Vec<RemediationBatch>,
    completed: u64,
    failed: u64,
    executing: Option<u64>,
}

struct Inner {
    config: Config,
    batch_state: Mutex<BatchState>,
    execution_lock: Mutex<()>,
    breaker: Mutex<CircuitBreaker>,
    planner: Arc<Planner>,
    notifier: Arc<dyn Notifier>,
    kb: Arc<KnowledgeBase>,
    backup_manager: Arc<BackupManager>,
    impact: Arc<ImpactAnalyzer>,
    service_manager: Arc<ServiceManager>,
    fixers: HashMap<EventSource, Arc<dyn Fixer>>,
    state: StateStore,
    shutting_down: AtomicBool,
}

pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        planner: Arc<Planner>,
        notifier: Arc<dyn Notifier>,
        kb: Arc<KnowledgeBase>,
        backup_manager: Arc<BackupManager>,
        impact: Arc<ImpactAnalyzer>,
        service_manager: Arc<ServiceManager>,
        fixers: HashMap<EventSource, Arc<dyn Fixer>>,
        state: StateStore,
    ) -> Self {
        let breaker = CircuitBreaker::new(
            config.auto_remediation.circuit_breaker_threshold,
            config.auto_remediation.circuit_breaker_timeout,
        );

        // Pending batches persisted at the previous shutdown resume
        // here.
        let resumed = state.load::<Vec<RemediationBatch>>(PENDING_BATCHES_FILE);
        if !resumed.value.is_empty() {
            info!(batches = resumed.value.len(), "resuming persisted batches");
        }
        let next_batch_id = resumed
            .value
            .iter()
            .map(|batch| batch.batch_id + 1)
            .max()
            .unwrap_or(1);

        let inner = Arc::new(Inner {
            config,
            batch_state: Mutex::new(BatchState {
                current: None,
                next_batch_id,
                pending: resumed.value,
                completed: 0,
                failed: 0,
                executing: None,
            }),
            execution_lock: Mutex::new(()),
            breaker: Mutex::new(breaker),
            planner,
            notifier,
            kb,
            backup_manager,
            impact,
            service_manager,
            fixers,
            state,
            shutting_down: AtomicBool::new(false),
        });

        Self { inner }
    }

    /// Consume the watcher's event channel until it closes.
    pub fn start(&self, mut events: mpsc::Receiver<SecurityEvent>) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            // Kick any resumed batches.
            Inner::spawn_processing(&inner);
            while let Some(event) = events.recv().await {
                inner.submit(event).await;
            }
            info!("event channel closed, orchestrator intake stopped");
        });
    }

    /// Submit a single event (bypassing the channel).
    pub async fn submit(&self, event: SecurityEvent) {
        self.inner.submit(event).await;
    }

    /// Finish the current phase if one is executing, then persist the
    /// pending queue.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        // Waits until the executing batch releases the lock.
        let _guard = self.inner.execution_lock.lock().await;
        let batch_state = self.inner.batch_state.lock().await;
        let mut pending = batch_state.pending.clone();
        if let Some(current) = &batch_state.current {
            if !current.is_empty() {
                pending.push(current.clone());
            }
        }
        if let Err(e) = self.inner.state.save(PENDING_BATCHES_FILE, &pending) {
            error!(error = %e, "failed to persist pending batches");
        }
        info!(pending = pending.len(), "orchestrator shut down");
    }

    pub async fn status(&self) -> OrchestratorStatus {
        let batch_state = self.inner.batch_state.lock().await;
        let breaker = self.inner.breaker.lock().await;
        OrchestratorStatus {
            current_batch_events: batch_state.current.as_ref().map_or(0, RemediationBatch::len),
            pending_batches: batch_state.pending.len(),
            currently_executing: batch_state.executing,
            completed_batches: batch_state.completed,
            failed_batches: batch_state.failed,
            circuit: breaker.status(),
        }
    }

    /// Block until every queued batch has been processed. Test and
    /// replay helper.
    pub async fn drain(&self) {
        loop {
            {
                let batch_state = self.inner.batch_state.lock().await;
                if batch_state.pending.is_empty()
                    && batch_state.executing.is_none()
                    && batch_state.current.is_none()
                {
                    return;
                }
            }
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// Re-run an archived batch's plan. Callers wire dry-run
    /// components for replay.
    pub async fn execute_archived(&self, batch_id: u64) -> Result<bool, String> {
        let (mut batch, plan) = self
            .inner
            .state
            .load_archived_batch(batch_id)
            .map_err(|e| e.to_string())?;
        let plan = plan.ok_or_else(|| format!("batch {batch_id} has no archived plan"))?;
        info!(batch_id, "replaying archived batch");
        batch.status = BatchStatus::Executing;
        let ok = self.inner.execute_plan(&mut batch, &plan).await;
        Ok(ok)
    }
}

impl Inner {
    async fn submit(self: &Arc<Self>, event: SecurityEvent) {
        if !self.config.auto_remediation.enabled {
            return;
        }

        // Adapter-failure meta-events alert operators; they are not
        // remediable by fixers.
        if let EventDetails::AdapterFailure { adapter, last_error, .. } = &event.details {
            self.notifier
                .send(
                    ChannelKind::Alerts,
                    &format!("adapter {adapter} failing repeatedly: {last_error}"),
                )
                .await;
            return;
        }

        let mut batch_state = self.batch_state.lock().await;

        if batch_state.current.is_none() {
            let batch_id = batch_state.next_batch_id;
            batch_state.next_batch_id += 1;
            batch_state.current = Some(RemediationBatch::new(batch_id));
            info!(batch_id, "new event batch started");

            let inner = self.clone();
            let window = Duration::from_secs(self.config.auto_remediation.collection_window_seconds);
            tokio::spawn(async move {
                sleep(window).await;
                inner.close_if_current(batch_id).await;
            });
        }

        let max_batch_size = self.config.auto_remediation.max_batch_size;
        let close_now = {
            let batch = batch_state.current.as_mut().expect("batch just ensured");
            info!(
                batch_id = batch.batch_id,
                source = %event.source,
                severity = %event.severity,
                count = batch.len() + 1,
                "event added to batch"
            );
            batch.add_event(event);
            batch.len() >= max_batch_size
        };

        if close_now {
            info!("batch size limit reached, closing immediately");
            Self::close_current_locked(&mut batch_state);
            drop(batch_state);
            Self::spawn_processing(self);
        }
    }

    /// Collection-timer callback: close the batch if it is still the
    /// open one (a size-triggered close may have won).
    async fn close_if_current(self: &Arc<Self>, batch_id: u64) {
        let mut batch_state = self.batch_state.lock().await;
        let still_current = batch_state
            .current
            .as_ref()
            .is_some_and(|batch| batch.batch_id == batch_id && !batch.is_empty());
        if still_current {
            info!(batch_id, "collection window elapsed");
            Self::close_current_locked(&mut batch_state);
            drop(batch_state);
            Self::spawn_processing(self);
        }
    }

    fn close_current_locked(batch_state: &mut BatchState) {
        if let Some(mut batch) = batch_state.current.take() {
            batch.status = BatchStatus::Analyzing;
            batch_state.pending.push(batch);
        }
    }

    fn spawn_processing(inner: &Arc<Self>) {
        let inner = inner.clone();
        tokio::spawn(async move {
            inner.process_pending().await;
        });
    }

    /// Drain the pending queue while holding the execution lock.
    /// At most one batch is ever in `executing`.
    async fn process_pending(self: Arc<Self>) {
        let Ok(_guard) = self.execution_lock.try_lock() else {
            // An execution is already draining the queue.
            return;
        };

        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }

            let batch = {
                let mut batch_state = self.batch_state.lock().await;
                let Some(next) = Self::pop_highest_priority(&mut batch_state.pending) else {
                    return;
                };
                batch_state.executing = Some(next.batch_id);
                next
            };

            let batch_id = batch.batch_id;
            let outcome = self.process_batch(batch).await;

            let mut batch_state = self.batch_state.lock().await;
            batch_state.executing = None;
            match outcome {
                BatchStatus::Completed => batch_state.completed += 1,
                _ => batch_state.failed += 1,
            }
            drop(batch_state);
            info!(batch_id, status = ?outcome, "batch finished");
        }
    }

    /// Highest severity first; ties broken by batch id ascending.
    fn pop_highest_priority(pending: &mut Vec<RemediationBatch>) -> Option<RemediationBatch> {
        if pending.is_empty() {
            return None;
        }
        let mut best = 0;
        for (i, batch) in pending.iter().enumerate() {
            let (priority, id) = (batch.severity_priority(), batch.batch_id);
            let (best_priority, best_id) = (pending[best].severity_priority(), pending[best].batch_id);
            if priority > best_priority || (priority == best_priority && id < best_id) {
                best = i;
            }
        }
        Some(pending.remove(best))
    }

    async fn process_batch(&self, mut batch: RemediationBatch) -> BatchStatus {
        let batch_id = batch.batch_id;
        info!(
            batch_id,
            events = batch.len(),
            sources = batch.sources().len(),
            "starting coordinated remediation"
        );

        // Circuit breaker gate. While OPEN, pending batches drain as
        // failed with reason circuit-open.
        {
            let mut breaker = self.breaker.lock().await;
            if !breaker.can_attempt() {
                warn!(batch_id, "circuit open, refusing batch");
                return self
                    .finish_batch(batch, BatchStatus::Failed, Some("circuit-open".into()), None)
                    .await;
            }
        }

        // Plan, relaying streaming progress to a live message.
        let progress = self.planner.progress();
        let progress_notifier = self.notifier.clone();
        let progress_task = tokio::spawn(async move {
            let mut handle = String::new();
            loop {
                sleep(Duration::from_secs(5)).await;
                let snapshot = progress.read().await.clone();
                if snapshot.done {
                    break;
                }
                if snapshot.tokens_generated > 0 {
                    let tail: String = snapshot.last_snippet.chars().take(100).collect();
                    handle = progress_notifier
                        .update_live(
                            &handle,
                            &format!(
                                "planning: {} tokens in {}s\n{tail}",
                                snapshot.tokens_generated, snapshot.elapsed_seconds
                            ),
                        )
                        .await;
                }
            }
        });

        let planned = self.planner.plan(&batch, &[]).await;
        progress_task.abort();
        let plan = match planned {
            Ok(plan) => plan,
            Err(e) => {
                eprintln!("DEBUG PLANNING ERROR: {e}");
                error!(batch_id, error = %e, "planning failed");
                self.notify_failure(&batch, &format!("planning failed: {e}"), false)
                    .await;
                return self
                    .finish_batch(batch, BatchStatus::Failed, Some(e.to_string()), None)
                    .await;
            }
        };

        let threshold = self.config.auto_remediation.confidence_threshold;
        if plan.confidence < threshold {
            warn!(
                batch_id,
                confidence = plan.confidence,
                threshold,
                "plan confidence below threshold"
            );
            let reason = format!(
                "plan confidence {:.6} below threshold {threshold}",
                plan.confidence
            );
            self.notify_failure(&batch, &reason, false).await;
            return self
                .finish_batch(batch, BatchStatus::Failed, Some(reason), Some(&plan))
                .await;
        }

        // Approval. The flag starts conservative and is re-evaluated
        // against the impact assessment and plan confidence.
        let strategy = FixStrategy::from_plan(&plan);
        let mut requires_approval = false;
        let mut approval_reason = None;
        for event in &batch.events {
            let paths = event.details.affected_paths();
            let assessment = self
                .impact
                .analyze(
                    event.source,
                    &event.event_type,
                    if paths.is_empty() { None } else { Some(&paths) },
                    Some(&strategy),
                )
                .await;
            if assessment.requires_approval {
                requires_approval = true;
                approval_reason = assessment.approval_reason;
                break;
            }
        }

        if requires_approval {
            batch.status = BatchStatus::AwaitingApproval;
            let summary = format!(
                "Batch {batch_id}: {} event(s)\nReason: {}\n\n{}",
                batch.len(),
                approval_reason.as_deref().unwrap_or("policy"),
                plan.outline()
            );
            let timeout =
                Duration::from_secs(self.config.auto_remediation.approval_timeout_seconds);
            let decision = self.notifier.request_approval(&summary, timeout).await;
            if !decision.approved {
                warn!(batch_id, "plan rejected or approval timed out");
                return self
                    .finish_batch(
                        batch,
                        BatchStatus::Rejected,
                        Some("approval rejected or timed out".into()),
                        Some(&plan),
                    )
                    .await;
            }
            info!(
                batch_id,
                approver = decision.approver.as_deref().unwrap_or("unknown"),
                "plan approved"
            );
        }

        // Execute.
        batch.status = BatchStatus::Executing;
        let success = self.execute_plan(&mut batch, &plan).await;

        if success {
            self.notifier
                .send(
                    ChannelKind::Orchestrator,
                    &format!("batch {batch_id} completed: {}", plan.description),
                )
                .await;
            self.breaker.lock().await.record_success();
            self.finish_batch(batch, BatchStatus::Completed, None, Some(&plan))
                .await
        } else {
            let reason = batch
                .failure_reason
                .clone()
                .unwrap_or_else(|| "execution failed".into());
            self.record_breaker_failure().await;
            self.notify_failure(&batch, &reason, true).await;
            self.finish_batch(batch, BatchStatus::Failed, Some(reason), Some(&plan))
                .await
        }
    }

    /// Run every phase sequentially; within a phase, events are
    /// processed in input order grouped by source. Returns overall
    /// success; on failure the accumulated backups are restored in
    /// reverse and stopped services restarted.
    async fn execute_plan(&self, batch: &mut RemediationBatch, plan: &RemediationPlan) -> bool {
        let strategy = FixStrategy::from_plan(plan);
        let mut jobs: HashMap<String, RemediationJob> = batch
            .events
            .iter()
            .map(|event| {
                let mut job = RemediationJob::new(event.clone());
                job.max_attempts = self.config.auto_remediation.max_attempts;
                (event.event_id.clone(), job)
            })
            .collect();

        // Rollback context accumulated across phases.
        let mut all_backup_ids: Vec<String> = Vec::new();
        let mut stopped_services: Vec<String> = Vec::new();

        for (phase_index, phase) in plan.phases.iter().enumerate() {
            info!(
                batch_id = batch.batch_id,
                phase = phase_index + 1,
                total = plan.phases.len(),
                name = %phase.name,
                "executing phase"
            );

            for (source, events) in Self::group_by_source(&batch.events) {
                let Some(fixer) = self.fixers.get(&source) else {
                    warn!(source = %source, "no fixer registered, skipping");
                    continue;
                };

                // Orchestrator-level backup set, inferred from source.
                let inferred = self.infer_backup_sources(source);
                let backups = self.backup_manager.create_batch_backup(&inferred).await;
                all_backup_ids.extend(backups.values().map(|b| b.backup_id.clone()));

                match self
                    .fix_with_retries(fixer.as_ref(), &events, &strategy, &mut jobs)
                    .await
                {
                    Ok(outcome) => {
                        all_backup_ids.extend(outcome.backup_ids);
                    }
                    Err(reason) => {
                        batch.failure_reason = Some(reason);
                        self.rollback(&all_backup_ids, &stopped_services).await;
                        return false;
                    }
                }
            }

            if plan.requires_restart && phase_index + 1 == plan.phases.len() {
                // Final phase of a restart-requiring plan: bounce the
                // managed services in dependency order.
                let order = self.service_manager.known_services();
                let stopped = self.service_manager.stop_services_batch(&order, true).await;
                stopped_services.extend(stopped.clone());
                if self.service_manager.start_services_batch(&stopped).await.is_ok() {
                    stopped_services.clear();
                }
            }
        }

        true
    }

    /// Run one fixer with bounded retries; records every attempt in
    /// the jobs and the knowledge base. A plan is never mutated:
    /// retries re-plan a fresh strategy from the attempt history.
    async fn fix_with_retries(
        &self,
        fixer: &dyn Fixer,
        events: &[SecurityEvent],
        strategy: &FixStrategy,
        jobs: &mut HashMap<String, RemediationJob>,
    ) -> Result<crate::services::fixers::FixOutcome, String> {
        let max_attempts = self.config.auto_remediation.max_attempts;
        let signature = events
            .first()
            .map(SecurityEvent::signature)
            .unwrap_or_default();
        let mut current_strategy = strategy.clone();

        for attempt in 1..=max_attempts {
            let started = Instant::now();
            let result = fixer.fix(events, &current_strategy).await;
            let duration = started.elapsed().as_secs_f64();

            match result {
                Ok(outcome) => {
                    info!(attempt, message = %outcome.message, "fix succeeded");
                    self.record_attempts(
                        events,
                        jobs,
                        &current_strategy,
                        AttemptResult::Success,
                        None,
                        duration,
                        attempt,
                    )
                    .await;
                    return Ok(outcome);
                }
                Err(e) => {
                    let refusal = e.is_refusal();
                    warn!(attempt, max_attempts, error = %e, "fix attempt failed");
                    self.record_attempts(
                        events,
                        jobs,
                        &current_strategy,
                        AttemptResult::Failure,
                        Some(&e.to_string()),
                        duration,
                        attempt,
                    )
                    .await;

                    // Validation refusals need a different plan, not a
                    // retry of this one.
                    if refusal {
                        return Err(format!("refused unsafe operation: {e}"));
                    }
                    if attempt == max_attempts {
                        return Err(format!("all {max_attempts} attempts failed: {e}"));
                    }

                    let rate = self
                        .kb
                        .get_success_rate(Some(&signature), None, 30)
                        .await
                        .ok()
                        .filter(|stats| stats.total > 0)
                        .map(|stats| stats.success_rate);
                    let delay = adaptive_delay_seconds(attempt, rate);
                    info!(delay_secs = delay, "backing off before retry");
                    sleep(Duration::from_secs(delay)).await;

                    // Re-plan with the failure history in context.
                    if let Some(event) = events.first() {
                        let prior: Vec<PriorAttempt> = jobs
                            .get(&event.event_id)
                            .map(|job| {
                                job.attempt_history()
                                    .into_iter()
                                    .map(|(strategy, result, error)| PriorAttempt {
                                        strategy,
                                        result,
                                        error,
                                    })
                                    .collect()
                            })
                            .unwrap_or_default();
                        current_strategy = self.planner.strategy(event, &prior).await;
                    }
                }
            }
        }
        unreachable!("retry loop always returns")
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_attempts(
        &self,
        events: &[SecurityEvent],
        jobs: &mut HashMap<String, RemediationJob>,
        strategy: &FixStrategy,
        result: AttemptResult,
        error: Option<&str>,
        duration: f64,
        attempt: u32,
    ) {
        for event in events {
            if let Some(job) = jobs.get_mut(&event.event_id) {
                job.record_attempt(RemediationAttempt {
                    attempt_number: 0,
                    timestamp: Utc::now(),
                    strategy: strategy.description.clone(),
                    result,
                    error_message: error.map(ToString::to_string),
                    duration_seconds: duration,
                    ai_confidence: strategy.confidence,
                });
            }

            let recorded = self
                .kb
                .record_fix(
                    event,
                    &strategy.description,
                    strategy.confidence,
                    result,
                    error,
                    duration,
                    attempt - 1,
                )
                .await;
            match recorded {
                Ok(fix_id) => {
                    if result == AttemptResult::Success {
                        self.record_vulnerability(event, fix_id).await;
                    }
                }
                Err(e) => warn!(error = %e, "failed to record fix in knowledge base"),
            }
        }
    }

    async fn record_vulnerability(&self, event: &SecurityEvent, fix_id: Option<i64>) {
        if let EventDetails::Vulnerability {
            cve_id,
            package,
            installed_version,
            fixed_version,
            ..
        } = &event.details
        {
            let _ = self
                .kb
                .record_vulnerability(
                    event.source.as_str(),
                    cve_id,
                    event.severity.as_str(),
                    package,
                    installed_version,
                    fixed_version.as_deref(),
                    fix_id,
                )
                .await;
        }
    }

    /// Restore accumulated backups in reverse insertion order, then
    /// restart any services stopped for this batch.
    async fn rollback(&self, backup_ids: &[String], stopped_services: &[String]) {
        warn!(
            backups = backup_ids.len(),
            services = stopped_services.len(),
            "rolling back batch"
        );
        if !self.backup_manager.rollback_batch(backup_ids).await {
            error!("rollback left some targets unrestored");
        }
        if !stopped_services.is_empty() {
            let restarted = self
                .service_manager
                .start_services_batch(stopped_services)
                .await;
            if restarted.is_err() {
                error!("failed to restart services stopped during batch");
            }
        }
    }

    /// Sources the orchestrator snapshots before fixers run,
    /// inferred from the event source.
    fn infer_backup_sources(&self, source: EventSource) -> Vec<String> {
        match source {
            EventSource::HostIps => vec!["/etc/fail2ban/jail.local".to_string()],
            EventSource::NetworkIps => vec!["/etc/ufw/user.rules".to_string()],
            EventSource::VulnerabilityScan => self
                .config
                .projects
                .values()
                .map(|project| project.path.clone())
                .filter(|path| !path.is_empty() && std::path::Path::new(path).is_dir())
                .collect(),
            // Integrity restores snapshot their exact targets inside
            // the fixer.
            EventSource::FileIntegrity => Vec::new(),
        }
    }

    /// Group preserving first-occurrence order of sources and input
    /// order of events within each group.
    fn group_by_source(events: &[SecurityEvent]) -> Vec<(EventSource, Vec<SecurityEvent>)> {
        let mut groups: Vec<(EventSource, Vec<SecurityEvent>)> = Vec::new();
        for event in events {
            if let Some(group) = groups.iter_mut().find(|(source, _)| *source == event.source) {
                group.1.push(event.clone());
            } else {
                groups.push((event.source, vec![event.clone()]));
            }
        }
        groups
    }

    async fn record_breaker_failure(&self) {
        let mut breaker = self.breaker.lock().await;
        let was_open = breaker.state() == crate::services::circuit_breaker::CircuitState::Open;
        breaker.record_failure();
        let now_open = breaker.state() == crate::services::circuit_breaker::CircuitState::Open;
        drop(breaker);
        // One notification per transition, not per refused batch.
        if now_open && !was_open {
            self.notifier
                .send(
                    ChannelKind::Critical,
                    "circuit breaker open: auto-remediation paused after sustained failures",
                )
                .await;
        }
    }

    /// Escalation policy by approval mode.
    async fn notify_failure(&self, batch: &RemediationBatch, reason: &str, verification: bool) {
        let message = format!("batch {} failed: {reason}", batch.batch_id);
        match self.config.auto_remediation.approval_mode {
            ApprovalMode::Paranoid => {
                self.notifier.send(ChannelKind::Alerts, &message).await;
            }
            ApprovalMode::Balanced => {
                if verification || reason.contains("refused") {
                    self.notifier.send(ChannelKind::Alerts, &message).await;
                }
            }
            ApprovalMode::Aggressive => {
                let critical = batch.severity_priority() == Severity::Critical.priority();
                if verification && critical {
                    self.notifier.send(ChannelKind::Alerts, &message).await;
                }
            }
        }
    }

    async fn finish_batch(
        &self,
        mut batch: RemediationBatch,
        status: BatchStatus,
        reason: Option<String>,
        plan: Option<&RemediationPlan>,
    ) -> BatchStatus {
        batch.status = status;
        batch.failure_reason = reason;
        if let Err(e) = self.state.archive_batch(&batch, plan) {
            warn!(error = %e, "failed to archive batch");
        }
        status
    }
}

/// Build the standard fixer set keyed by source.
pub fn standard_fixers(
    config: &Config,
    executor: Arc<crate::services::executor::CommandExecutor>,
    backup_manager: Arc<BackupManager>,
) -> HashMap<EventSource, Arc<dyn Fixer>> {
    use crate::services::fixers::{HostIpsFixer, IntegrityFixer, NetworkFixer, VulnerabilityFixer};

    let mut fixers: HashMap<EventSource, Arc<dyn Fixer>> = HashMap::new();
    fixers.insert(
        EventSource::VulnerabilityScan,
        Arc::new(VulnerabilityFixer::new(
            executor.clone(),
            backup_manager.clone(),
            config.projects.values().map(|p| p.path.clone()).collect(),
            config.sources.rescan_command.clone(),
        )),
    );
    fixers.insert(
        EventSource::NetworkIps,
        Arc::new(NetworkFixer::new(
            executor.clone(),
            backup_manager.clone(),
            config.executor.ip_whitelist.clone(),
        )),
    );
    fixers.insert(
        EventSource::HostIps,
        Arc::new(HostIpsFixer::new(executor.clone(), backup_manager.clone())),
    );
    fixers.insert(
        EventSource::FileIntegrity,
        Arc::new(IntegrityFixer::new(
            executor,
            backup_manager,
            config.sources.critical_paths.clone(),
            config.sources.quarantine_dir.clone(),
            config.sources.baseline_update_command.clone(),
        )),
    );
    fixers
}
