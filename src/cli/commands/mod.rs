//! Command handlers and component wiring.

pub mod replay;
pub mod start;
pub mod status;

use std::sync::Arc;
use std::time::Duration;

use crate::adapters::sources::{HostIpsAdapter, IntegrityAdapter, NetThreatAdapter, ScannerAdapter};
use crate::adapters::sqlite::KnowledgeBase;
use crate::domain::models::Config;
use crate::domain::ports::{Notifier, SourceAdapter};
use crate::infrastructure::ai::{build_providers, RequestGate, RetryPolicy};
use crate::infrastructure::notify::LogNotifier;
use crate::infrastructure::state::StateStore;
use crate::services::backup::BackupManager;
use crate::services::executor::CommandExecutor;
use crate::services::impact::ImpactAnalyzer;
use crate::services::orchestrator::{standard_fixers, Orchestrator};
use crate::services::planner::Planner;
use crate::services::service_manager::ServiceManager;

/// Wired pipeline components.
pub struct App {
    pub config: Config,
    pub state: StateStore,
    pub kb: Arc<KnowledgeBase>,
    pub notifier: Arc<dyn Notifier>,
    pub executor: Arc<CommandExecutor>,
    pub backup_manager: Arc<BackupManager>,
    pub planner: Arc<Planner>,
    pub orchestrator: Arc<Orchestrator>,
    pub adapters: Vec<Arc<dyn SourceAdapter>>,
    pub service_manager: Arc<ServiceManager>,
}

/// Construct every component once and inject it; no singletons.
pub async fn build_app(config: Config, dry_run: bool) -> anyhow::Result<App> {
    let dry_run = dry_run || config.auto_remediation.dry_run;

    let state = StateStore::new(&config.state_dir)?;
    let kb = Arc::new(KnowledgeBase::open(&config.knowledge_base.path).await);
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier::new(config.notifier.auto_approve));
    let executor = Arc::new(CommandExecutor::new(config.executor.clone(), dry_run));
    let backup_manager = Arc::new(BackupManager::new(
        config.backup.clone(),
        executor.clone(),
        dry_run,
    )?);

    let planner = Arc::new(Planner::new(
        build_providers(&config.ai),
        RequestGate::new(Duration::from_millis(config.ai.request_spacing_ms)),
        RetryPolicy::default(),
        config.ai.temperature,
    ));

    let impact = Arc::new(ImpactAnalyzer::new(&config, Some(executor.clone())));
    let service_manager = Arc::new(ServiceManager::new(
        config.services.clone(),
        executor.clone(),
    ));
    let fixers = standard_fixers(&config, executor.clone(), backup_manager.clone());

    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        planner.clone(),
        notifier.clone(),
        kb.clone(),
        backup_manager.clone(),
        impact,
        service_manager.clone(),
        fixers,
        state.clone(),
    ));

    let adapters = build_adapters(&config);

    Ok(App {
        config,
        state,
        kb,
        notifier,
        executor,
        backup_manager,
        planner,
        orchestrator,
        adapters,
        service_manager,
    })
}

fn build_adapters(config: &Config) -> Vec<Arc<dyn SourceAdapter>> {
    let sources = &config.sources;
    let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
        Arc::new(ScannerAdapter::new(&sources.scan_report_path)),
        Arc::new(IntegrityAdapter::new(
            &sources.integrity_report_path,
            sources.critical_paths.clone(),
        )),
        Arc::new(NetThreatAdapter::new(&sources.threat_decisions_command)),
        Arc::new(HostIpsAdapter::new(
            &sources.jail_status_command,
            sources.jails.clone(),
        )),
    ];
    adapters
}
