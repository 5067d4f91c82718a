//! `vigil start` - run the pipeline.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{build_app, App};
use crate::domain::models::Config;
use crate::domain::ports::ChannelKind;
use crate::services::health_monitor::HealthMonitor;
use crate::services::push_ingestor::PushIngestor;
use crate::services::watcher::{EventWatcher, SeenEventCache};

/// Channel layout bootstrapped at startup.
fn channel_layout() -> Vec<ChannelKind> {
    vec![
        ChannelKind::BotStatus,
        ChannelKind::Critical,
        ChannelKind::Alerts,
        ChannelKind::Approvals,
        ChannelKind::CodeFixes,
        ChannelKind::DeploymentLog,
        ChannelKind::Orchestrator,
        ChannelKind::Stats,
    ]
}

pub async fn handle_start(config: Config) -> anyhow::Result<()> {
    let app = build_app(config, false).await?;
    app.notifier.ensure_channels(&channel_layout()).await;

    if app.kb.is_degraded() {
        app.notifier
            .send(
                ChannelKind::Critical,
                "knowledge base unavailable: running degraded, learning disabled",
            )
            .await;
    }

    // Watcher -> orchestrator channel.
    let (events_tx, events_rx) = mpsc::channel(256);
    let (cache, quarantined) = SeenEventCache::load(app.state.clone());
    if quarantined {
        app.notifier
            .send(
                ChannelKind::Critical,
                "seen-event cache was corrupted and has been quarantined; starting fresh",
            )
            .await;
    }

    let watcher = EventWatcher::new(&app.config, app.adapters.clone(), cache.clone(), events_tx);
    watcher.start();
    app.orchestrator.start(events_rx);

    let monitor = Arc::new(HealthMonitor::new(
        &app.config,
        app.notifier.clone(),
        app.executor.clone(),
        app.kb.clone(),
        app.state.clone(),
    ));
    monitor.start();

    let ingestor = start_ingestor(&app).await;

    info!("vigil pipeline running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    watcher.stop();
    monitor.stop();
    if let Some(ingestor) = &ingestor {
        ingestor.stop();
    }
    // Finish the current phase, persist pending batches.
    app.orchestrator.shutdown().await;
    cache.flush().await;

    app.notifier
        .send(ChannelKind::BotStatus, "vigil stopped cleanly")
        .await;
    Ok(())
}

async fn start_ingestor(app: &App) -> Option<Arc<PushIngestor>> {
    let github = &app.config.github;
    if github.webhook_secret.is_empty() && github.repositories.is_empty() {
        info!("webhook and repository polling not configured");
        return None;
    }

    let ingestor = Arc::new(PushIngestor::new(
        github.clone(),
        app.planner.clone(),
        app.kb.clone(),
        app.notifier.clone(),
        app.state.clone(),
    ));
    ingestor.start_polling();
    ingestor.set_ready(true);

    if !github.webhook_secret.is_empty() {
        let state = crate::infrastructure::http::WebhookState {
            secret: github.webhook_secret.clone(),
            ingestor: ingestor.clone(),
        };
        let port = github.webhook_port;
        tokio::spawn(async move {
            if let Err(e) = crate::infrastructure::http::serve(state, port).await {
                warn!(error = %e, "webhook server exited");
            }
        });
    }

    Some(ingestor)
}
