//! `vigil replay <batch_id>` - re-run an archived batch plan with
//! every command in dry-run mode.

use tracing::info;

use super::build_app;
use crate::domain::models::Config;

pub async fn handle_replay(config: Config, batch_id: u64) -> anyhow::Result<()> {
    // Replay always runs dry: commands are logged, never executed.
    let app = build_app(config, true).await?;

    info!(batch_id, "replaying archived batch (dry-run)");
    match app.orchestrator.execute_archived(batch_id).await {
        Ok(true) => {
            println!("batch {batch_id}: replay completed");
            Ok(())
        }
        Ok(false) => {
            println!("batch {batch_id}: replay reported failure (see logs)");
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!("replay failed: {e}")),
    }
}
