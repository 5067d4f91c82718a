//! Command-line interface definitions.

pub mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "vigil",
    about = "Autonomous security-operations controller",
    version
)]
pub struct Cli {
    /// Path to a config file (defaults to .vigil/config.yaml +
    /// .vigil/local.yaml + VIGIL_* environment).
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Emit machine-readable JSON where applicable.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the remediation pipeline.
    Start,
    /// Print orchestrator state and knowledge-base summary.
    Status,
    /// Re-run an archived batch plan in dry-run mode.
    Replay {
        /// Batch id from a previous run.
        batch_id: u64,
    },
}
