//! Vigil CLI entry point.

use clap::Parser;
use std::process::ExitCode;

use vigil::cli::commands::{replay, start, status};
use vigil::cli::{Cli, Commands};
use vigil::domain::errors::StateError;
use vigil::infrastructure::config::ConfigLoader;
use vigil::infrastructure::logging;

/// Exit code for configuration errors.
const EXIT_CONFIG: u8 = 2;
/// Exit code for persistent-store corruption.
const EXIT_STORE: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let _log_guard = logging::init(&config.logging);

    let result = match cli.command {
        Commands::Start => start::handle_start(config).await,
        Commands::Status => status::handle_status(config, cli.json).await,
        Commands::Replay { batch_id } => replay::handle_replay(config, batch_id).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            if e.downcast_ref::<StateError>().is_some() {
                return ExitCode::from(EXIT_STORE);
            }
            ExitCode::FAILURE
        }
    }
}
