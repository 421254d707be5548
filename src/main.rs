//! Overlord CLI entry point.

use anyhow::{Context, Result};
use clap::Parser;

use overlord::cli::commands::{run, swarm};
use overlord::cli::{Cli, Commands, ConfigCommands};
use overlord::infrastructure::config::ConfigLoader;
use overlord::infrastructure::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load().context("failed to load configuration")?,
    };
    let _log_guard = logging::init(&config.log).context("failed to initialize logging")?;

    match cli.command {
        Commands::Run { prompt, max_iterations, model } => {
            // Concrete coding tools are registered by embedders; the
            // bare CLI runs tool-less chat sessions.
            run::handle_run(&config, Vec::new(), prompt, max_iterations, model).await
        }
        Commands::Swarm { task, context } => {
            swarm::handle_swarm(&config, Vec::new(), task, context).await
        }
        Commands::Config { command: ConfigCommands::Show } => {
            let yaml = serde_yaml::to_string(&config).context("failed to render configuration")?;
            print!("{yaml}");
            Ok(())
        }
    }
}
