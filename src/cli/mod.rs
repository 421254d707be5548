//! Command-line interface.

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// LLM coding-agent runtime with policy-gated execution and swarm
/// orchestration.
#[derive(Parser, Debug)]
#[command(name = "overlord", version, about)]
pub struct Cli {
    /// Load configuration from a specific file instead of `.overlord/`.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a single-agent session on a prompt.
    Run {
        /// The task prompt.
        prompt: String,
        /// Override the configured iteration ceiling.
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Model override.
        #[arg(long)]
        model: Option<String>,
    },
    /// Decompose a task and run it as a worker swarm.
    Swarm {
        /// The root task description.
        task: String,
        /// Extra context handed to the decomposer.
        #[arg(long, default_value = "")]
        context: String,
    },
    /// Configuration utilities.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective merged configuration as YAML.
    Show,
}
