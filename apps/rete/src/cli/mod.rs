//! # Rete CLI Module
//!
//! ## Available Commands
//!
//! - `run` - Ingest a program and print the actions it fired
//! - `check` - Build a program's rules and print the resulting network
//! - `hash` - Print the canonical form and sharing hash of a condition
//! - `serve` - Start the monitoring HTTP server

mod commands;

use crate::config::Config;
use clap::{Parser, Subcommand};
use rete_core::ReteError;
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Rete - forward-chaining rule engine
///
/// Compiles rules into a RETE network and matches facts against it
/// incrementally.
#[derive(Parser, Debug)]
#[command(name = "rete")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ingest a program and print the actions it fired
    Run {
        /// Path to the program (parser JSON output)
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Build a program's types and rules without submitting facts
    Check {
        /// Path to the program (parser JSON output)
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Print the canonical form and sharing hash of a condition
    Hash {
        /// Condition as JSON
        #[arg(long)]
        condition: String,
    },

    /// Start the monitoring HTTP server
    Serve {
        /// Program to ingest before serving
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Host to bind to (overrides the config file)
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli, mut config: Config) -> Result<(), ReteError> {
    let json_mode = cli.json_mode;

    match cli.command {
        Commands::Run { file } => cmd_run(&config, json_mode, &file),
        Commands::Check { file } => cmd_check(&config, json_mode, &file),
        Commands::Hash { condition } => cmd_hash(json_mode, &condition),
        Commands::Serve { file, host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            cmd_serve(&config, file.as_deref()).await
        }
    }
}
