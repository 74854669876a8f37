//! # Rete - Rule Engine Binary
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                apps/rete (THE BINARY)                │
//! │                                                      │
//! │   ┌─────────────┐   ┌──────────────┐   ┌──────────┐  │
//! │   │    CLI      │   │  HTTP API    │   │  Config  │  │
//! │   │   (clap)    │   │   (axum)     │   │  (toml)  │  │
//! │   └──────┬──────┘   └──────┬───────┘   └────┬─────┘  │
//! │          └─────────────────┼────────────────┘        │
//! │                            ▼                         │
//! │                    ┌───────────────┐                 │
//! │                    │   rete-core   │                 │
//! │                    │ (THE ENGINE)  │                 │
//! │                    └───────────────┘                 │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! rete run -f program.json
//! rete check -f program.json --json-mode
//! rete hash --condition '{"type":"comparison", ...}'
//! rete serve -f program.json --port 8080
//! ```

use clap::Parser;
use rete::cli;
use rete::config::{Config, LogFormat};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    init_tracing(config.logging.format, cli.verbose);

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli, config).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `--verbose`.
fn init_tracing(format: LogFormat, verbose: bool) {
    let default_filter = if verbose {
        "rete=debug,rete_core=debug,tower_http=debug"
    } else {
        "rete=info,rete_core=info,tower_http=debug"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn print_banner() {
    println!(
        r#"
  ██████╗ ███████╗████████╗███████╗
  ██╔══██╗██╔════╝╚══██╔══╝██╔════╝
  ██████╔╝█████╗     ██║   █████╗
  ██╔══██╗██╔══╝     ██║   ██╔══╝
  ██║  ██║███████╗   ██║   ███████╗
  ╚═╝  ╚═╝╚══════╝   ╚═╝   ╚══════╝

  Forward-Chaining Rule Engine v{}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
