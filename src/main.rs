//! Ember - CLI entrypoint.
//!
//! Usage:
//!   ember config validate --config config/ember.toml
//!   ember version
//!
//! The serving path lives behind the protocol layer and is not part of this
//! binary; the CLI covers offline administration.

use anyhow::Result;
use clap::{Parser, Subcommand};
use ember::config::Config;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ember", version, about = "In-memory data server core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration tooling.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Print the version and exit.
    Version,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Parse and validate a configuration file.
    Validate {
        /// Path to the TOML configuration file.
        #[arg(long, default_value = "config/ember.toml")]
        config: PathBuf,
    },
}

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Validate { config } => {
                let parsed = Config::from_file(&config)?;
                println!(
                    "{}: OK (hz={}, databases={})",
                    config.display(),
                    parsed.server.hz,
                    parsed.server.databases
                );
                Ok(())
            }
        },
        Commands::Version => {
            println!("ember {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
