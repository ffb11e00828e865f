//! # rtsync
//!
//! CLI tool for exercising the rtsync engine.
//!
//! ## Commands
//!
//! - `simulate`: Run the engine against the mock transport and print its status
//! - `show-config`: Print the effective configuration as TOML
//!
//! ## Example
//!
//! ```bash
//! # Print defaults
//! rtsync show-config
//!
//! # Ten remote events, then an optimistic write the server rejects
//! rtsync simulate --events 10 --reject
//!
//! # Survive two failed connection attempts first
//! RUST_LOG=debug rtsync --config rtsync.toml simulate --fail-opens 2
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use sync_client::EngineConfig;

mod commands;

use commands::{show_config, simulate};

/// Config file picked up from the working directory when `--config` is absent.
const DEFAULT_CONFIG_FILE: &str = "rtsync.toml";

/// CLI tool for exercising the rtsync engine.
#[derive(Parser, Debug)]
#[command(name = "rtsync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Engine configuration file (default: ./rtsync.toml if present)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine against the mock transport
    Simulate {
        /// Topic to subscribe to
        #[arg(long, default_value = "orders")]
        topic: String,

        /// Remote change events to emit
        #[arg(long, default_value = "5")]
        events: u32,

        /// Connection attempts that fail before the channel comes up
        #[arg(long, default_value = "0")]
        fail_opens: u32,

        /// Have the server reject the optimistic write
        #[arg(long)]
        reject: bool,
    },

    /// Print the effective configuration as TOML
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Simulate {
            topic,
            events,
            fail_opens,
            reject,
        } => {
            let options = simulate::SimulateOptions {
                topic,
                events,
                fail_opens,
                reject,
            };
            simulate::run(config, options).await?;
        }
        Commands::ShowConfig => {
            show_config::run(&config)?;
        }
    }

    Ok(())
}

/// Load the engine configuration.
///
/// An explicit path must exist; the default file is optional.
fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => {
            let default = Path::new(DEFAULT_CONFIG_FILE);
            if default.exists() {
                EngineConfig::from_file(default).context("Failed to load ./rtsync.toml")
            } else {
                Ok(EngineConfig::default())
            }
        }
    }
}
