use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod backup;
mod commands;
mod config;
mod coordinator;
mod error;
mod hash;
mod health;
mod mount;
mod runner;
mod sandbox;
mod session;
mod shutdown;
mod store;
mod templates;
mod timer;

use config::Config;

#[derive(Parser)]
#[command(name = "sandvault")]
#[command(
    author,
    version,
    about = "Per-project sandboxes that are backed up before they die"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Also write logs to this file
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Config file (default: ./sandvault.toml)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter sandvault.toml in the current directory
    Init {
        /// Force overwrite existing files
        #[arg(short, long)]
        force: bool,
    },

    /// Run the coordinator, taking JSON-lines requests on stdin
    Serve {
        /// Sandbox provider: docker or local (overrides SANDVAULT_PROVIDER)
        #[arg(long)]
        provider: Option<String>,
    },

    /// List projects with a backup on record
    Status,

    /// Permanently delete a project's backup
    Purge {
        user_id: String,
        project_id: String,
    },

    /// Print the change fingerprint of a directory
    Hash {
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
}

fn init_logging(cli: &Cli) -> Result<Option<WorkerGuard>> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if cli.verbose {
                EnvFilter::new("sandvault=debug")
            } else {
                EnvFilter::new("sandvault=info")
            }
        })
    };

    // stdout carries `serve` responses, so logs always go to stderr
    let stderr_layer = if cli.log_json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(filter())
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(filter())
            .boxed()
    };

    let (file_layer, guard) = match &cli.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(filter())
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli)?;

    let load_config = || match &cli.config {
        Some(path) => Config::load_from(path),
        None => {
            let cwd = std::env::current_dir().context("Failed to get current directory")?;
            Config::load(&cwd)
        }
    };

    match &cli.command {
        Commands::Init { force } => {
            commands::init::run(*force)?;
        }
        Commands::Serve { provider } => {
            commands::serve::run(&load_config()?, provider.as_deref()).await?;
        }
        Commands::Status => {
            commands::status::run(&load_config()?).await?;
        }
        Commands::Purge {
            user_id,
            project_id,
        } => {
            commands::purge::run(&load_config()?, user_id, project_id).await?;
        }
        Commands::Hash { dir } => {
            commands::hash::run(&load_config()?, dir).await?;
        }
    }

    Ok(())
}
