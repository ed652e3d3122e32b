//! studysync CLI - inspect and drive the offline sync engine
//!
//! Documents are written to the local replica and queued; `sync` drains the
//! queue and reconciles with the configured backend.

mod cli;
mod commands;
mod config_profiles;
mod error;
#[cfg(test)]
mod tests;

use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::common::{resolve_db_path, resolve_profile, Workspace};
use crate::commands::completions::run_completions;
use crate::commands::config::run_config;
use crate::commands::doc::run_doc;
use crate::commands::queue::run_queue;
use crate::commands::sources::run_sources;
use crate::commands::sync::run_sync_command;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "studysync=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let profile_name = cli.profile.as_deref();

    match cli.command {
        Commands::Completions { shell, output } => run_completions(shell, output.as_deref()),
        Commands::Config { command } => run_config(command, profile_name),
        command => {
            let db_path = resolve_db_path(cli.db_path);
            let profile = resolve_profile(profile_name)?;
            tracing::debug!(profile = %profile.name, db = %db_path.display(), "opening workspace");
            let workspace = Workspace::open(&db_path, profile).await?;
            match command {
                Commands::Doc { command } => run_doc(command, &workspace).await,
                Commands::Queue { command } => run_queue(command, &workspace).await,
                Commands::Sync { source, command } => {
                    run_sync_command(source, command, &workspace).await
                }
                Commands::Sources { json } => run_sources(&workspace, json).await,
                Commands::Completions { .. } | Commands::Config { .. } => Ok(()),
            }
        }
    }
}
