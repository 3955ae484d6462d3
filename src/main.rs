//! # branch_sync entry point
//!
//! Loads configuration, prepares the warehouse schema and dispatches the
//! requested command. Exit status is non-zero only when a command cannot run.

use std::process::ExitCode;

use anyhow::Context;
use branch_sync::cli::{Cli, dispatch};
use branch_sync::config::ConfigLoader;
use branch_sync::db::init_pool;
use branch_sync::migration::{Migrator, MigratorTrait};
use branch_sync::telemetry::init_tracing;
use clap::Parser;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = ConfigLoader::new()
        .load()
        .context("failed to load configuration")?;
    init_tracing(&config)?;

    if let Ok(redacted) = config.redacted_json() {
        tracing::debug!(profile = %config.profile, config = %redacted, "Loaded configuration");
    }

    let db = init_pool(&config).await?;
    Migrator::up(&db, None)
        .await
        .context("failed to apply migrations")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing the current unit");
            on_signal.cancel();
        }
    });

    dispatch(cli.command, &config, db, cancel).await
}
