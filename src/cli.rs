//! Command-line definitions and command handlers.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::presets::UTF8_FULL;
use comfy_table::{ContentArrangement, Table};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::db::health_check;
use crate::ledger::{BatchStatus, ProgressLedger};
use crate::orchestrator::{BatchOptions, BatchResult, Orchestrator};
use crate::policy::PolicyRegistry;
use crate::sources::SourceRegistry;

#[derive(Parser, Debug)]
#[command(name = "branch_sync")]
#[command(about = "Replicates branch ERP databases into the central warehouse", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a sync batch, or resume one
    Run {
        /// Only sync these connections (repeatable)
        #[arg(long = "connection", short)]
        connections: Vec<String>,

        /// Comma-separated entity subset (ex: "orders,order_lines")
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,

        /// Skip the canonical single-source phase
        #[arg(long, default_value = "false")]
        skip_phase1: bool,

        /// Resume the batch with this identifier
        #[arg(long)]
        resume: Option<String>,
    },

    /// Show the summary of a batch
    Status {
        batch_id: String,

        /// Include per-unit details
        #[arg(long)]
        details: bool,
    },

    /// List recent batches
    Batches {
        #[arg(long, default_value = "20")]
        limit: u64,
    },

    /// Ping the warehouse and every configured source
    Check,
}

impl Commands {
    fn batch_options(&self) -> Option<BatchOptions> {
        match self {
            Commands::Run {
                connections,
                tables,
                skip_phase1,
                resume,
            } => Some(BatchOptions {
                connections: connections.clone(),
                entities: tables
                    .iter()
                    .map(|table| table.trim().to_string())
                    .filter(|table| !table.is_empty())
                    .collect(),
                skip_phase1: *skip_phase1,
                resume: resume.clone(),
            }),
            _ => None,
        }
    }
}

/// Execute a parsed command against an initialized warehouse connection.
pub async fn dispatch(
    command: Commands,
    config: &AppConfig,
    db: DatabaseConnection,
    cancel: CancellationToken,
) -> Result<()> {
    let options = command.batch_options();
    match command {
        Commands::Run { .. } => {
            let options = options.unwrap_or_default();
            let sources = SourceRegistry::from_config(config)?;
            let orchestrator =
                Orchestrator::new(db, sources, PolicyRegistry::builtin(), config.sync.clone());
            let result = orchestrator
                .run_batch(options, &cancel)
                .await
                .context("sync batch could not start")?;
            print_result(&result);
            Ok(())
        }
        Commands::Status { batch_id, details } => {
            let ledger = ProgressLedger::new(db);
            print_status(&ledger, &batch_id, details).await
        }
        Commands::Batches { limit } => {
            let ledger = ProgressLedger::new(db);
            print_batches(&ledger, limit).await
        }
        Commands::Check => check(config, &db).await,
    }
}

fn table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn print_result(result: &BatchResult) {
    let batch = &result.batch;
    match result.status {
        BatchStatus::Interrupted => println!(
            "Batch {} interrupted. Resume with: branch_sync run --resume {}",
            batch.id, batch.id
        ),
        _ => println!("Batch {} {}", batch.id, batch.status),
    }
    println!(
        "  units: {} total, {} completed, {} failed, {} degraded",
        batch.total_tables, batch.completed_tables, batch.failed_tables, batch.degraded_tables
    );
    if let Some(ms) = batch.duration_ms {
        println!("  duration: {} ms", ms);
    }
    for (entity, deleted) in &result.pruned {
        println!("  pruned {}: {} rows", entity, deleted);
    }

    if !result.manual_intervention.is_empty() {
        println!("Units requiring manual intervention:");
        let mut failures = table();
        failures.set_header(vec!["connection", "entity", "error"]);
        for failure in &result.manual_intervention {
            failures.add_row(vec![
                failure.connection.clone(),
                failure.entity.clone(),
                failure.error.clone(),
            ]);
        }
        println!("{failures}");
    }
}

async fn print_status(ledger: &ProgressLedger, batch_id: &str, details: bool) -> Result<()> {
    let summary = ledger.summary(batch_id).await?;
    let batch = &summary.batch;

    println!("Batch {} ({})", batch.id, batch.status);
    println!("  started:   {}", batch.started_at);
    if let Some(completed_at) = batch.completed_at {
        println!("  finished:  {}", completed_at);
    }
    println!(
        "  units:     {} total, {} completed, {} failed, {} skipped, {} pending, {} in progress",
        batch.total_tables,
        batch.completed_tables,
        batch.failed_tables,
        summary.skipped,
        summary.pending,
        summary.in_progress
    );
    println!(
        "  records:   {} processed, {} skipped",
        summary.records_processed, summary.records_skipped
    );
    if batch.degraded_tables > 0 {
        println!(
            "  warning:   {} unit(s) wrote without upsert; changed rows may be stale",
            batch.degraded_tables
        );
    }

    if details {
        let mut units = table();
        units.set_header(vec![
            "connection",
            "entity",
            "status",
            "processed",
            "skipped",
            "degraded",
            "retries",
            "duration ms",
            "error",
        ]);
        for unit in ledger.unit_details(batch_id).await? {
            units.add_row(vec![
                unit.connection,
                unit.entity,
                unit.status,
                unit.records_processed.to_string(),
                unit.records_skipped.to_string(),
                if unit.write_degraded { "yes" } else { "" }.to_string(),
                unit.retry_count.to_string(),
                unit.duration_ms.map(|ms| ms.to_string()).unwrap_or_default(),
                unit.error.unwrap_or_default(),
            ]);
        }
        println!("{units}");
    }

    Ok(())
}

async fn print_batches(ledger: &ProgressLedger, limit: u64) -> Result<()> {
    let batches = ledger.list_batches(limit).await?;
    if batches.is_empty() {
        println!("No batches recorded");
        return Ok(());
    }

    let mut listing = table();
    listing.set_header(vec![
        "batch", "status", "started", "total", "completed", "failed", "degraded",
    ]);
    for batch in batches {
        listing.add_row(vec![
            batch.id,
            batch.status,
            batch.started_at.to_rfc3339(),
            batch.total_tables.to_string(),
            batch.completed_tables.to_string(),
            batch.failed_tables.to_string(),
            batch.degraded_tables.to_string(),
        ]);
    }
    println!("{listing}");
    Ok(())
}

async fn check(config: &AppConfig, db: &DatabaseConnection) -> Result<()> {
    health_check(db).await?;
    println!("warehouse: ok");

    let sources = SourceRegistry::from_config(config)?;
    let mut unreachable = 0;
    for name in sources.names() {
        match sources.get(name)?.ping().await {
            Ok(()) => {
                info!(connection = %name, "Source reachable");
                println!("{}: ok", name);
            }
            Err(err) => {
                error!(connection = %name, error = %err, "Source unreachable");
                println!("{}: FAILED ({})", name, err);
                unreachable += 1;
            }
        }
    }

    if unreachable > 0 {
        anyhow::bail!("{} source(s) unreachable", unreachable);
    }
    Ok(())
}
