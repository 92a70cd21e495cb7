use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str =
    "calsync=info,calsync_sync=info,calsync_storage=info,calsync_sources=info";

#[derive(Debug, Parser)]
#[command(name = "calsync")]
#[command(about = "Sync CAL-ACCESS extracts into the warehouse and migrate legacy columns")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Coerce, validate and append today's extracts.
    Sync {
        /// Stop after validation; nothing is uploaded and no sidecars are written.
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply a column migration plan.
    Migrate {
        #[arg(long)]
        plan: Option<PathBuf>,
    },
    /// Print a proposed migration plan for a table's date-like text columns.
    Analyze {
        #[arg(long)]
        table: String,
    },
    /// Run sync on the configured cron schedule until interrupted.
    Schedule,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed command line");

    match cli.command.unwrap_or(Commands::Sync { dry_run: false }) {
        Commands::Sync { dry_run } => {
            let summary = calsync_sync::run_sync_once_from_env(dry_run).await?;
            println!(
                "sync complete: run_id={} uploaded={} skipped={} failed={} rows={} reports={}",
                summary.run_id,
                summary.uploaded(),
                summary.skipped(),
                summary.failed(),
                summary.rows_written(),
                summary
                    .reports_dir
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            );
            for failure in &summary.table_failures {
                eprintln!("table {} not synced: {}", failure.table, failure.error);
            }
        }
        Commands::Migrate { plan } => {
            let summary = calsync_sync::run_migrations_from_env(plan).await?;
            println!(
                "migration complete: run_id={} succeeded={} failed={}",
                summary.run_id,
                summary.succeeded(),
                summary.failed()
            );
            for result in summary.results.iter().filter(|r| !r.ok) {
                eprintln!(
                    "{}.{} -> {}: {}",
                    result.table,
                    result.source_column,
                    result.derived_column,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Commands::Analyze { table } => {
            let plan = calsync_sync::analyze_from_env(&table).await?;
            print!("{}", plan.to_yaml()?);
        }
        Commands::Schedule => {
            calsync_sync::run_scheduler_from_env().await?;
        }
    }

    Ok(())
}
