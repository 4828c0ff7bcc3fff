use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "qbank-cli")]
#[command(about = "Company interview question bank: ingest, enrich and replicate")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply schema migrations to the primary (and replica, if configured)
    Migrate,
    /// Merge company snapshot CSVs into the primary store
    Ingest {
        /// Snapshot root; overrides SNAPSHOT_ROOT
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Refresh problem topic tags from the tag service
    Enrich,
    /// Mirror the primary store into the replica
    Replicate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("QBANK_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    tracing::debug!(command = ?cli.command, "starting");

    match cli.command {
        Commands::Migrate => {
            qbank_sync::migrate_from_env().await?;
            println!("migrate complete");
        }
        Commands::Ingest { root } => {
            let summary = qbank_sync::run_ingest_from_env(root.as_deref()).await?;
            println!(
                "ingest complete: run_id={} companies={} failed={} problems={} rows_failed={}",
                summary.run_id,
                summary.companies,
                summary.companies_failed,
                summary.problems_written,
                summary.rows_failed
            );
        }
        Commands::Enrich => {
            let summary = qbank_sync::run_enrichment_from_env().await?;
            println!(
                "enrich complete: considered={} updated={} unresolved={} no_slug={} failed_batches={} failed_writes={}",
                summary.considered,
                summary.updated,
                summary.unresolved,
                summary.skipped_no_slug,
                summary.failed_batches,
                summary.failed_writes
            );
        }
        Commands::Replicate => {
            let summary = qbank_sync::run_replication_from_env().await?;
            let tables = summary
                .tables
                .iter()
                .map(|t| format!("{}={}", t.table, t.upserted))
                .collect::<Vec<_>>()
                .join(" ");
            println!("replicate complete: {tables}");
        }
    }

    Ok(())
}
