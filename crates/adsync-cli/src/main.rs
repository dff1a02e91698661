use std::path::PathBuf;

use adsync_normalize::{Flattener, NormalizationRules};
use adsync_sync::{load_saved_page, SyncConfig};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "adsync")]
#[command(about = "Sync advertising insights reports into a SQL destination")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, flatten and write every enabled report for the configured window.
    Sync {
        /// Run only the named report; repeatable.
        #[arg(long = "report")]
        reports: Vec<String>,
        /// Write into an in-memory destination and print the run summary.
        #[arg(long)]
        dry_run: bool,
    },
    /// Add the known-column preset to every enabled report table.
    SyncSchema,
    /// Flatten a saved insights page and print one JSON object per row.
    Flatten { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Sync {
        reports: Vec::new(),
        dry_run: false,
    });

    match command {
        Commands::Sync { reports, dry_run } => {
            let summary = adsync_sync::run_sync_once_from_env(&reports, dry_run).await?;
            if dry_run {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            for report in &summary.reports {
                println!(
                    "{}: table={} rows={} partial={} written={} skipped={:?}",
                    report.report,
                    report.table,
                    report.rows,
                    report.partial,
                    report.write.map(|w| w.inserted).unwrap_or(0),
                    report.skipped
                );
            }
            let failed = summary.failed_tables();
            if !failed.is_empty() {
                error!(run_id = %summary.run_id, ?failed, "destination writes failed");
                anyhow::bail!("sync run {} failed for tables: {}", summary.run_id, failed.join(", "));
            }
            info!(run_id = %summary.run_id, "sync complete");
        }
        Commands::SyncSchema => {
            let reports = adsync_sync::run_sync_schema_from_env().await?;
            for report in &reports {
                if !report.table_existed {
                    println!("{}: missing, skipped", report.table);
                    continue;
                }
                println!(
                    "{}: added={} failed={}",
                    report.table,
                    report.added.len(),
                    report.failed.len()
                );
            }
        }
        Commands::Flatten { path } => {
            let config = SyncConfig::from_env()?;
            let rules = NormalizationRules::from_workspace_root(&config.workspace_root)
                .context("loading normalization rules")?;
            let flattener = Flattener::new(rules);
            for raw in load_saved_page(&path)? {
                println!("{}", serde_json::to_string(&flattener.flatten(&raw))?);
            }
        }
    }

    Ok(())
}
