use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use eod_ingest::config::{parse_date, split_symbols, Settings};
use eod_ingest::error::IngestError;
use eod_ingest::pipeline::ingestion::MarketstackClient;
use eod_ingest::pipeline::storage::{InMemoryStore, PriceStore, SqliteStore};
use eod_ingest::pipeline::{CancelFlag, Pipeline, RunReport, RunState};
use eod_ingest::{logging, metrics};

#[derive(Parser)]
#[command(name = "eod_ingest")]
#[command(about = "End-of-day market price ingestion (transform and load)")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file (default: ./eod_ingest.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, canonicalize, dedupe and upsert one date window
    Run {
        /// Symbols to fetch (comma-separated), e.g. AAPL,MSFT
        #[arg(long)]
        symbols: Option<String>,
        /// First trading day to fetch (YYYY-MM-DD)
        #[arg(long)]
        from: Option<String>,
        /// Last trading day to fetch (YYYY-MM-DD, default: today)
        #[arg(long)]
        to: Option<String>,
        /// Records per upsert batch
        #[arg(long)]
        batch_size: Option<i64>,
        /// Batches loaded concurrently
        #[arg(long)]
        workers: Option<i64>,
        /// Stop at the first failed batch
        #[arg(long)]
        fail_fast: bool,
        /// Load into an in-memory store instead of the database
        #[arg(long)]
        dry_run: bool,
    },
    /// Create the destination table if it does not exist
    InitDb,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let _log_guard = logging::init_logging();
    metrics::init_metrics();

    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?.apply_env()?;

    match cli.command {
        Commands::InitDb => {
            let storage = settings.storage_config()?;
            let store = SqliteStore::open(&storage.path, &storage.table)
                .with_context(|| format!("opening {}", storage.path.display()))?;
            store.ensure_schema().await.context("creating schema")?;
            info!("Table '{}' ready in {}", storage.table, storage.path.display());
            println!("✅ Table '{}' ready in {}", storage.table, storage.path.display());
        }
        Commands::Run {
            symbols,
            from,
            to,
            batch_size,
            workers,
            fail_fast,
            dry_run,
        } => {
            if let Some(list) = symbols {
                settings.run.symbols = Some(split_symbols(&list));
            }
            if let Some(from) = from {
                settings.run.date_from = Some(parse_date("--from", &from)?);
            }
            if let Some(to) = to {
                settings.run.date_to = Some(parse_date("--to", &to)?);
            }
            if batch_size.is_some() {
                settings.run.batch_size = batch_size;
            }
            if workers.is_some() {
                settings.run.load_workers = workers;
            }
            if fail_fast {
                settings.run.fail_fast = Some(true);
            }

            let config = settings.validate()?;
            let fetcher = Arc::new(MarketstackClient::new(&config.provider)?);
            let store: Arc<dyn PriceStore> = if dry_run {
                info!("Dry run: loading into an in-memory store");
                Arc::new(InMemoryStore::new())
            } else {
                Arc::new(
                    SqliteStore::open(&config.storage.path, &config.storage.table)
                        .with_context(|| format!("opening {}", config.storage.path.display()))?,
                )
            };

            let pipeline = Pipeline::new(config.run, fetcher, store)?;
            let cancel = CancelFlag::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, stopping at the next batch boundary");
                    on_interrupt.cancel();
                }
            });

            let report = match pipeline.run(&cancel).await {
                Ok(report) => report,
                Err(e) => {
                    error!("Run failed: {}", e);
                    return Err(e.into());
                }
            };
            print_summary(&report);
            println!("{}", serde_json::to_string_pretty(&report)?);

            if report.state != RunState::Done {
                anyhow::bail!("run {} ended in state {:?}", report.run_id, report.state);
            }
        }
    }
    Ok(())
}

fn print_summary(report: &RunReport) {
    eprintln!("\n📊 Run {}:", report.run_id);
    eprintln!("   Raw records: {}", report.raw_records);
    eprintln!("   Rejected: {}", report.rejected);
    eprintln!("   Duplicates collapsed: {}", report.deduplicated);
    eprintln!(
        "   Batches: {}/{} committed, {} failed",
        report.batches_succeeded, report.batches_total, report.batches_failed
    );
    eprintln!("   Rows written: {}", report.rows_written);

    if !report.rejections.is_empty() {
        eprintln!("\n⚠️  Rejected records:");
        for rejection in &report.rejections {
            eprintln!("   - {}", IngestError::from(rejection.clone()));
        }
    }

    if !report.batch_failures.is_empty() {
        eprintln!("\n⚠️  Failed batches:");
        for failure in &report.batch_failures {
            eprintln!("   - #{} ({} records): {}", failure.index, failure.records, failure.message);
        }
    }
}
