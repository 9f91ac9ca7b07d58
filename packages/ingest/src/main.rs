#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for the weather dataset loader.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use weather_load_cli_utils::{IndicatifProgress, LogProgress, MultiProgress};
use weather_load_database::{Database, SessionOptions, schema};
use weather_load_ingest::{
    AdmissionGate, DEFAULT_BATCH_SIZE, IngestOptions, ingest_all, ingest_conditions,
    ingest_locations,
};
use weather_load_ingest_models::{
    Dataset, FailurePolicy, IngestReport, ProgressCallback, TimestampMode,
};

#[derive(Parser)]
#[command(name = "weather_load", about = "Bulk loader for the weather datasets")]
struct Cli {
    /// Database file (defaults to `DATABASE_PATH`, then `data/weather.duckdb`).
    /// Use `:memory:` for a throwaway in-memory database.
    #[arg(long, global = true)]
    database: Option<PathBuf>,
    /// Worker threads `DuckDB` may use.
    #[arg(long, global = true)]
    threads: Option<u32>,
    /// `DuckDB` memory limit (e.g. "4GB").
    #[arg(long, global = true)]
    memory_limit: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the locations file, then the conditions file
    Load(IngestArgs),
    /// Load only the locations file
    Locations(IngestArgs),
    /// Load only the conditions file
    Conditions(IngestArgs),
    /// Create the `locations` and `conditions` tables if they are missing
    Init,
}

#[derive(Args)]
struct IngestArgs {
    /// Records per batch.
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,
    /// Directory holding the default dataset files.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Locations file (overrides `--data-dir`).
    #[arg(long)]
    locations_file: Option<PathBuf>,
    /// Conditions file (overrides `--data-dir`).
    #[arg(long)]
    conditions_file: Option<PathBuf>,
    /// Parse the first conditions field as a timestamp instead of storing
    /// the epoch.
    #[arg(long)]
    parse_timestamps: bool,
    /// Keep going when concurrently inserted batches fail, and report them
    /// at the end.
    #[arg(long)]
    keep_going: bool,
    /// Log one line per progress sample instead of drawing progress bars.
    #[arg(long)]
    log_progress: bool,
}

impl IngestArgs {
    fn options(&self) -> IngestOptions {
        let data_dir = self
            .data_dir
            .clone()
            .unwrap_or_else(weather_load_database::paths::data_dir);

        let mut options = IngestOptions::new(&data_dir, self.batch_size);
        if let Some(path) = &self.locations_file {
            options.locations_path.clone_from(path);
        }
        if let Some(path) = &self.conditions_file {
            options.conditions_path.clone_from(path);
        }
        if self.parse_timestamps {
            options.timestamp_mode = TimestampMode::Parse;
        }
        if self.keep_going {
            options.failure_policy = FailurePolicy::Report;
        }
        options
    }

    fn progress(&self, multi: &MultiProgress) -> Arc<dyn ProgressCallback> {
        if self.log_progress {
            LogProgress::shared()
        } else {
            IndicatifProgress::new(multi)
        }
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted; cancelling outstanding inserts");
            token.cancel();
        }
    });
    cancel
}

fn log_failures(report: &IngestReport) {
    for failure in &report.failures {
        log::warn!(
            "{}: batch {} ({} records) was not loaded: {}",
            report.dataset,
            failure.batch,
            failure.rows,
            failure.message
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = weather_load_cli_utils::init_logger();
    let cli = Cli::parse();

    let session = SessionOptions {
        threads: cli.threads,
        memory_limit: cli.memory_limit,
        ..SessionOptions::default()
    };
    let db = match &cli.database {
        Some(path) => Database::open(path, &session)?,
        None => Database::open_from_env(&session)?,
    };

    let start = Instant::now();

    match cli.command {
        Commands::Init => {
            schema::create_tables(&db.connect()?)?;
            log::info!("Tables ready.");
        }
        Commands::Load(args) => {
            let options = args.options();
            let cancel = cancel_on_ctrl_c();

            let summary = ingest_all(&db, &options, &args.progress(&multi), &cancel).await?;
            log_failures(&summary.locations);
            log_failures(&summary.conditions);

            log::info!(
                "Load complete: {} locations, {} conditions in {:.1}s",
                summary.locations.rows_inserted,
                summary.conditions.rows_inserted,
                start.elapsed().as_secs_f64()
            );
        }
        Commands::Locations(args) => {
            let report = run_single(&db, Dataset::Locations, &args, &multi).await?;
            log_failures(&report);
        }
        Commands::Conditions(args) => {
            let report = run_single(&db, Dataset::Conditions, &args, &multi).await?;
            log_failures(&report);
        }
    }

    Ok(())
}

async fn run_single(
    db: &Database,
    dataset: Dataset,
    args: &IngestArgs,
    multi: &MultiProgress,
) -> Result<IngestReport, weather_load_ingest::IngestError> {
    let options = args.options();
    let gate = AdmissionGate::default();
    let progress = args.progress(multi);
    let cancel = cancel_on_ctrl_c();
    let path = options.path(dataset).to_path_buf();

    let report = match dataset {
        Dataset::Locations => {
            ingest_locations(db, &path, &gate, &options, &progress, &cancel).await?
        }
        Dataset::Conditions => {
            ingest_conditions(db, &path, &gate, &options, &progress, &cancel).await?
        }
    };

    log::info!(
        "{dataset} complete: {} rows in {:.1}s (peak {} concurrent insert(s))",
        report.rows_inserted,
        report.elapsed.as_secs_f64(),
        gate.peak()
    );

    Ok(report)
}
