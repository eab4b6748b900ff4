use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use ncv_core::CountyReference;
use ncv_etl::{migrate_store, report_markdown, seed_counties, EtlConfig, EtlError, EtlPipeline, RunReport};
use ncv_ingest::manifest::{REGISTRATION_FILE_TYPE, RESULTS_FILE_TYPE};
use ncv_ingest::resolve_latest;
use ncv_storage::{PgStore, WarehouseStore};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Exit status when another run holds the load window; the scheduler retries later.
const EXIT_WINDOW_BUSY: u8 = 75;

#[derive(Debug, Parser)]
#[command(name = "ncv-cli")]
#[command(about = "NC voter registration and election results ETL")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Bring the warehouse schema up to the latest version.
    Migrate,
    /// Upsert the county reference table from the counties file.
    SeedCounties,
    /// Load a registration snapshot and publish its window.
    LoadRegistration {
        /// Snapshot file; defaults to the newest registration file in the manifest.
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long)]
        snapshot_date: NaiveDate,
    },
    /// Load a precinct results file and publish its election window.
    LoadElection {
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long)]
        election_date: NaiveDate,
    },
    /// Print a digest of the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("NCV_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn connect(config: &EtlConfig) -> Result<Arc<dyn WarehouseStore>> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to the warehouse")?;
    Ok(Arc::new(store))
}

fn load_reference(config: &EtlConfig) -> Result<Arc<CountyReference>> {
    let reference = CountyReference::load(&config.counties_path)
        .with_context(|| format!("loading {}", config.counties_path.display()))?;
    Ok(Arc::new(reference))
}

fn resolve_file(config: &EtlConfig, file: Option<PathBuf>, file_type: &str) -> Result<PathBuf> {
    match file {
        Some(file) => Ok(file),
        None => {
            let path = resolve_latest(&config.manifest_path, file_type)?;
            info!(file = %path.display(), file_type, "resolved input from manifest");
            Ok(path)
        }
    }
}

async fn build_pipeline(config: EtlConfig) -> Result<EtlPipeline> {
    let store = connect(&config).await?;
    let reference = load_reference(&config)?;
    let pipeline = EtlPipeline::new(config, store, reference)?;

    let cancel = pipeline.cancellation_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; the run stops before publishing");
            cancel.store(true, Ordering::SeqCst);
        }
    });
    Ok(pipeline)
}

fn finish_run(result: Result<RunReport, EtlError>) -> Result<ExitCode> {
    match result {
        Ok(report) => {
            println!(
                "load complete: run_id={} window={} read={} errors={} upserted={} zeroed={} reports={}",
                report.run_id,
                report.window,
                report.records_read,
                report.record_errors_total(),
                report.keys_upserted,
                report.keys_zeroed,
                report.reports_dir.as_deref().unwrap_or("-")
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(err) if err.is_concurrent_load() => {
            error!("{err}");
            Ok(ExitCode::from(EXIT_WINDOW_BUSY))
        }
        Err(err) => Err(err.into()),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_logging();
    let cli = Cli::parse();
    let config = EtlConfig::from_env();

    match cli.command {
        Commands::Migrate => {
            let store = connect(&config).await?;
            let report = migrate_store(store.as_ref()).await?;
            println!(
                "migrate complete: from={} to={} applied={}",
                report.from_version,
                report.to_version,
                report.applied.len()
            );
        }
        Commands::SeedCounties => {
            let store = connect(&config).await?;
            let reference = load_reference(&config)?;
            let written = seed_counties(store.as_ref(), &reference).await?;
            println!("seed complete: counties={written}");
        }
        Commands::LoadRegistration {
            file,
            snapshot_date,
        } => {
            let file = resolve_file(&config, file, REGISTRATION_FILE_TYPE)?;
            let pipeline = build_pipeline(config).await?;
            return finish_run(pipeline.run_registration(&file, snapshot_date).await);
        }
        Commands::LoadElection {
            file,
            election_date,
        } => {
            let file = resolve_file(&config, file, RESULTS_FILE_TYPE)?;
            let pipeline = build_pipeline(config).await?;
            return finish_run(pipeline.run_election(&file, election_date).await);
        }
        Commands::Report { runs } => {
            println!("{}", report_markdown(runs, &config.reports_dir)?);
        }
    }

    Ok(ExitCode::SUCCESS)
}
