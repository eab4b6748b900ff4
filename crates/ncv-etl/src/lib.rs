//! NC votes ETL orchestration: normalize, deduplicate, aggregate and publish one
//! load window per run, then write the run report and Parquet snapshot.

use ncv_core::{CountyReference, ReferenceError};
use ncv_ingest::LoadError;
use ncv_storage::{MigrationReport, Migrator, StoreError, WarehouseStore};
use thiserror::Error;
use tracing::info;

pub mod aggregate;
pub mod config;
pub mod dedup;
pub mod export;
pub mod normalize;
pub mod pipeline;
pub mod report;

pub use aggregate::{
    aggregate_election, aggregate_registration, parse_votes, ElectionAggregation,
    RegistrationAggregation,
};
pub use config::{parse_status_list, EtlConfig};
pub use dedup::{deduplicate, DedupOutcome};
pub use export::{export_election_snapshot, export_registration_snapshot, ParquetManifest};
pub use normalize::Normalizer;
pub use pipeline::EtlPipeline;
pub use report::{report_markdown, write_run_report, RunReport, RunStatus};

pub const CRATE_NAME: &str = "ncv-etl";

/// Failures that abort a run. Per-record problems never surface here; they are
/// counted in the [`RunReport`].
#[derive(Debug, Error)]
pub enum EtlError {
    #[error("store schema is at version {found}, this build expects {expected}; run migrations first")]
    SchemaOutOfDate { found: u32, expected: u32 },
    #[error("run cancelled after {records_read} records; nothing was published")]
    Cancelled { records_read: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Reference(#[from] ReferenceError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EtlError {
    pub fn is_concurrent_load(&self) -> bool {
        matches!(self, EtlError::Store(StoreError::ConcurrentLoad { .. }))
    }
}

pub async fn migrate_store(store: &dyn WarehouseStore) -> Result<MigrationReport, EtlError> {
    let migrator = Migrator::standard()?;
    Ok(migrator.migrate(store).await?)
}

/// Upserts every county of `reference` into the county reference table.
pub async fn seed_counties(
    store: &dyn WarehouseStore,
    reference: &CountyReference,
) -> Result<u64, EtlError> {
    let written = store.upsert_counties(reference.entries()).await?;
    info!(counties = written, "county reference seeded");
    Ok(written)
}
