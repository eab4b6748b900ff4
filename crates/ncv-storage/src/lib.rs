//! Warehouse storage for the NC votes ETL: raw staging tables, reporting tables,
//! the county reference table and the schema migrator.
//!
//! Two backends implement [`WarehouseStore`]: [`PgStore`] (Postgres via sqlx) and
//! [`MemoryStore`], which models the same tables in process for tests and dry runs.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use ncv_core::{
    CountyEntry, ElectionResultRow, LoadWindow, RawElectionRow, RawVoterRecord,
    RegistrationAggregateRow,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

mod memory;
pub mod migrate;
mod postgres;

pub use memory::MemoryStore;
pub use migrate::{MigrationReport, MigrationStep, Migrator, SchemaCatalog, SchemaOp};
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "ncv-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("another run already owns load window {window}")]
    ConcurrentLoad { window: LoadWindow },
    #[error("migration {version} out of order: {detail}")]
    MigrationOrder { version: u32, detail: String },
    #[error("table {0} does not exist; run migrations first")]
    MissingTable(String),
    #[error("rows do not belong to load window {window}: {detail}")]
    WindowMismatch { window: LoadWindow, detail: String },
    #[error("decoding stored value: {0}")]
    Decode(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Result of publishing one load window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    /// Keys stored for the window before this publish but absent from it; removed.
    pub zeroed: u64,
}

impl UpsertOutcome {
    pub fn upserted(&self) -> u64 {
        self.inserted + self.updated + self.unchanged
    }
}

pub(crate) struct WindowDiff<K> {
    pub outcome: UpsertOutcome,
    pub stale: Vec<K>,
}

pub(crate) fn diff_window<K: Ord + Clone>(
    existing: &BTreeMap<K, i64>,
    incoming: &BTreeMap<K, i64>,
) -> WindowDiff<K> {
    let mut outcome = UpsertOutcome::default();
    for (key, value) in incoming {
        match existing.get(key) {
            None => outcome.inserted += 1,
            Some(old) if old == value => outcome.unchanged += 1,
            Some(_) => outcome.updated += 1,
        }
    }
    let stale = existing
        .keys()
        .filter(|k| !incoming.contains_key(*k))
        .cloned()
        .collect::<Vec<_>>();
    outcome.zeroed = stale.len() as u64;
    WindowDiff { outcome, stale }
}

/// Indexes published rows by key; a key may appear once per publish.
pub(crate) fn index_rows<K: Ord + Clone + std::fmt::Debug>(
    window: LoadWindow,
    rows: impl Iterator<Item = (K, i64)>,
) -> Result<BTreeMap<K, i64>, StoreError> {
    let mut map = BTreeMap::new();
    for (key, value) in rows {
        if map.insert(key.clone(), value).is_some() {
            return Err(StoreError::WindowMismatch {
                window,
                detail: format!("duplicate key {key:?}"),
            });
        }
    }
    Ok(map)
}

/// Store operations the pipeline needs. Raw tables are append-only; reporting tables
/// are only written through a claimed [`WindowWriter`].
#[async_trait]
pub trait WarehouseStore: Send + Sync {
    /// Highest applied migration version, 0 for an empty store.
    async fn schema_version(&self) -> Result<u32, StoreError>;

    /// Applies every operation of `step` and records its version atomically.
    async fn apply_migration(&self, step: &MigrationStep) -> Result<(), StoreError>;

    async fn upsert_counties(&self, entries: &[CountyEntry]) -> Result<u64, StoreError>;

    async fn append_raw_voters(&self, rows: &[RawVoterRecord]) -> Result<u64, StoreError>;

    /// Raw voter rows appended by load `load_id` for `snapshot_date`, in insertion
    /// order, with `seq` populated. Rows from earlier loads of the same date stay in
    /// the audit trail but are never returned here.
    async fn raw_voters_for_load(
        &self,
        snapshot_date: NaiveDate,
        load_id: Uuid,
    ) -> Result<Vec<RawVoterRecord>, StoreError>;

    async fn append_raw_election_rows(&self, rows: &[RawElectionRow]) -> Result<u64, StoreError>;

    /// Claims exclusive write access to a load window. Fails fast with
    /// [`StoreError::ConcurrentLoad`] when another run holds it. Dropping the writer
    /// without committing discards everything published through it.
    async fn claim_window(&self, window: LoadWindow) -> Result<Box<dyn WindowWriter>, StoreError>;

    async fn registration_rows(
        &self,
        registration_date: NaiveDate,
    ) -> Result<Vec<RegistrationAggregateRow>, StoreError>;

    async fn election_rows(
        &self,
        election_date: NaiveDate,
    ) -> Result<Vec<ElectionResultRow>, StoreError>;
}

#[async_trait]
pub trait WindowWriter: Send {
    /// Replaces the registration window with `rows`: inserts new keys, overwrites
    /// existing ones, removes keys no longer present.
    async fn publish_registration(
        &mut self,
        rows: &[RegistrationAggregateRow],
    ) -> Result<UpsertOutcome, StoreError>;

    async fn publish_election(
        &mut self,
        rows: &[ElectionResultRow],
    ) -> Result<UpsertOutcome, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

pub(crate) fn check_registration_rows(
    window: LoadWindow,
    rows: &[RegistrationAggregateRow],
) -> Result<(), StoreError> {
    if window.kind != ncv_core::SnapshotKind::Registration {
        return Err(StoreError::WindowMismatch {
            window,
            detail: "registration rows published into a non-registration window".into(),
        });
    }
    if let Some(row) = rows.iter().find(|r| r.key.registration_date != window.date) {
        return Err(StoreError::WindowMismatch {
            window,
            detail: format!("row dated {}", row.key.registration_date),
        });
    }
    Ok(())
}

pub(crate) fn check_election_rows(
    window: LoadWindow,
    rows: &[ElectionResultRow],
) -> Result<(), StoreError> {
    if window.kind != ncv_core::SnapshotKind::Election {
        return Err(StoreError::WindowMismatch {
            window,
            detail: "election rows published into a non-election window".into(),
        });
    }
    if let Some(row) = rows.iter().find(|r| r.key.election_date != window.date) {
        return Err(StoreError::WindowMismatch {
            window,
            detail: format!("row dated {}", row.key.election_date),
        });
    }
    Ok(())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Streams a file through SHA-256; snapshot files are too large to hash in memory.
pub async fn sha256_file(path: impl AsRef<Path>) -> anyhow::Result<String> {
    let path = path.as_ref();
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Stable advisory-lock key for a load window, identical across processes.
pub fn window_lock_key(window: LoadWindow) -> i64 {
    let digest = Sha256::digest(format!("ncv:{}:{}", window.kind, window.date).as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}
