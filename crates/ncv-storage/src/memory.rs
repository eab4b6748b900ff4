use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::NaiveDate;
use ncv_core::{
    CountyEntry, ElectionKey, ElectionResultRow, LoadWindow, RawElectionRow, RawVoterRecord,
    RegistrationAggregateRow, RegistrationKey, SnapshotKind,
};
use tracing::debug;
use uuid::Uuid;

use crate::migrate::{MigrationStep, SchemaCatalog};
use crate::{
    check_election_rows, check_registration_rows, diff_window, index_rows, StoreError, UpsertOutcome,
    WarehouseStore, WindowWriter,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct SchemaState {
    catalog: SchemaCatalog,
    version: u32,
}

#[derive(Debug, Default)]
struct Inner {
    schema: Mutex<SchemaState>,
    counties: Mutex<BTreeMap<String, CountyEntry>>,
    raw_voters: Mutex<Vec<RawVoterRecord>>,
    raw_elections: Mutex<Vec<RawElectionRow>>,
    next_seq: AtomicI64,
    registration: Mutex<BTreeMap<RegistrationKey, i64>>,
    elections: Mutex<BTreeMap<ElectionKey, i64>>,
    claims: Mutex<HashSet<LoadWindow>>,
}

/// In-process warehouse with the same table semantics as the Postgres store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn require_table(&self, schema: &str, table: &str) -> Result<(), StoreError> {
        if lock(&self.inner.schema).catalog.has_table(schema, table) {
            Ok(())
        } else {
            Err(StoreError::MissingTable(format!("{schema}.{table}")))
        }
    }

    pub fn raw_voter_count(&self) -> usize {
        lock(&self.inner.raw_voters).len()
    }

    pub fn raw_election_count(&self) -> usize {
        lock(&self.inner.raw_elections).len()
    }

    pub fn counties(&self) -> Vec<CountyEntry> {
        lock(&self.inner.counties).values().cloned().collect()
    }

    fn next_seq(&self) -> i64 {
        self.inner.next_seq.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl WarehouseStore for MemoryStore {
    async fn schema_version(&self) -> Result<u32, StoreError> {
        Ok(lock(&self.inner.schema).version)
    }

    async fn apply_migration(&self, step: &MigrationStep) -> Result<(), StoreError> {
        let mut state = lock(&self.inner.schema);
        let mut catalog = state.catalog.clone();
        for op in &step.ops {
            let changed = catalog.apply(step.version, op)?;
            debug!(version = step.version, changed, "applied {:?}", op);
        }
        state.catalog = catalog;
        state.version = state.version.max(step.version);
        Ok(())
    }

    async fn upsert_counties(&self, entries: &[CountyEntry]) -> Result<u64, StoreError> {
        self.require_table("public", "counties")?;
        let mut counties = lock(&self.inner.counties);
        for entry in entries {
            counties.insert(entry.fips_code.clone(), entry.clone());
        }
        Ok(entries.len() as u64)
    }

    async fn append_raw_voters(&self, rows: &[RawVoterRecord]) -> Result<u64, StoreError> {
        self.require_table("raw", "raw_voters")?;
        let mut table = lock(&self.inner.raw_voters);
        for row in rows {
            let mut row = row.clone();
            row.seq = self.next_seq();
            table.push(row);
        }
        Ok(rows.len() as u64)
    }

    async fn raw_voters_for_load(
        &self,
        snapshot_date: NaiveDate,
        load_id: Uuid,
    ) -> Result<Vec<RawVoterRecord>, StoreError> {
        self.require_table("raw", "raw_voters")?;
        Ok(lock(&self.inner.raw_voters)
            .iter()
            .filter(|r| r.snapshot_date == snapshot_date && r.load_id == load_id)
            .cloned()
            .collect())
    }

    async fn append_raw_election_rows(&self, rows: &[RawElectionRow]) -> Result<u64, StoreError> {
        self.require_table("raw", "raw_election_results")?;
        let mut table = lock(&self.inner.raw_elections);
        for row in rows {
            let mut row = row.clone();
            row.seq = self.next_seq();
            table.push(row);
        }
        Ok(rows.len() as u64)
    }

    async fn claim_window(&self, window: LoadWindow) -> Result<Box<dyn WindowWriter>, StoreError> {
        match window.kind {
            SnapshotKind::Registration => self.require_table("registration", "voter_registration")?,
            SnapshotKind::Election => self.require_table("elections", "election_results")?,
        }
        if !lock(&self.inner.claims).insert(window) {
            return Err(StoreError::ConcurrentLoad { window });
        }
        Ok(Box::new(MemoryWindowWriter {
            store: self.clone(),
            window,
            staged: None,
        }))
    }

    async fn registration_rows(
        &self,
        registration_date: NaiveDate,
    ) -> Result<Vec<RegistrationAggregateRow>, StoreError> {
        self.require_table("registration", "voter_registration")?;
        Ok(lock(&self.inner.registration)
            .iter()
            .filter(|(k, _)| k.registration_date == registration_date)
            .map(|(key, total)| RegistrationAggregateRow {
                key: key.clone(),
                total: *total,
            })
            .collect())
    }

    async fn election_rows(
        &self,
        election_date: NaiveDate,
    ) -> Result<Vec<ElectionResultRow>, StoreError> {
        self.require_table("elections", "election_results")?;
        Ok(lock(&self.inner.elections)
            .iter()
            .filter(|(k, _)| k.election_date == election_date)
            .map(|(key, votes)| ElectionResultRow {
                key: key.clone(),
                votes: *votes,
            })
            .collect())
    }
}

enum Staged {
    Registration(BTreeMap<RegistrationKey, i64>),
    Election(BTreeMap<ElectionKey, i64>),
}

struct MemoryWindowWriter {
    store: MemoryStore,
    window: LoadWindow,
    staged: Option<Staged>,
}

#[async_trait]
impl WindowWriter for MemoryWindowWriter {
    async fn publish_registration(
        &mut self,
        rows: &[RegistrationAggregateRow],
    ) -> Result<UpsertOutcome, StoreError> {
        check_registration_rows(self.window, rows)?;
        let incoming = index_rows(self.window, rows.iter().map(|r| (r.key.clone(), r.total)))?;
        let existing = lock(&self.store.inner.registration)
            .iter()
            .filter(|(k, _)| k.registration_date == self.window.date)
            .map(|(k, v)| (k.clone(), *v))
            .collect::<BTreeMap<_, _>>();
        let diff = diff_window(&existing, &incoming);
        self.staged = Some(Staged::Registration(incoming));
        Ok(diff.outcome)
    }

    async fn publish_election(
        &mut self,
        rows: &[ElectionResultRow],
    ) -> Result<UpsertOutcome, StoreError> {
        check_election_rows(self.window, rows)?;
        let incoming = index_rows(self.window, rows.iter().map(|r| (r.key.clone(), r.votes)))?;
        let existing = lock(&self.store.inner.elections)
            .iter()
            .filter(|(k, _)| k.election_date == self.window.date)
            .map(|(k, v)| (k.clone(), *v))
            .collect::<BTreeMap<_, _>>();
        let diff = diff_window(&existing, &incoming);
        self.staged = Some(Staged::Election(incoming));
        Ok(diff.outcome)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let date = self.window.date;
        match self.staged.take() {
            Some(Staged::Registration(rows)) => {
                let mut table = lock(&self.store.inner.registration);
                table.retain(|k, _| k.registration_date != date);
                table.extend(rows);
            }
            Some(Staged::Election(rows)) => {
                let mut table = lock(&self.store.inner.elections);
                table.retain(|k, _| k.election_date != date);
                table.extend(rows);
            }
            None => {}
        }
        Ok(())
    }
}

impl Drop for MemoryWindowWriter {
    fn drop(&mut self) {
        lock(&self.store.inner.claims).remove(&self.window);
    }
}
