use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use ncv_core::{
    CanonicalElectionRow, CountyReference, ElectionResultRow, LoadWindow, RegistrationAggregateRow,
    SnapshotKind,
};
use ncv_ingest::{ElectionParser, RegistrationParser, SnapshotReader};
use ncv_storage::{sha256_file, Migrator, WarehouseStore};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregate::{aggregate_election, aggregate_registration, parse_votes};
use crate::config::EtlConfig;
use crate::dedup::deduplicate;
use crate::export::{export_election_snapshot, export_registration_snapshot};
use crate::normalize::Normalizer;
use crate::report::{write_run_report, RunReport, RunStatus};
use crate::EtlError;

enum Published {
    Registration(Vec<RegistrationAggregateRow>),
    Election(Vec<ElectionResultRow>),
}

/// Runs one snapshot file through load, normalize, dedup, aggregate and publish.
pub struct EtlPipeline {
    config: EtlConfig,
    store: Arc<dyn WarehouseStore>,
    reference: Arc<CountyReference>,
    migrator: Migrator,
    cancel: Arc<AtomicBool>,
}

impl EtlPipeline {
    pub fn new(
        config: EtlConfig,
        store: Arc<dyn WarehouseStore>,
        reference: Arc<CountyReference>,
    ) -> Result<Self, EtlError> {
        Ok(Self {
            config,
            store,
            reference,
            migrator: Migrator::standard()?,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Shares an externally owned stop flag, checked between record batches.
    pub fn with_cancellation(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub async fn run_registration(
        &self,
        file: &Path,
        snapshot_date: NaiveDate,
    ) -> Result<RunReport, EtlError> {
        self.execute(LoadWindow::registration(snapshot_date), file)
            .await
    }

    pub async fn run_election(
        &self,
        file: &Path,
        election_date: NaiveDate,
    ) -> Result<RunReport, EtlError> {
        self.execute(LoadWindow::election(election_date), file).await
    }

    async fn execute(&self, window: LoadWindow, file: &Path) -> Result<RunReport, EtlError> {
        let run_id = Uuid::new_v4();
        let mut report = RunReport::start(run_id, window, file.display().to_string());
        let span = info_span!("etl_run", %run_id, kind = %window.kind, date = %window.date);

        let result = match window.kind {
            SnapshotKind::Registration => {
                self.registration_stages(&mut report, file)
                    .instrument(span.clone())
                    .await
            }
            SnapshotKind::Election => {
                self.election_stages(&mut report, file)
                    .instrument(span.clone())
                    .await
            }
        };

        let published = match result {
            Ok(published) => {
                report.finish(RunStatus::Completed, None);
                Some(published)
            }
            Err(err) => {
                let status = match err {
                    EtlError::Cancelled { .. } => RunStatus::Cancelled,
                    _ => RunStatus::Failed,
                };
                report.finish(status, Some(err.to_string()));
                if let Err(write_err) = write_run_report(&self.config.reports_dir, &mut report).await {
                    warn!(parent: &span, "could not write failed run report: {write_err:#}");
                }
                return Err(err);
            }
        };

        if let (true, Some(published)) = (self.config.export_parquet, published) {
            let run_dir = self.config.reports_dir.join(run_id.to_string());
            let exported = match &published {
                Published::Registration(rows) => {
                    export_registration_snapshot(&run_dir, window, rows).await
                }
                Published::Election(rows) => export_election_snapshot(&run_dir, window, rows).await,
            };
            match exported {
                Ok(path) => report.parquet_manifest = Some(path.display().to_string()),
                Err(err) => warn!(parent: &span, "parquet export failed: {err:#}"),
            }
        }

        let run_dir = write_run_report(&self.config.reports_dir, &mut report).await?;
        info!(
            parent: &span,
            reports_dir = %run_dir.display(),
            records_read = report.records_read,
            record_errors = report.record_errors_total(),
            keys_upserted = report.keys_upserted,
            keys_zeroed = report.keys_zeroed,
            "run completed"
        );
        Ok(report)
    }

    async fn ensure_schema_current(&self) -> Result<(), EtlError> {
        let found = self.store.schema_version().await?;
        let expected = self.migrator.latest_version();
        if found != expected {
            return Err(EtlError::SchemaOutOfDate { found, expected });
        }
        Ok(())
    }

    fn check_cancelled(&self, report: &RunReport) -> Result<(), EtlError> {
        if self.cancel.load(Ordering::SeqCst) {
            warn!(records_read = report.records_read, "cancellation requested; stopping");
            return Err(EtlError::Cancelled {
                records_read: report.records_read,
            });
        }
        Ok(())
    }

    async fn registration_stages(
        &self,
        report: &mut RunReport,
        file: &Path,
    ) -> Result<Published, EtlError> {
        let window = report.window;
        self.ensure_schema_current().await?;
        let mut writer = self.store.claim_window(window).await?;
        report.source_sha256 = Some(sha256_file(file).await?);

        let parser = RegistrationParser::new(report.run_id, window.date, source_name(file));
        let mut reader = SnapshotReader::open(file, parser)?;
        while let Some(batch) = reader.next_batch(self.config.batch_size)? {
            report.records_read += batch.records;
            report.record_errors(batch.errors);
            report.raw_rows_appended += self.store.append_raw_voters(&batch.rows).await?;
            debug!(rows = batch.rows.len(), total = report.records_read, "raw voter batch appended");
            self.check_cancelled(report)?;
        }
        info!(
            records_read = report.records_read,
            appended = report.raw_rows_appended,
            skipped = report.skipped_malformed,
            "raw load complete"
        );

        let raw = self
            .store
            .raw_voters_for_load(window.date, report.run_id)
            .await?;
        report.window_raw_rows = raw.len() as u64;
        let normalizer = Normalizer::new(&self.reference, self.config.reference_year);
        let mut canonical = Vec::with_capacity(raw.len());
        for record in &raw {
            match normalizer.voter(record) {
                Ok(voter) => canonical.push(voter),
                Err(err) => {
                    warn!(source_file = %record.source_file, "{err}");
                    report.record_error(err);
                }
            }
        }
        drop(raw);

        let dedup = deduplicate(canonical);
        report.deduplicated_away = dedup.deduplicated_away;
        let aggregation =
            aggregate_registration(window.date, &dedup.records, &self.config.excluded_statuses);
        report.excluded_by_status = aggregation.excluded_by_status;
        report.published_total = aggregation.total();
        info!(
            survivors = dedup.records.len(),
            deduplicated_away = dedup.deduplicated_away,
            keys = aggregation.rows.len(),
            "registration aggregated"
        );

        self.check_cancelled(report)?;
        let outcome = writer.publish_registration(&aggregation.rows).await?;
        writer.commit().await?;
        report.record_outcome(outcome);
        info!(?outcome, "registration window published");
        Ok(Published::Registration(aggregation.rows))
    }

    async fn election_stages(
        &self,
        report: &mut RunReport,
        file: &Path,
    ) -> Result<Published, EtlError> {
        let window = report.window;
        self.ensure_schema_current().await?;
        let mut writer = self.store.claim_window(window).await?;
        report.source_sha256 = Some(sha256_file(file).await?);

        let parser = ElectionParser::new(report.run_id, window.date, source_name(file));
        let mut reader = SnapshotReader::open(file, parser)?;
        let mut rows = Vec::new();
        while let Some(batch) = reader.next_batch(self.config.batch_size)? {
            report.records_read += batch.records;
            report.record_errors(batch.errors);
            report.raw_rows_appended += self.store.append_raw_election_rows(&batch.rows).await?;
            rows.extend(batch.rows);
            self.check_cancelled(report)?;
        }
        report.window_raw_rows = rows.len() as u64;

        let normalizer = Normalizer::new(&self.reference, self.config.reference_year);
        let mut canonical = Vec::with_capacity(rows.len());
        for raw in &rows {
            let parsed = normalizer
                .election_key(raw)
                .and_then(|key| {
                    parse_votes(raw.line_no, &raw.votes).map(|votes| CanonicalElectionRow {
                        line_no: raw.line_no,
                        key,
                        votes,
                    })
                });
            match parsed {
                Ok(row) => canonical.push(row),
                Err(err) => {
                    warn!("{err}");
                    report.record_error(err);
                }
            }
        }

        let aggregation = aggregate_election(canonical);
        report.deduplicated_away = aggregation.superseded;
        report.published_total = aggregation.rows.iter().map(|r| r.votes).sum();
        info!(
            keys = aggregation.rows.len(),
            superseded = aggregation.superseded,
            "election results aggregated"
        );

        self.check_cancelled(report)?;
        let outcome = writer.publish_election(&aggregation.rows).await?;
        writer.commit().await?;
        report.record_outcome(outcome);
        info!(?outcome, "election window published");
        Ok(Published::Election(aggregation.rows))
    }
}

fn source_name(file: &Path) -> String {
    file.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string())
}
