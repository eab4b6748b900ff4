use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::NaiveDate;
use ncv_core::{AgeBucket, CountyReference, LoadWindow, Party, RecordError};
use ncv_etl::{
    migrate_store, report_markdown, seed_counties, EtlConfig, EtlError, EtlPipeline,
    ParquetManifest, RunReport, RunStatus,
};
use ncv_storage::{MemoryStore, WarehouseStore};
use tempfile::{tempdir, TempDir};

const REGISTRATION_HEADER: &str = "county_id\tcounty_desc\tvoter_reg_num\tncid\tstatus_cd\tregistr_dt\trace_code\tethnic_code\tparty_cd\tgender_code\tbirth_year\tprecinct_abbrv\tprecinct_desc";
const ELECTION_HEADER: &str =
    "county\telection_dt\tprecinct\tcontest_name\tdistrict\tcandidate_name\tparty_abbrv\tvotes";

struct Harness {
    dir: TempDir,
    store: MemoryStore,
    pipeline: EtlPipeline,
}

fn counties() -> Arc<CountyReference> {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../data/counties.yaml");
    Arc::new(CountyReference::load(path).expect("county reference"))
}

async fn harness() -> Harness {
    let dir = tempdir().expect("tempdir");
    let store = MemoryStore::new();
    migrate_store(&store).await.unwrap();
    let reference = counties();
    assert_eq!(seed_counties(&store, &reference).await.unwrap(), 100);
    assert_eq!(store.counties().len(), 100);
    let pipeline =
        EtlPipeline::new(EtlConfig::for_workspace(dir.path()), Arc::new(store.clone()), reference)
            .unwrap();
    Harness {
        dir,
        store,
        pipeline,
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn voter(county_id: &str, county: &str, ncid: &str, party: &str, birth_year: &str) -> String {
    format!(
        "{county_id}\t{county}\t{ncid}00\t{ncid}\tA\t01/15/2020\tW\tNL\t{party}\tF\t{birth_year}\t01-01\tPRECINCT 01-01"
    )
}

fn result(county: &str, candidate: &str, party: &str, votes: &str) -> String {
    format!("{county}\t11/05/2024\tP01\tUS PRESIDENT\t\t{candidate}\t{party}\t{votes}")
}

fn write_file(dir: &Path, name: &str, header: &str, lines: &[String]) -> PathBuf {
    let path = dir.join(name);
    let mut text = header.to_string();
    for line in lines {
        text.push('\n');
        text.push_str(line);
    }
    text.push('\n');
    std::fs::write(&path, text).unwrap();
    path
}

fn read_report(dir: &Path) -> RunReport {
    let run_dir = std::fs::read_dir(dir.join("reports"))
        .unwrap()
        .next()
        .expect("one run directory")
        .unwrap()
        .path();
    serde_json::from_slice(&std::fs::read(run_dir.join("run_report.json")).unwrap()).unwrap()
}

#[tokio::test]
async fn later_snapshot_is_published_under_its_own_date() {
    let h = harness().await;
    let early = write_file(
        h.dir.path(),
        "ncvoter_20241001.txt",
        REGISTRATION_HEADER,
        &[voter("92", "WAKE", "A1", "DEM", "1999")],
    );
    let late = write_file(
        h.dir.path(),
        "ncvoter_20241010.txt",
        REGISTRATION_HEADER,
        &[voter("92", "WAKE", "A1", "DEM", "1999")],
    );

    h.pipeline.run_registration(&early, date(2024, 10, 1)).await.unwrap();
    h.pipeline.run_registration(&late, date(2024, 10, 10)).await.unwrap();

    let rows = h.store.registration_rows(date(2024, 10, 10)).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key.county, "Wake");
    assert_eq!(rows[0].key.party, Party::Dem);
    assert_eq!(rows[0].key.age_bucket, AgeBucket::From18To25);
    assert_eq!(rows[0].total, 1);
}

#[tokio::test]
async fn rerunning_a_window_publishes_identical_rows() {
    let h = harness().await;
    let file = write_file(
        h.dir.path(),
        "ncvoter92.txt",
        REGISTRATION_HEADER,
        &[
            voter("92", "WAKE", "A1", "DEM", "1999"),
            voter("92", "WAKE", "B2", "REP", "1960"),
            voter("68", "ORANGE", "C3", "UNA", "1980"),
        ],
    );
    let snapshot = date(2024, 10, 10);

    let first = h.pipeline.run_registration(&file, snapshot).await.unwrap();
    let before = h.store.registration_rows(snapshot).await.unwrap();
    let second = h.pipeline.run_registration(&file, snapshot).await.unwrap();
    let after = h.store.registration_rows(snapshot).await.unwrap();

    assert_eq!(before, after);
    assert_eq!(first.keys_inserted, 3);
    assert_eq!(second.keys_inserted, 0);
    assert_eq!(second.keys_unchanged, 3);
    assert_eq!(second.keys_zeroed, 0);
    assert_eq!(second.window_raw_rows, 3);
    assert_eq!(second.deduplicated_away, 0);
    assert_eq!(
        (first.records_read, first.record_errors_total(), first.published_total),
        (second.records_read, second.record_errors_total(), second.published_total)
    );
    assert_eq!(first.source_sha256, second.source_sha256);
    assert_eq!(h.store.raw_voter_count(), 6);
}

#[tokio::test]
async fn a_corrected_file_for_the_same_date_drops_missing_voters() {
    let h = harness().await;
    let snapshot = date(2024, 10, 10);
    let full = write_file(
        h.dir.path(),
        "full.txt",
        REGISTRATION_HEADER,
        &[
            voter("92", "WAKE", "A1", "DEM", "1999"),
            voter("92", "WAKE", "B2", "REP", "1960"),
        ],
    );
    let corrected = write_file(
        h.dir.path(),
        "corrected.txt",
        REGISTRATION_HEADER,
        &[voter("92", "WAKE", "A1", "DEM", "1999")],
    );

    h.pipeline.run_registration(&full, snapshot).await.unwrap();
    let report = h.pipeline.run_registration(&corrected, snapshot).await.unwrap();

    assert_eq!(report.records_read, 1);
    assert_eq!(report.window_raw_rows, 1);
    assert_eq!(report.deduplicated_away, 0);
    assert_eq!(report.keys_zeroed, 1);
    let rows = h.store.registration_rows(snapshot).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key.party, Party::Dem);
    assert_eq!(rows.iter().map(|r| r.total).sum::<i64>(), 1);
}

#[tokio::test]
async fn repeated_identity_counts_once_with_the_later_row() {
    let h = harness().await;
    let file = write_file(
        h.dir.path(),
        "ncvoter92.txt",
        REGISTRATION_HEADER,
        &[
            voter("92", "WAKE", "A1", "DEM", "1999"),
            voter("92", "WAKE", "a1", "REP", "1999"),
        ],
    );

    let report = h.pipeline.run_registration(&file, date(2024, 10, 10)).await.unwrap();
    let rows = h.store.registration_rows(date(2024, 10, 10)).await.unwrap();
    assert_eq!(report.deduplicated_away, 1);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key.party, Party::Rep);
}

#[tokio::test]
async fn every_record_is_published_skipped_or_deduplicated() {
    let h = harness().await;
    let file = write_file(
        h.dir.path(),
        "ncvoter_mixed.txt",
        REGISTRATION_HEADER,
        &[
            voter("92", "WAKE", "A1", "DEM", "1999"),
            voter("92", "WAKE", "A1", "DEM", "1999"),
            voter("92", "WAKE", "B2", "XYZ", "19x9"),
            voter("", "ATLANTIS", "C3", "REP", "1970"),
            "92\tWAKE\t5".to_string(),
            voter("68", "ORANGE", "D4", "LIB", "1950"),
        ],
    );

    let report = h.pipeline.run_registration(&file, date(2024, 10, 10)).await.unwrap();
    assert_eq!(report.records_read, 6);
    assert_eq!(report.skipped_malformed, 1);
    assert_eq!(report.reference_errors, 1);
    assert_eq!(report.deduplicated_away, 1);
    assert_eq!(
        report.records_read,
        report.published_total as u64 + report.deduplicated_away + report.record_errors_total()
    );

    let rows = h.store.registration_rows(date(2024, 10, 10)).await.unwrap();
    let unknown = rows
        .iter()
        .find(|r| r.key.party == Party::Unknown)
        .expect("unknown party still counted");
    assert_eq!(unknown.key.age_bucket, AgeBucket::Unknown);
    assert_eq!(rows.iter().map(|r| r.total).sum::<i64>(), 3);
    assert!(report
        .error_samples
        .iter()
        .any(|e| matches!(e, RecordError::ReferenceResolution { line: Some(5), .. })));
}

#[tokio::test]
async fn a_voter_leaving_a_group_zeroes_the_old_key() {
    let h = harness().await;
    let snapshot = date(2024, 10, 10);
    let first = write_file(
        h.dir.path(),
        "first.txt",
        REGISTRATION_HEADER,
        &[voter("92", "WAKE", "A1", "DEM", "1999")],
    );
    let second = write_file(
        h.dir.path(),
        "second.txt",
        REGISTRATION_HEADER,
        &[voter("92", "WAKE", "A1", "REP", "1999")],
    );

    h.pipeline.run_registration(&first, snapshot).await.unwrap();
    let report = h.pipeline.run_registration(&second, snapshot).await.unwrap();

    assert_eq!(report.keys_zeroed, 1);
    assert_eq!(report.keys_inserted, 1);
    let rows = h.store.registration_rows(snapshot).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key.party, Party::Rep);
}

#[tokio::test]
async fn negative_votes_are_reported_and_never_published() {
    let h = harness().await;
    let file = write_file(
        h.dir.path(),
        "results_pct_20241105.txt",
        ELECTION_HEADER,
        &[
            result("WAKE", "Jane Doe", "DEM", "120"),
            result("WAKE", "John Roe", "REP", "-5"),
            result("DURHAM", "Jane Doe", "DEM", "77"),
        ],
    );

    let report = h.pipeline.run_election(&file, date(2024, 11, 5)).await.unwrap();
    assert_eq!(report.integrity_errors, 1);
    assert!(report
        .error_samples
        .iter()
        .any(|e| matches!(e, RecordError::DataIntegrity { line: 3, .. })));

    assert_eq!(h.store.raw_election_count(), 3);
    let rows = h.store.election_rows(date(2024, 11, 5)).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.key.candidate != "John Roe"));
    assert_eq!(report.published_total, 197);
}

#[tokio::test]
async fn candidates_missing_from_a_rerun_are_removed() {
    let h = harness().await;
    let election = date(2024, 11, 5);
    let full = write_file(
        h.dir.path(),
        "full.txt",
        ELECTION_HEADER,
        &[
            result("WAKE", "Jane Doe", "DEM", "120"),
            result("WAKE", "John Roe", "REP", "99"),
        ],
    );
    let corrected = write_file(
        h.dir.path(),
        "corrected.txt",
        ELECTION_HEADER,
        &[result("WAKE", "Jane Doe", "DEM", "121")],
    );

    h.pipeline.run_election(&full, election).await.unwrap();
    let report = h.pipeline.run_election(&corrected, election).await.unwrap();

    assert_eq!(report.keys_updated, 1);
    assert_eq!(report.keys_zeroed, 1);
    let rows = h.store.election_rows(election).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].votes, 121);
}

#[tokio::test]
async fn a_held_window_fails_fast_and_is_reported() {
    let h = harness().await;
    let snapshot = date(2024, 10, 10);
    let file = write_file(
        h.dir.path(),
        "ncvoter92.txt",
        REGISTRATION_HEADER,
        &[voter("92", "WAKE", "A1", "DEM", "1999")],
    );

    let held = h.store.claim_window(LoadWindow::registration(snapshot)).await.unwrap();
    let err = h.pipeline.run_registration(&file, snapshot).await.unwrap_err();
    assert!(err.is_concurrent_load(), "{err}");
    assert_eq!(h.store.raw_voter_count(), 0);

    let report = read_report(h.dir.path());
    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.failure.unwrap().contains("already owns"));

    drop(held);
    h.pipeline.run_registration(&file, snapshot).await.unwrap();
}

#[tokio::test]
async fn cancellation_leaves_published_rows_untouched() {
    let h = harness().await;
    let snapshot = date(2024, 10, 10);
    let first = write_file(
        h.dir.path(),
        "first.txt",
        REGISTRATION_HEADER,
        &[voter("92", "WAKE", "A1", "DEM", "1999")],
    );
    let second = write_file(
        h.dir.path(),
        "second.txt",
        REGISTRATION_HEADER,
        &[voter("92", "WAKE", "B2", "REP", "1960")],
    );
    h.pipeline.run_registration(&first, snapshot).await.unwrap();
    let before = h.store.registration_rows(snapshot).await.unwrap();

    h.pipeline.cancellation_flag().store(true, Ordering::SeqCst);
    let err = h.pipeline.run_registration(&second, snapshot).await.unwrap_err();
    assert!(matches!(err, EtlError::Cancelled { .. }), "{err}");
    assert_eq!(h.store.registration_rows(snapshot).await.unwrap(), before);
}

#[tokio::test]
async fn a_cancelled_load_is_not_published_by_the_next_run() {
    let h = harness().await;
    let snapshot = date(2024, 10, 10);
    let wrong = write_file(
        h.dir.path(),
        "wrong.txt",
        REGISTRATION_HEADER,
        &[voter("92", "WAKE", "B2", "REP", "1960")],
    );
    let first = write_file(
        h.dir.path(),
        "first.txt",
        REGISTRATION_HEADER,
        &[voter("92", "WAKE", "A1", "DEM", "1999")],
    );

    let cancel = h.pipeline.cancellation_flag();
    cancel.store(true, Ordering::SeqCst);
    let err = h.pipeline.run_registration(&wrong, snapshot).await.unwrap_err();
    assert!(matches!(err, EtlError::Cancelled { .. }), "{err}");
    assert_eq!(h.store.raw_voter_count(), 1);

    cancel.store(false, Ordering::SeqCst);
    let report = h.pipeline.run_registration(&first, snapshot).await.unwrap();
    assert_eq!(report.window_raw_rows, 1);
    let rows = h.store.registration_rows(snapshot).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key.party, Party::Dem);
    assert_eq!(rows[0].total, 1);
}

#[tokio::test]
async fn an_unmigrated_store_is_refused() {
    let dir = tempdir().expect("tempdir");
    let store = MemoryStore::new();
    let pipeline =
        EtlPipeline::new(EtlConfig::for_workspace(dir.path()), Arc::new(store.clone()), counties())
            .unwrap();
    let file = write_file(
        dir.path(),
        "ncvoter92.txt",
        REGISTRATION_HEADER,
        &[voter("92", "WAKE", "A1", "DEM", "1999")],
    );

    let err = pipeline.run_registration(&file, date(2024, 10, 10)).await.unwrap_err();
    assert!(matches!(err, EtlError::SchemaOutOfDate { found: 0, .. }), "{err}");
    assert_eq!(store.raw_voter_count(), 0);
}

#[tokio::test]
async fn completed_runs_leave_reports_and_a_parquet_manifest() {
    let h = harness().await;
    let file = write_file(
        h.dir.path(),
        "results_pct_20241105.txt",
        ELECTION_HEADER,
        &[result("WAKE", "Jane Doe", "DEM", "120")],
    );

    let report = h.pipeline.run_election(&file, date(2024, 11, 5)).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    let manifest_path = PathBuf::from(report.parquet_manifest.as_deref().expect("manifest"));
    let manifest: ParquetManifest =
        serde_json::from_slice(&std::fs::read(manifest_path).unwrap()).unwrap();
    assert_eq!(manifest.window, LoadWindow::election(date(2024, 11, 5)));
    assert_eq!(manifest.files[0].rows, 1);

    let digest = report_markdown(10, &h.dir.path().join("reports")).unwrap();
    assert!(digest.contains(&report.run_id.to_string()));
}
