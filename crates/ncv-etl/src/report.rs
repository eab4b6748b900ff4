//! Run outcome reports: what the scheduler inspects after each run.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ncv_core::{LoadWindow, RecordError, SnapshotKind};
use ncv_storage::UpsertOutcome;
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

pub const MAX_ERROR_SAMPLES: usize = 50;
pub const RUN_REPORT_FILE: &str = "run_report.json";
pub const RUN_BRIEF_FILE: &str = "run_brief.md";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub kind: SnapshotKind,
    pub window: LoadWindow,
    pub source_file: String,
    pub source_sha256: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub failure: Option<String>,
    pub records_read: u64,
    pub raw_rows_appended: u64,
    /// Raw rows stored for the window, across every load of that snapshot date.
    pub window_raw_rows: u64,
    pub skipped_malformed: u64,
    pub reference_errors: u64,
    pub integrity_errors: u64,
    pub deduplicated_away: u64,
    pub excluded_by_status: u64,
    pub keys_upserted: u64,
    pub keys_inserted: u64,
    pub keys_updated: u64,
    pub keys_unchanged: u64,
    pub keys_zeroed: u64,
    pub published_total: i64,
    pub error_samples: Vec<RecordError>,
    pub reports_dir: Option<String>,
    pub parquet_manifest: Option<String>,
}

impl RunReport {
    pub fn start(run_id: Uuid, window: LoadWindow, source_file: impl Into<String>) -> Self {
        Self {
            run_id,
            kind: window.kind,
            window,
            source_file: source_file.into(),
            source_sha256: None,
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            failure: None,
            records_read: 0,
            raw_rows_appended: 0,
            window_raw_rows: 0,
            skipped_malformed: 0,
            reference_errors: 0,
            integrity_errors: 0,
            deduplicated_away: 0,
            excluded_by_status: 0,
            keys_upserted: 0,
            keys_inserted: 0,
            keys_updated: 0,
            keys_unchanged: 0,
            keys_zeroed: 0,
            published_total: 0,
            error_samples: Vec::new(),
            reports_dir: None,
            parquet_manifest: None,
        }
    }

    pub fn record_error(&mut self, err: RecordError) {
        match &err {
            RecordError::Malformed { .. } => self.skipped_malformed += 1,
            RecordError::ReferenceResolution { .. } => self.reference_errors += 1,
            RecordError::DataIntegrity { .. } => self.integrity_errors += 1,
        }
        if self.error_samples.len() < MAX_ERROR_SAMPLES {
            self.error_samples.push(err);
        }
    }

    pub fn record_errors(&mut self, errors: impl IntoIterator<Item = RecordError>) {
        for err in errors {
            self.record_error(err);
        }
    }

    pub fn record_outcome(&mut self, outcome: UpsertOutcome) {
        self.keys_upserted = outcome.upserted();
        self.keys_inserted = outcome.inserted;
        self.keys_updated = outcome.updated;
        self.keys_unchanged = outcome.unchanged;
        self.keys_zeroed = outcome.zeroed;
    }

    pub fn record_errors_total(&self) -> u64 {
        self.skipped_malformed + self.reference_errors + self.integrity_errors
    }

    pub fn finish(&mut self, status: RunStatus, failure: Option<String>) {
        self.status = status;
        self.failure = failure;
        self.finished_at = Some(Utc::now());
    }

    pub fn brief_markdown(&self) -> String {
        let mut lines = vec![
            format!("# NC Votes ETL Run `{}`", self.run_id),
            String::new(),
            format!("- Window: {}", self.window),
            format!("- Source: `{}`", self.source_file),
            format!("- Status: {:?}", self.status),
            format!("- Started: {}", self.started_at),
        ];
        if let Some(finished_at) = self.finished_at {
            lines.push(format!("- Finished: {finished_at}"));
        }
        if let Some(sha) = &self.source_sha256 {
            lines.push(format!("- SHA-256: `{sha}`"));
        }
        if let Some(failure) = &self.failure {
            lines.push(format!("- Failure: {failure}"));
        }
        lines.extend([
            String::new(),
            "## Records".to_string(),
            format!("- read: {}", self.records_read),
            format!("- skipped (malformed): {}", self.skipped_malformed),
            format!("- reference errors: {}", self.reference_errors),
            format!("- integrity errors: {}", self.integrity_errors),
            format!("- deduplicated away: {}", self.deduplicated_away),
            format!("- excluded by status: {}", self.excluded_by_status),
            String::new(),
            "## Keys".to_string(),
            format!(
                "- upserted: {} ({} new, {} changed, {} unchanged)",
                self.keys_upserted, self.keys_inserted, self.keys_updated, self.keys_unchanged
            ),
            format!("- zeroed: {}", self.keys_zeroed),
            format!("- published total: {}", self.published_total),
        ]);
        if !self.error_samples.is_empty() {
            lines.push(String::new());
            lines.push("## Sample Errors".to_string());
            lines.extend(self.error_samples.iter().map(|e| format!("- {e}")));
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

/// Writes `run_report.json` and `run_brief.md` under `reports_root/<run_id>`.
pub async fn write_run_report(reports_root: &Path, report: &mut RunReport) -> Result<PathBuf> {
    let dir = reports_root.join(report.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    report.reports_dir = Some(dir.display().to_string());

    let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(dir.join(RUN_REPORT_FILE), json)
        .await
        .with_context(|| format!("writing {RUN_REPORT_FILE}"))?;
    fs::write(dir.join(RUN_BRIEF_FILE), report.brief_markdown())
        .await
        .with_context(|| format!("writing {RUN_BRIEF_FILE}"))?;
    Ok(dir)
}

/// Markdown digest of the latest `runs` reports, newest first.
pub fn report_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut lines = vec!["# NC Votes ETL Runs".to_string(), String::new()];
    if !reports_root.exists() {
        lines.push("_No runs recorded._".to_string());
        return Ok(lines.join("\n"));
    }

    let mut reports = Vec::new();
    for entry in std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
    {
        let entry = entry.with_context(|| format!("reading {}", reports_root.display()))?;
        let path = entry.path().join(RUN_REPORT_FILE);
        if !path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let report: RunReport =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        reports.push(report);
    }
    reports.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    for report in reports.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}` ({:?})", report.run_id, report.status));
        lines.push(format!("- window: {}", report.window));
        lines.push(format!("- source: `{}`", report.source_file));
        lines.push(format!(
            "- records: {} read, {} record errors, {} deduplicated away",
            report.records_read,
            report.record_errors_total(),
            report.deduplicated_away
        ));
        lines.push(format!(
            "- keys: {} upserted, {} zeroed",
            report.keys_upserted, report.keys_zeroed
        ));
        if let Some(failure) = &report.failure {
            lines.push(format!("- failure: {failure}"));
        }
        if let Some(manifest) = &report.parquet_manifest {
            lines.push(format!("- parquet manifest: `{manifest}`"));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn report() -> RunReport {
        RunReport::start(
            Uuid::new_v4(),
            LoadWindow::election(NaiveDate::from_ymd_opt(2024, 11, 5).unwrap()),
            "results_pct_20241105.txt",
        )
    }

    #[test]
    fn error_samples_are_capped_but_counts_are_not() {
        let mut report = report();
        for line in 0..(MAX_ERROR_SAMPLES as u64 + 10) {
            report.record_error(RecordError::DataIntegrity {
                line,
                reason: "negative vote count `-5`".into(),
            });
        }
        assert_eq!(report.integrity_errors, MAX_ERROR_SAMPLES as u64 + 10);
        assert_eq!(report.error_samples.len(), MAX_ERROR_SAMPLES);
    }

    #[tokio::test]
    async fn written_reports_feed_the_digest() {
        let dir = tempdir().expect("tempdir");
        let mut older = report();
        older.finish(RunStatus::Completed, None);
        write_run_report(dir.path(), &mut older).await.unwrap();

        let mut newer = report();
        newer.started_at = older.started_at + chrono::Duration::seconds(5);
        newer.finish(RunStatus::Failed, Some("another run owns the window".into()));
        let run_dir = write_run_report(dir.path(), &mut newer).await.unwrap();
        assert!(run_dir.join(RUN_BRIEF_FILE).exists());

        let digest = report_markdown(1, dir.path()).unwrap();
        assert!(digest.contains(&newer.run_id.to_string()));
        assert!(!digest.contains(&older.run_id.to_string()));
        assert!(digest.contains("another run owns the window"));
    }

    #[test]
    fn digest_of_missing_directory_is_empty() {
        let dir = tempdir().expect("tempdir");
        let digest = report_markdown(5, &dir.path().join("reports")).unwrap();
        assert!(digest.contains("No runs recorded"));
    }
}
