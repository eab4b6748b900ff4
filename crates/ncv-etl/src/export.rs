//! Parquet snapshots of a published window, with a SHA-256 manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use ncv_core::{ElectionResultRow, LoadWindow, RegistrationAggregateRow};
use ncv_storage::sha256_hex;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use tokio::fs;

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub window: LoadWindow,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: u64,
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn utf8_column<'a>(values: impl Iterator<Item = &'a str>) -> ArrayRef {
    Arc::new(StringArray::from(values.map(Some).collect::<Vec<_>>()))
}

fn registration_batch(rows: &[RegistrationAggregateRow]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("registration_date", DataType::Utf8, false),
        ArrowField::new("county", DataType::Utf8, false),
        ArrowField::new("party", DataType::Utf8, false),
        ArrowField::new("race", DataType::Utf8, false),
        ArrowField::new("ethnicity", DataType::Utf8, false),
        ArrowField::new("gender", DataType::Utf8, false),
        ArrowField::new("age_bucket", DataType::Utf8, false),
        ArrowField::new("total", DataType::Int64, false),
    ]));
    let dates = rows
        .iter()
        .map(|r| r.key.registration_date.to_string())
        .collect::<Vec<_>>();
    RecordBatch::try_new(
        schema,
        vec![
            utf8_column(dates.iter().map(String::as_str)),
            utf8_column(rows.iter().map(|r| r.key.county.as_str())),
            utf8_column(rows.iter().map(|r| r.key.party.as_str())),
            utf8_column(rows.iter().map(|r| r.key.race.as_str())),
            utf8_column(rows.iter().map(|r| r.key.ethnicity.as_str())),
            utf8_column(rows.iter().map(|r| r.key.gender.as_str())),
            utf8_column(rows.iter().map(|r| r.key.age_bucket.as_str())),
            Arc::new(Int64Array::from(rows.iter().map(|r| r.total).collect::<Vec<_>>())),
        ],
    )
    .context("building voter_registration record batch")
}

fn election_batch(rows: &[ElectionResultRow]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("election_date", DataType::Utf8, false),
        ArrowField::new("county", DataType::Utf8, false),
        ArrowField::new("precinct", DataType::Utf8, false),
        ArrowField::new("contest", DataType::Utf8, false),
        ArrowField::new("district", DataType::Utf8, false),
        ArrowField::new("candidate", DataType::Utf8, false),
        ArrowField::new("party", DataType::Utf8, false),
        ArrowField::new("votes", DataType::Int64, false),
    ]));
    let dates = rows
        .iter()
        .map(|r| r.key.election_date.to_string())
        .collect::<Vec<_>>();
    RecordBatch::try_new(
        schema,
        vec![
            utf8_column(dates.iter().map(String::as_str)),
            utf8_column(rows.iter().map(|r| r.key.county.as_str())),
            utf8_column(rows.iter().map(|r| r.key.precinct.as_str())),
            utf8_column(rows.iter().map(|r| r.key.contest.as_str())),
            utf8_column(rows.iter().map(|r| r.key.district.as_str())),
            utf8_column(rows.iter().map(|r| r.key.candidate.as_str())),
            utf8_column(rows.iter().map(|r| r.key.party.as_str())),
            Arc::new(Int64Array::from(rows.iter().map(|r| r.votes).collect::<Vec<_>>())),
        ],
    )
    .context("building election_results record batch")
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
        rows: rows as u64,
    })
}

async fn export_batch(
    run_dir: &Path,
    window: LoadWindow,
    name: &str,
    batch: RecordBatch,
) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let rows = batch.num_rows();
    let table_path = snapshot_dir.join(format!("{name}.parquet"));
    write_parquet(&table_path, batch)?;

    let manifest = ParquetManifest {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        window,
        files: vec![manifest_entry(name, run_dir, &table_path, rows)?],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

pub async fn export_registration_snapshot(
    run_dir: &Path,
    window: LoadWindow,
    rows: &[RegistrationAggregateRow],
) -> Result<PathBuf> {
    export_batch(run_dir, window, "voter_registration", registration_batch(rows)?).await
}

pub async fn export_election_snapshot(
    run_dir: &Path,
    window: LoadWindow,
    rows: &[ElectionResultRow],
) -> Result<PathBuf> {
    export_batch(run_dir, window, "election_results", election_batch(rows)?).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ncv_core::{AgeBucket, Ethnicity, Gender, Party, Race, RegistrationKey};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use tempfile::tempdir;

    #[tokio::test]
    async fn registration_snapshot_matches_its_manifest() {
        let dir = tempdir().expect("tempdir");
        let date = NaiveDate::from_ymd_opt(2024, 10, 10).unwrap();
        let rows = (0..3)
            .map(|i| RegistrationAggregateRow {
                key: RegistrationKey {
                    registration_date: date,
                    county: format!("County {i}"),
                    party: Party::Una,
                    race: Race::Black,
                    ethnicity: Ethnicity::Unknown,
                    gender: Gender::Male,
                    age_bucket: AgeBucket::Over65,
                },
                total: i + 1,
            })
            .collect::<Vec<_>>();

        let manifest_path =
            export_registration_snapshot(dir.path(), LoadWindow::registration(date), &rows)
                .await
                .unwrap();
        let manifest: ParquetManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        assert_eq!(manifest.files.len(), 1);
        let file = &manifest.files[0];
        assert_eq!(file.rows, 3);

        let table_path = dir.path().join(&file.path);
        let bytes = std::fs::read(&table_path).unwrap();
        assert_eq!(sha256_hex(&bytes), file.sha256);

        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(&table_path).unwrap())
            .unwrap()
            .build()
            .unwrap();
        let read_rows: usize = reader.map(|b| b.unwrap().num_rows()).sum();
        assert_eq!(read_rows, 3);
    }

    #[test]
    fn election_batch_has_one_column_per_key_part() {
        let batch = election_batch(&[]).unwrap();
        assert_eq!(batch.num_columns(), 8);
        assert_eq!(batch.num_rows(), 0);
    }
}
