//! Grouping of deduplicated voters and validated vote rows into reporting rows.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use ncv_core::{
    CanonicalElectionRow, CanonicalVoterRecord, ElectionKey, ElectionResultRow,
    RecordError, RegistrationAggregateRow, RegistrationKey, VoterStatus,
};
use tracing::debug;

#[derive(Debug, Default)]
pub struct RegistrationAggregation {
    pub rows: Vec<RegistrationAggregateRow>,
    pub excluded_by_status: u64,
}

impl RegistrationAggregation {
    pub fn total(&self) -> i64 {
        self.rows.iter().map(|r| r.total).sum()
    }
}

/// Counts surviving identities per key for `registration_date`. Rows come back in
/// key order.
pub fn aggregate_registration(
    registration_date: NaiveDate,
    records: &[CanonicalVoterRecord],
    excluded_statuses: &BTreeSet<VoterStatus>,
) -> RegistrationAggregation {
    let mut groups: BTreeMap<RegistrationKey, i64> = BTreeMap::new();
    let mut excluded_by_status = 0u64;
    for record in records {
        if excluded_statuses.contains(&record.status) {
            excluded_by_status += 1;
            continue;
        }
        let key = RegistrationKey {
            registration_date,
            county: record.county.clone(),
            party: record.party,
            race: record.race,
            ethnicity: record.ethnicity,
            gender: record.gender,
            age_bucket: record.age_bucket,
        };
        *groups.entry(key).or_default() += 1;
    }
    RegistrationAggregation {
        rows: groups
            .into_iter()
            .map(|(key, total)| RegistrationAggregateRow { key, total })
            .collect(),
        excluded_by_status,
    }
}

/// Parses a tally. Only plain digits are accepted; nothing is coerced.
pub fn parse_votes(line: u64, raw: &str) -> Result<i64, RecordError> {
    let trimmed = raw.trim();
    let integrity = |reason: String| RecordError::DataIntegrity { line, reason };
    if trimmed.is_empty() {
        return Err(integrity("missing vote count".into()));
    }
    if trimmed.starts_with('-') && trimmed[1..].bytes().all(|b| b.is_ascii_digit()) {
        return Err(integrity(format!("negative vote count `{trimmed}`")));
    }
    if !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(integrity(format!("non-numeric vote count `{trimmed}`")));
    }
    trimmed
        .parse::<i64>()
        .map_err(|_| integrity(format!("vote count `{trimmed}` out of range")))
}

#[derive(Debug, Default)]
pub struct ElectionAggregation {
    pub rows: Vec<ElectionResultRow>,
    /// Earlier rows superseded by a later row with the same key.
    pub superseded: u64,
}

/// One row per key; when a file repeats a key the later row's tally stands.
pub fn aggregate_election(rows: Vec<CanonicalElectionRow>) -> ElectionAggregation {
    let mut by_key: BTreeMap<ElectionKey, (u64, i64)> = BTreeMap::new();
    let mut superseded = 0u64;
    for row in rows {
        if let Some((previous_line, _)) = by_key.insert(row.key.clone(), (row.line_no, row.votes)) {
            superseded += 1;
            debug!(
                line = row.line_no,
                previous_line,
                contest = %row.key.contest,
                candidate = %row.key.candidate,
                "repeated election key; keeping the later row"
            );
        }
    }
    ElectionAggregation {
        rows: by_key
            .into_iter()
            .map(|(key, (_, votes))| ElectionResultRow { key, votes })
            .collect(),
        superseded,
    }
}
