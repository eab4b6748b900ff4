//! Core domain model for the NC voter registration and election results ETL.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod reference;
mod vocab;

pub use reference::{CountyEntry, CountyReference, ReferenceError};
pub use vocab::{
    AgeBucket, Ethnicity, Gender, Party, Race, VocabularyError, VoterStatus, MIN_BIRTH_YEAR,
};

pub const CRATE_NAME: &str = "ncv-core";

/// The two snapshot sources the pipeline knows how to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Registration,
    Election,
}

impl SnapshotKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotKind::Registration => "registration",
            SnapshotKind::Election => "election",
        }
    }
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of atomic publish: one snapshot kind on one date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LoadWindow {
    pub kind: SnapshotKind,
    pub date: NaiveDate,
}

impl LoadWindow {
    pub fn registration(date: NaiveDate) -> Self {
        Self {
            kind: SnapshotKind::Registration,
            date,
        }
    }

    pub fn election(date: NaiveDate) -> Self {
        Self {
            kind: SnapshotKind::Election,
            date,
        }
    }
}

impl fmt::Display for LoadWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.kind, self.date)
    }
}

/// Record-level failures. None of these abort a run; each skips one row.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordError {
    #[error("malformed record at line {line}: {reason}")]
    Malformed { line: u64, reason: String },
    #[error("unresolvable {reference}{}", line_suffix(.line))]
    ReferenceResolution { line: Option<u64>, reference: String },
    #[error("data integrity violation at line {line}: {reason}")]
    DataIntegrity { line: u64, reason: String },
}

fn line_suffix(line: &Option<u64>) -> String {
    line.map(|l| format!(" at line {l}")).unwrap_or_default()
}

impl RecordError {
    pub fn with_line(self, line: u64) -> Self {
        match self {
            RecordError::ReferenceResolution { reference, .. } => RecordError::ReferenceResolution {
                line: Some(line),
                reference,
            },
            other => other,
        }
    }
}

/// A voter row exactly as it appeared in a snapshot file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawVoterRecord {
    pub load_id: Uuid,
    pub snapshot_date: NaiveDate,
    pub source_file: String,
    pub line_no: u64,
    /// Assigned by the raw store on append; strictly increasing in insertion order.
    pub seq: i64,
    pub county_id: Option<u16>,
    pub county_desc: String,
    pub voter_reg_num: String,
    pub ncid: String,
    pub status_cd: String,
    pub registr_dt: Option<NaiveDate>,
    pub race_code: String,
    pub ethnic_code: String,
    pub party_cd: String,
    pub gender_code: String,
    pub birth_year: String,
    pub precinct_abbrv: String,
    pub precinct_desc: String,
    pub municipality_abbrv: Option<String>,
    pub ward_abbrv: Option<String>,
    pub cong_dist_abbrv: Option<String>,
    pub nc_senate_abbrv: Option<String>,
    pub nc_house_abbrv: Option<String>,
    pub ssn: Option<String>,
    pub no_dl_ssn_chkbx: Option<String>,
    pub hava_id_req: Option<String>,
}

/// A precinct/contest/choice row exactly as it appeared in a results file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawElectionRow {
    pub load_id: Uuid,
    pub snapshot_date: NaiveDate,
    pub source_file: String,
    pub line_no: u64,
    pub seq: i64,
    pub county: String,
    pub election_date: NaiveDate,
    pub precinct: String,
    pub contest_name: String,
    pub district: String,
    pub candidate_name: String,
    pub party_abbrv: String,
    /// Kept unparsed; the election aggregator decides whether it is a valid tally.
    pub votes: String,
}

/// Stable per-person deduplication key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VoterIdentity {
    Ncid(String),
    CountyRegistration { fips_code: String, voter_reg_num: String },
}

impl VoterIdentity {
    /// Prefers a non-blank `ncid`; otherwise scopes `voter_reg_num` by county.
    pub fn derive(ncid: &str, voter_reg_num: &str, fips_code: &str) -> Self {
        let ncid = ncid.trim();
        if !ncid.is_empty() {
            return VoterIdentity::Ncid(ncid.to_ascii_uppercase());
        }
        let reg = voter_reg_num.trim().trim_start_matches('0');
        let reg = if reg.is_empty() && !voter_reg_num.trim().is_empty() {
            "0"
        } else {
            reg
        };
        VoterIdentity::CountyRegistration {
            fips_code: fips_code.to_string(),
            voter_reg_num: reg.to_string(),
        }
    }
}

impl fmt::Display for VoterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoterIdentity::Ncid(ncid) => write!(f, "ncid:{ncid}"),
            VoterIdentity::CountyRegistration {
                fips_code,
                voter_reg_num,
            } => write!(f, "reg:{fips_code}:{voter_reg_num}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalVoterRecord {
    pub identity: VoterIdentity,
    pub snapshot_date: NaiveDate,
    pub seq: i64,
    pub county: String,
    pub fips_code: String,
    pub party: Party,
    pub race: Race,
    pub ethnicity: Ethnicity,
    pub gender: Gender,
    pub status: VoterStatus,
    pub age_bucket: AgeBucket,
    pub precinct: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalElectionRow {
    pub line_no: u64,
    pub key: ElectionKey,
    pub votes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegistrationKey {
    pub registration_date: NaiveDate,
    pub county: String,
    pub party: Party,
    pub race: Race,
    pub ethnicity: Ethnicity,
    pub gender: Gender,
    pub age_bucket: AgeBucket,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationAggregateRow {
    #[serde(flatten)]
    pub key: RegistrationKey,
    pub total: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ElectionKey {
    pub election_date: NaiveDate,
    pub county: String,
    pub precinct: String,
    pub contest: String,
    pub district: String,
    pub candidate: String,
    pub party: Party,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionResultRow {
    #[serde(flatten)]
    pub key: ElectionKey,
    pub votes: i64,
}
