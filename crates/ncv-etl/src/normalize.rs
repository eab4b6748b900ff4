//! Pure per-record mapping from raw rows to the canonical vocabulary.

use chrono::Datelike;
use ncv_core::{
    AgeBucket, CanonicalVoterRecord, CountyReference, ElectionKey, Ethnicity, Gender, Party, Race,
    RawElectionRow, RawVoterRecord, RecordError, VoterIdentity, VoterStatus,
};

/// Contest spellings that differ between election years, after upper-casing and
/// whitespace collapse.
const OFFICE_ALIASES: &[(&str, &str)] = &[
    ("PRESIDENT", "US PRESIDENT"),
    ("PRESIDENT AND VICE PRESIDENT OF THE UNITED STATES", "US PRESIDENT"),
    ("PRESIDENT OF THE UNITED STATES", "US PRESIDENT"),
    ("UNITED STATES SENATE", "US SENATE"),
    ("U.S. SENATE", "US SENATE"),
    ("U.S. PRESIDENT", "US PRESIDENT"),
    ("NC GOVERNOR", "GOVERNOR"),
    ("NC LIEUTENANT GOVERNOR", "LIEUTENANT GOVERNOR"),
    ("NC ATTORNEY GENERAL", "ATTORNEY GENERAL"),
    ("NC SECRETARY OF STATE", "SECRETARY OF STATE"),
];

pub fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn normalize_contest(raw: &str) -> String {
    let contest = collapse_whitespace(raw).to_ascii_uppercase();
    OFFICE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == contest)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(contest)
}

/// Normalizes records against an injected county reference.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer<'a> {
    reference: &'a CountyReference,
    reference_year: Option<i32>,
}

impl<'a> Normalizer<'a> {
    pub fn new(reference: &'a CountyReference, reference_year: Option<i32>) -> Self {
        Self {
            reference,
            reference_year,
        }
    }

    pub fn voter(&self, raw: &RawVoterRecord) -> Result<CanonicalVoterRecord, RecordError> {
        let county = self
            .reference
            .resolve(&raw.county_desc, raw.county_id)
            .map_err(|err| err.with_line(raw.line_no))?;
        let reference_year = self
            .reference_year
            .unwrap_or_else(|| raw.snapshot_date.year());
        Ok(CanonicalVoterRecord {
            identity: VoterIdentity::derive(&raw.ncid, &raw.voter_reg_num, &county.fips_code),
            snapshot_date: raw.snapshot_date,
            seq: raw.seq,
            county: county.county_name.clone(),
            fips_code: county.fips_code.clone(),
            party: Party::from_code(&raw.party_cd),
            race: Race::from_code(&raw.race_code),
            ethnicity: Ethnicity::from_code(&raw.ethnic_code),
            gender: Gender::from_code(&raw.gender_code),
            status: VoterStatus::from_code(&raw.status_cd),
            age_bucket: AgeBucket::from_birth_year(&raw.birth_year, reference_year),
            precinct: collapse_whitespace(&raw.precinct_desc).to_ascii_uppercase(),
        })
    }

    /// Builds the aggregate key for an election row. Vote validation is left to the
    /// election aggregator.
    pub fn election_key(&self, raw: &RawElectionRow) -> Result<ElectionKey, RecordError> {
        let county = self
            .reference
            .resolve(&raw.county, None)
            .map_err(|err| err.with_line(raw.line_no))?;
        Ok(ElectionKey {
            election_date: raw.election_date,
            county: county.county_name.clone(),
            precinct: collapse_whitespace(&raw.precinct).to_ascii_uppercase(),
            contest: normalize_contest(&raw.contest_name),
            district: collapse_whitespace(&raw.district).to_ascii_uppercase(),
            candidate: collapse_whitespace(&raw.candidate_name),
            party: Party::from_code(&raw.party_abbrv),
        })
    }
}
