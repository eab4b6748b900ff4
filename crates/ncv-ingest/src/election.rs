//! Precinct-level election results (`results_pct_YYYYMMDD.txt`).

use chrono::NaiveDate;
use ncv_core::{RawElectionRow, RecordError};
use uuid::Uuid;

use crate::delimited::{Layout, Record, RowParser};

pub static ELECTION_LAYOUT: Layout = Layout {
    name: "election",
    columns: &[
        "county",
        "election_dt",
        "precinct",
        "contest_name",
        "district",
        "candidate_name",
        "party_abbrv",
        "votes",
    ],
    required: &[
        "county",
        "election_dt",
        "precinct",
        "contest_name",
        "candidate_name",
        "votes",
    ],
    min_fields: 8,
    // Spellings used by the State Board's published results files.
    aliases: &[
        ("county_name", "county"),
        ("election_date", "election_dt"),
        ("contest", "contest_name"),
        ("choice", "candidate_name"),
        ("candidate", "candidate_name"),
        ("choice_party", "party_abbrv"),
        ("party", "party_abbrv"),
        ("total_votes", "votes"),
    ],
};

/// Parses results rows for one election window. A row dated outside the window is
/// malformed for this run.
#[derive(Debug, Clone)]
pub struct ElectionParser {
    pub load_id: Uuid,
    pub election_date: NaiveDate,
    pub source_file: String,
}

impl ElectionParser {
    pub fn new(load_id: Uuid, election_date: NaiveDate, source_file: impl Into<String>) -> Self {
        Self {
            load_id,
            election_date,
            source_file: source_file.into(),
        }
    }
}

impl RowParser for ElectionParser {
    type Row = RawElectionRow;

    fn layout(&self) -> &'static Layout {
        &ELECTION_LAYOUT
    }

    fn parse(&self, record: &Record<'_>) -> Result<RawElectionRow, RecordError> {
        let election_date = record
            .date("election_dt")?
            .ok_or_else(|| record.malformed("missing election_dt"))?;
        if election_date != self.election_date {
            return Err(record.malformed(format!(
                "election date {election_date} outside load window {}",
                self.election_date
            )));
        }
        Ok(RawElectionRow {
            load_id: self.load_id,
            snapshot_date: self.election_date,
            source_file: self.source_file.clone(),
            line_no: record.line(),
            seq: 0,
            county: record.required("county")?,
            election_date,
            precinct: record.text("precinct").to_string(),
            contest_name: record.required("contest_name")?,
            district: record.text("district").to_string(),
            candidate_name: record.required("candidate_name")?,
            party_abbrv: record.text("party_abbrv").to_string(),
            votes: record.text("votes").to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SnapshotReader;
    use std::io::Cursor;

    fn parse(text: &str) -> crate::ParsedBatch<RawElectionRow> {
        let parser = ElectionParser::new(
            Uuid::nil(),
            NaiveDate::from_ymd_opt(2024, 11, 5).unwrap(),
            "results_pct_20241105.txt",
        );
        SnapshotReader::new(Cursor::new(text.as_bytes().to_vec()), parser, "results.txt")
            .read_to_end()
            .unwrap()
    }

    #[test]
    fn positional_rows_keep_votes_unparsed() {
        let parsed = parse("WAKE\t11/05/2024\t01-01\tUS PRESIDENT\t\tJANE DOE\tDEM\t-5\n");
        assert!(parsed.errors.is_empty());
        assert_eq!(parsed.rows[0].votes, "-5");
        assert_eq!(parsed.rows[0].district, "");
    }

    #[test]
    fn state_board_header_is_recognized() {
        let text = "County\tElection Date\tPrecinct\tContest Group ID\tContest Type\tContest Name\t\
            Choice\tChoice Party\tVote For\tElection Day\tTotal Votes\n\
            WAKE\t11/05/2024\t01-01\t1\tS\tUS PRESIDENT\tJANE DOE\tDEM\t1\t10\t42\n";
        let parsed = parse(text);
        assert!(parsed.errors.is_empty(), "{:?}", parsed.errors);
        let row = &parsed.rows[0];
        assert_eq!(row.candidate_name, "JANE DOE");
        assert_eq!(row.party_abbrv, "DEM");
        assert_eq!(row.votes, "42");
        assert_eq!(row.line_no, 2);
    }

    #[test]
    fn rows_from_another_election_are_malformed() {
        let parsed = parse("WAKE\t03/05/2024\t01-01\tUS PRESIDENT\t\tJANE DOE\tDEM\t5\n");
        assert!(parsed.rows.is_empty());
        assert!(matches!(parsed.errors[0], RecordError::Malformed { line: 1, .. }));
    }
}
