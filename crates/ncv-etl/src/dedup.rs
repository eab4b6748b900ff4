//! Collapses canonical voter records to one survivor per identity.

use std::collections::HashMap;

use ncv_core::{CanonicalVoterRecord, VoterIdentity};

#[derive(Debug, Default)]
pub struct DedupOutcome {
    pub records: Vec<CanonicalVoterRecord>,
    pub deduplicated_away: u64,
}

/// Single pass keyed by [`VoterIdentity`]. The survivor of each identity is the
/// record with the greatest `(snapshot_date, seq)`; equal pairs go to the later
/// input. Output keeps the order in which identities first appeared.
pub fn deduplicate(records: impl IntoIterator<Item = CanonicalVoterRecord>) -> DedupOutcome {
    let mut slots: HashMap<VoterIdentity, usize> = HashMap::new();
    let mut survivors: Vec<CanonicalVoterRecord> = Vec::new();
    let mut deduplicated_away = 0u64;

    for record in records {
        match slots.get(&record.identity) {
            Some(&slot) => {
                deduplicated_away += 1;
                let current = &survivors[slot];
                if (record.snapshot_date, record.seq) >= (current.snapshot_date, current.seq) {
                    survivors[slot] = record;
                }
            }
            None => {
                slots.insert(record.identity.clone(), survivors.len());
                survivors.push(record);
            }
        }
    }

    DedupOutcome {
        records: survivors,
        deduplicated_away,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ncv_core::{AgeBucket, Ethnicity, Gender, Party, Race, VoterStatus};
    use std::collections::HashSet;

    fn record(ncid: &str, day: u32, seq: i64, party: Party) -> CanonicalVoterRecord {
        CanonicalVoterRecord {
            identity: VoterIdentity::derive(ncid, "1", "37183"),
            snapshot_date: NaiveDate::from_ymd_opt(2024, 10, day).unwrap(),
            seq,
            county: "Wake".into(),
            fips_code: "37183".into(),
            party,
            race: Race::White,
            ethnicity: Ethnicity::NotHispanic,
            gender: Gender::Female,
            status: VoterStatus::Active,
            age_bucket: AgeBucket::From36To50,
            precinct: "01".into(),
        }
    }

    #[test]
    fn latest_snapshot_wins_regardless_of_input_order() {
        let out = deduplicate(vec![
            record("A1", 10, 1, Party::Dem),
            record("A1", 1, 2, Party::Rep),
            record("B2", 1, 3, Party::Una),
        ]);
        assert_eq!(out.deduplicated_away, 1);
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.records[0].party, Party::Dem);
        assert_eq!(out.records[1].identity, VoterIdentity::Ncid("B2".into()));
    }

    #[test]
    fn same_snapshot_breaks_ties_by_insertion_sequence() {
        let out = deduplicate(vec![
            record("A1", 10, 5, Party::Dem),
            record("A1", 10, 9, Party::Lib),
            record("A1", 10, 7, Party::Rep),
        ]);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].party, Party::Lib);
        assert_eq!(out.deduplicated_away, 2);
    }

    #[test]
    fn identical_positions_resolve_to_the_later_input() {
        let out = deduplicate(vec![record("A1", 10, 5, Party::Dem), record("A1", 10, 5, Party::Gre)]);
        assert_eq!(out.records[0].party, Party::Gre);
    }

    #[test]
    fn output_has_unique_identities_and_conserves_count() {
        let input = (0..500)
            .map(|i| record(&format!("N{}", i % 120), 1 + (i % 20) as u32, i as i64, Party::Dem))
            .collect::<Vec<_>>();
        let n = input.len() as u64;
        let out = deduplicate(input);
        let unique = out.records.iter().map(|r| &r.identity).collect::<HashSet<_>>();
        assert_eq!(unique.len(), out.records.len());
        assert_eq!(out.records.len(), 120);
        assert_eq!(out.records.len() as u64 + out.deduplicated_away, n);
    }
}
