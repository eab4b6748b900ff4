//! Statewide voter registration extract (`ncvoter_Statewide.txt` and county files).

use chrono::NaiveDate;
use ncv_core::{RawVoterRecord, RecordError};
use uuid::Uuid;

use crate::delimited::{Layout, Record, RowParser};

/// Positional column order of the registration extract. The 2026 layout appends the
/// identification checkbox columns; files without them simply end earlier.
pub const REGISTRATION_COLUMNS: &[&str] = &[
    "county_id",
    "county_desc",
    "voter_reg_num",
    "ncid",
    "last_name",
    "first_name",
    "middle_name",
    "name_suffix_lbl",
    "status_cd",
    "voter_status_desc",
    "reason_cd",
    "voter_status_reason_desc",
    "res_street_address",
    "res_city_desc",
    "state_cd",
    "zip_code",
    "mail_addr1",
    "mail_addr2",
    "mail_addr3",
    "mail_addr4",
    "mail_city",
    "mail_state",
    "mail_zipcode",
    "full_phone_number",
    "confidential_ind",
    "registr_dt",
    "race_code",
    "ethnic_code",
    "party_cd",
    "gender_code",
    "birth_year",
    "age_at_year_end",
    "birth_state",
    "drivers_lic",
    "precinct_abbrv",
    "precinct_desc",
    "municipality_abbrv",
    "municipality_desc",
    "ward_abbrv",
    "ward_desc",
    "cong_dist_abbrv",
    "super_court_abbrv",
    "judic_dist_abbrv",
    "nc_senate_abbrv",
    "nc_house_abbrv",
    "county_commiss_abbrv",
    "county_commiss_desc",
    "township_abbrv",
    "township_desc",
    "school_dist_abbrv",
    "school_dist_desc",
    "fire_dist_abbrv",
    "fire_dist_desc",
    "water_dist_abbrv",
    "water_dist_desc",
    "sewer_dist_abbrv",
    "sewer_dist_desc",
    "sanit_dist_abbrv",
    "sanit_dist_desc",
    "rescue_dist_abbrv",
    "rescue_dist_desc",
    "munic_dist_abbrv",
    "munic_dist_desc",
    "dist_1_abbrv",
    "dist_1_desc",
    "vtd_abbrv",
    "vtd_desc",
    "ssn",
    "no_dl_ssn_chkbx",
    "hava_id_req",
];

pub static REGISTRATION_LAYOUT: Layout = Layout {
    name: "registration",
    columns: REGISTRATION_COLUMNS,
    required: &[
        "county_id",
        "county_desc",
        "voter_reg_num",
        "ncid",
        "status_cd",
        "registr_dt",
        "race_code",
        "ethnic_code",
        "party_cd",
        "gender_code",
        "birth_year",
        "precinct_abbrv",
        "precinct_desc",
    ],
    // Everything through precinct_desc.
    min_fields: 36,
    aliases: &[],
};

/// Turns registration records into [`RawVoterRecord`]s tagged for one load.
#[derive(Debug, Clone)]
pub struct RegistrationParser {
    pub load_id: Uuid,
    pub snapshot_date: NaiveDate,
    pub source_file: String,
}

impl RegistrationParser {
    pub fn new(load_id: Uuid, snapshot_date: NaiveDate, source_file: impl Into<String>) -> Self {
        Self {
            load_id,
            snapshot_date,
            source_file: source_file.into(),
        }
    }
}

impl RowParser for RegistrationParser {
    type Row = RawVoterRecord;

    fn layout(&self) -> &'static Layout {
        &REGISTRATION_LAYOUT
    }

    fn parse(&self, record: &Record<'_>) -> Result<RawVoterRecord, RecordError> {
        let county_id = match record.text("county_id") {
            "" => None,
            raw => Some(
                raw.parse::<u16>()
                    .map_err(|_| record.malformed(format!("county_id `{raw}` is not a number")))?,
            ),
        };
        let county_desc = record.text("county_desc").to_string();
        if county_id.is_none() && county_desc.is_empty() {
            return Err(record.malformed("neither county_id nor county_desc present"));
        }

        Ok(RawVoterRecord {
            load_id: self.load_id,
            snapshot_date: self.snapshot_date,
            source_file: self.source_file.clone(),
            line_no: record.line(),
            seq: 0,
            county_id,
            county_desc,
            voter_reg_num: record.required("voter_reg_num")?,
            ncid: record.text("ncid").to_string(),
            status_cd: record.text("status_cd").to_string(),
            registr_dt: record.date("registr_dt")?,
            race_code: record.text("race_code").to_string(),
            ethnic_code: record.text("ethnic_code").to_string(),
            party_cd: record.text("party_cd").to_string(),
            gender_code: record.text("gender_code").to_string(),
            birth_year: record.text("birth_year").to_string(),
            precinct_abbrv: record.text("precinct_abbrv").to_string(),
            precinct_desc: record.text("precinct_desc").to_string(),
            municipality_abbrv: record.optional("municipality_abbrv"),
            ward_abbrv: record.optional("ward_abbrv"),
            cong_dist_abbrv: record.optional("cong_dist_abbrv"),
            nc_senate_abbrv: record.optional("nc_senate_abbrv"),
            nc_house_abbrv: record.optional("nc_house_abbrv"),
            ssn: record.optional("ssn"),
            no_dl_ssn_chkbx: record.optional("no_dl_ssn_chkbx"),
            hava_id_req: record.optional("hava_id_req"),
        })
    }
}
