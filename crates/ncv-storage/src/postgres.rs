use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::NaiveDate;
use ncv_core::{
    CountyEntry, ElectionKey, ElectionResultRow, LoadWindow, RawElectionRow, RawVoterRecord,
    RegistrationAggregateRow, RegistrationKey, VocabularyError,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::migrate::{MigrationStep, ELECTION_KEY_COLUMNS, REGISTRATION_KEY_COLUMNS};
use crate::{
    check_election_rows, check_registration_rows, diff_window, index_rows, window_lock_key,
    StoreError, UpsertOutcome, WarehouseStore, WindowWriter,
};

/// Rows per multi-row INSERT; keeps bind counts well under the protocol limit.
const INSERT_CHUNK: usize = 1_000;

/// Serializes concurrent `migrate` invocations.
const MIGRATION_LOCK_KEY: i64 = 0x6e63_765f_6d69_6772;

const REGISTRATION_TABLE: &str = "registration.voter_registration";
const ELECTION_TABLE: &str = "elections.election_results";

const RAW_VOTER_INSERT_COLUMNS: &str = "load_id, snapshot_date, source_file, line_no, county_id, \
     county_desc, voter_reg_num, ncid, status_cd, registr_dt, race_code, ethnic_code, party_cd, \
     gender_code, birth_year, precinct_abbrv, precinct_desc, municipality_abbrv, ward_abbrv, \
     cong_dist_abbrv, nc_senate_abbrv, nc_house_abbrv, ssn, no_dl_ssn_chkbx, hava_id_req";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    async fn ensure_migrations_table(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS public.schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn decode_vocab<T>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T: FromStr<Err = VocabularyError>,
{
    let raw: String = row.try_get(column)?;
    T::from_str(&raw).map_err(|err| StoreError::Decode(format!("{column}: {err}")))
}

fn decode_county_id(value: Option<i16>) -> Result<Option<u16>, StoreError> {
    value
        .map(|v| u16::try_from(v).map_err(|_| StoreError::Decode(format!("county_id {v}"))))
        .transpose()
}

fn encode_county_id(value: Option<u16>) -> Option<i16> {
    value.and_then(|v| i16::try_from(v).ok())
}

fn registration_key_from_row(row: &PgRow) -> Result<RegistrationKey, StoreError> {
    Ok(RegistrationKey {
        registration_date: row.try_get("registration_date")?,
        county: row.try_get("county")?,
        party: decode_vocab(row, "party")?,
        race: decode_vocab(row, "race")?,
        ethnicity: decode_vocab(row, "ethnicity")?,
        gender: decode_vocab(row, "gender")?,
        age_bucket: decode_vocab(row, "age_bucket")?,
    })
}

fn election_key_from_row(row: &PgRow) -> Result<ElectionKey, StoreError> {
    Ok(ElectionKey {
        election_date: row.try_get("election_date")?,
        county: row.try_get("county")?,
        precinct: row.try_get("precinct")?,
        contest: row.try_get("contest")?,
        district: row.try_get("district")?,
        candidate: row.try_get("candidate")?,
        party: decode_vocab(row, "party")?,
    })
}

/// `DELETE` for keys of one window that the incoming publish no longer carries.
/// `$1` is the window date, `$2..` are text arrays for the remaining key columns.
pub(crate) fn stale_delete_sql(table: &str, key_columns: &[&str]) -> String {
    let (date_column, rest) = key_columns.split_first().map_or(("", &[][..]), |(d, r)| (*d, r));
    let arrays = (0..rest.len())
        .map(|i| format!("${}::text[]", i + 2))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "DELETE FROM {table} WHERE {date_column} = $1 AND ({}) IN (SELECT * FROM UNNEST({arrays}))",
        rest.join(", ")
    )
}

pub(crate) fn upsert_conflict_sql(key_columns: &[&str], value_column: &str) -> String {
    format!(
        " ON CONFLICT ({}) DO UPDATE SET {value_column} = EXCLUDED.{value_column}, updated_at = now()",
        key_columns.join(", ")
    )
}

#[async_trait]
impl WarehouseStore for PgStore {
    async fn schema_version(&self) -> Result<u32, StoreError> {
        self.ensure_migrations_table().await?;
        let version: i32 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM public.schema_migrations")
                .fetch_one(&self.pool)
                .await?;
        u32::try_from(version).map_err(|_| StoreError::Decode(format!("schema version {version}")))
    }

    async fn apply_migration(&self, step: &MigrationStep) -> Result<(), StoreError> {
        self.ensure_migrations_table().await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        for op in &step.ops {
            let sql = op.to_sql();
            debug!(version = step.version, %sql, "executing migration op");
            sqlx::query(&sql).execute(&mut *tx).await?;
        }
        sqlx::query(
            "INSERT INTO public.schema_migrations (version, name) VALUES ($1, $2) \
             ON CONFLICT (version) DO NOTHING",
        )
        .bind(step.version as i32)
        .bind(step.name)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_counties(&self, entries: &[CountyEntry]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for entry in entries {
            let result = sqlx::query(
                r#"
                INSERT INTO public.counties (fips_code, county_name, county_id)
                VALUES ($1, $2, $3)
                ON CONFLICT (fips_code) DO UPDATE
                   SET county_name = EXCLUDED.county_name,
                       county_id = EXCLUDED.county_id,
                       updated_at = now()
                "#,
            )
            .bind(&entry.fips_code)
            .bind(&entry.county_name)
            .bind(encode_county_id(entry.county_id))
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn append_raw_voters(&self, rows: &[RawVoterRecord]) -> Result<u64, StoreError> {
        let mut written = 0;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO raw.raw_voters ({RAW_VOTER_INSERT_COLUMNS}) "
            ));
            builder.push_values(chunk, |mut b, r| {
                b.push_bind(r.load_id)
                    .push_bind(r.snapshot_date)
                    .push_bind(&r.source_file)
                    .push_bind(r.line_no as i64)
                    .push_bind(encode_county_id(r.county_id))
                    .push_bind(&r.county_desc)
                    .push_bind(&r.voter_reg_num)
                    .push_bind(&r.ncid)
                    .push_bind(&r.status_cd)
                    .push_bind(r.registr_dt)
                    .push_bind(&r.race_code)
                    .push_bind(&r.ethnic_code)
                    .push_bind(&r.party_cd)
                    .push_bind(&r.gender_code)
                    .push_bind(&r.birth_year)
                    .push_bind(&r.precinct_abbrv)
                    .push_bind(&r.precinct_desc)
                    .push_bind(&r.municipality_abbrv)
                    .push_bind(&r.ward_abbrv)
                    .push_bind(&r.cong_dist_abbrv)
                    .push_bind(&r.nc_senate_abbrv)
                    .push_bind(&r.nc_house_abbrv)
                    .push_bind(&r.ssn)
                    .push_bind(&r.no_dl_ssn_chkbx)
                    .push_bind(&r.hava_id_req);
            });
            written += builder.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(written)
    }

    async fn raw_voters_for_load(
        &self,
        snapshot_date: NaiveDate,
        load_id: Uuid,
    ) -> Result<Vec<RawVoterRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT seq, {RAW_VOTER_INSERT_COLUMNS} FROM raw.raw_voters \
             WHERE snapshot_date = $1 AND load_id = $2 ORDER BY seq"
        ))
        .bind(snapshot_date)
        .bind(load_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let line_no: i64 = row.try_get("line_no")?;
            out.push(RawVoterRecord {
                load_id: row.try_get("load_id")?,
                snapshot_date: row.try_get("snapshot_date")?,
                source_file: row.try_get("source_file")?,
                line_no: line_no.max(0) as u64,
                seq: row.try_get("seq")?,
                county_id: decode_county_id(row.try_get("county_id")?)?,
                county_desc: row.try_get("county_desc")?,
                voter_reg_num: row.try_get("voter_reg_num")?,
                ncid: row.try_get("ncid")?,
                status_cd: row.try_get("status_cd")?,
                registr_dt: row.try_get("registr_dt")?,
                race_code: row.try_get("race_code")?,
                ethnic_code: row.try_get("ethnic_code")?,
                party_cd: row.try_get("party_cd")?,
                gender_code: row.try_get("gender_code")?,
                birth_year: row.try_get("birth_year")?,
                precinct_abbrv: row.try_get("precinct_abbrv")?,
                precinct_desc: row.try_get("precinct_desc")?,
                municipality_abbrv: row.try_get("municipality_abbrv")?,
                ward_abbrv: row.try_get("ward_abbrv")?,
                cong_dist_abbrv: row.try_get("cong_dist_abbrv")?,
                nc_senate_abbrv: row.try_get("nc_senate_abbrv")?,
                nc_house_abbrv: row.try_get("nc_house_abbrv")?,
                ssn: row.try_get("ssn")?,
                no_dl_ssn_chkbx: row.try_get("no_dl_ssn_chkbx")?,
                hava_id_req: row.try_get("hava_id_req")?,
            });
        }
        Ok(out)
    }

    async fn append_raw_election_rows(&self, rows: &[RawElectionRow]) -> Result<u64, StoreError> {
        let mut written = 0;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO raw.raw_election_results (load_id, snapshot_date, source_file, \
                 line_no, county, election_date, precinct, contest_name, district, \
                 candidate_name, party_abbrv, votes) ",
            );
            builder.push_values(chunk, |mut b, r| {
                b.push_bind(r.load_id)
                    .push_bind(r.snapshot_date)
                    .push_bind(&r.source_file)
                    .push_bind(r.line_no as i64)
                    .push_bind(&r.county)
                    .push_bind(r.election_date)
                    .push_bind(&r.precinct)
                    .push_bind(&r.contest_name)
                    .push_bind(&r.district)
                    .push_bind(&r.candidate_name)
                    .push_bind(&r.party_abbrv)
                    .push_bind(&r.votes);
            });
            written += builder.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(written)
    }

    async fn claim_window(&self, window: LoadWindow) -> Result<Box<dyn WindowWriter>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
            .bind(window_lock_key(window))
            .fetch_one(&mut *tx)
            .await?;
        if !locked {
            return Err(StoreError::ConcurrentLoad { window });
        }
        info!(%window, "claimed load window");
        Ok(Box::new(PgWindowWriter { tx, window }))
    }

    async fn registration_rows(
        &self,
        registration_date: NaiveDate,
    ) -> Result<Vec<RegistrationAggregateRow>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {}, total FROM {REGISTRATION_TABLE} WHERE registration_date = $1 ORDER BY {}",
            REGISTRATION_KEY_COLUMNS.join(", "),
            REGISTRATION_KEY_COLUMNS.join(", ")
        ))
        .bind(registration_date)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(RegistrationAggregateRow {
                    key: registration_key_from_row(row)?,
                    total: row.try_get("total")?,
                })
            })
            .collect()
    }

    async fn election_rows(
        &self,
        election_date: NaiveDate,
    ) -> Result<Vec<ElectionResultRow>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {}, votes FROM {ELECTION_TABLE} WHERE election_date = $1 ORDER BY {}",
            ELECTION_KEY_COLUMNS.join(", "),
            ELECTION_KEY_COLUMNS.join(", ")
        ))
        .bind(election_date)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(ElectionResultRow {
                    key: election_key_from_row(row)?,
                    votes: row.try_get("votes")?,
                })
            })
            .collect()
    }
}

/// Holds the window's advisory lock for the lifetime of its transaction. Dropping it
/// rolls the transaction back and releases the lock.
struct PgWindowWriter {
    tx: Transaction<'static, Postgres>,
    window: LoadWindow,
}

#[async_trait]
impl WindowWriter for PgWindowWriter {
    async fn publish_registration(
        &mut self,
        rows: &[RegistrationAggregateRow],
    ) -> Result<UpsertOutcome, StoreError> {
        check_registration_rows(self.window, rows)?;
        let incoming = index_rows(self.window, rows.iter().map(|r| (r.key.clone(), r.total)))?;

        let existing_rows = sqlx::query(&format!(
            "SELECT {}, total FROM {REGISTRATION_TABLE} WHERE registration_date = $1 FOR UPDATE",
            REGISTRATION_KEY_COLUMNS.join(", ")
        ))
        .bind(self.window.date)
        .fetch_all(&mut *self.tx)
        .await?;
        let mut existing = BTreeMap::new();
        for row in &existing_rows {
            existing.insert(registration_key_from_row(row)?, row.try_get::<i64, _>("total")?);
        }

        let diff = diff_window(&existing, &incoming);
        if !diff.stale.is_empty() {
            let mut columns: [Vec<String>; 6] = Default::default();
            for key in &diff.stale {
                columns[0].push(key.county.clone());
                columns[1].push(key.party.as_str().to_string());
                columns[2].push(key.race.as_str().to_string());
                columns[3].push(key.ethnicity.as_str().to_string());
                columns[4].push(key.gender.as_str().to_string());
                columns[5].push(key.age_bucket.as_str().to_string());
            }
            let sql = stale_delete_sql(REGISTRATION_TABLE, REGISTRATION_KEY_COLUMNS);
            let mut query = sqlx::query(&sql).bind(self.window.date);
            for column in columns {
                query = query.bind(column);
            }
            query.execute(&mut *self.tx).await?;
        }

        let changed = incoming
            .iter()
            .filter(|(key, total)| existing.get(*key) != Some(*total))
            .collect::<Vec<_>>();
        for chunk in changed.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {REGISTRATION_TABLE} ({}, total) ",
                REGISTRATION_KEY_COLUMNS.join(", ")
            ));
            builder.push_values(chunk, |mut b, (key, total)| {
                b.push_bind(key.registration_date)
                    .push_bind(&key.county)
                    .push_bind(key.party.as_str())
                    .push_bind(key.race.as_str())
                    .push_bind(key.ethnicity.as_str())
                    .push_bind(key.gender.as_str())
                    .push_bind(key.age_bucket.as_str())
                    .push_bind(**total);
            });
            builder.push(upsert_conflict_sql(REGISTRATION_KEY_COLUMNS, "total"));
            builder.build().execute(&mut *self.tx).await?;
        }
        Ok(diff.outcome)
    }

    async fn publish_election(
        &mut self,
        rows: &[ElectionResultRow],
    ) -> Result<UpsertOutcome, StoreError> {
        check_election_rows(self.window, rows)?;
        let incoming = index_rows(self.window, rows.iter().map(|r| (r.key.clone(), r.votes)))?;

        let existing_rows = sqlx::query(&format!(
            "SELECT {}, votes FROM {ELECTION_TABLE} WHERE election_date = $1 FOR UPDATE",
            ELECTION_KEY_COLUMNS.join(", ")
        ))
        .bind(self.window.date)
        .fetch_all(&mut *self.tx)
        .await?;
        let mut existing = BTreeMap::new();
        for row in &existing_rows {
            existing.insert(election_key_from_row(row)?, row.try_get::<i64, _>("votes")?);
        }

        let diff = diff_window(&existing, &incoming);
        if !diff.stale.is_empty() {
            let mut columns: [Vec<String>; 6] = Default::default();
            for key in &diff.stale {
                columns[0].push(key.county.clone());
                columns[1].push(key.precinct.clone());
                columns[2].push(key.contest.clone());
                columns[3].push(key.district.clone());
                columns[4].push(key.candidate.clone());
                columns[5].push(key.party.as_str().to_string());
            }
            let sql = stale_delete_sql(ELECTION_TABLE, ELECTION_KEY_COLUMNS);
            let mut query = sqlx::query(&sql).bind(self.window.date);
            for column in columns {
                query = query.bind(column);
            }
            query.execute(&mut *self.tx).await?;
        }

        let changed = incoming
            .iter()
            .filter(|(key, votes)| existing.get(*key) != Some(*votes))
            .collect::<Vec<_>>();
        for chunk in changed.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {ELECTION_TABLE} ({}, votes) ",
                ELECTION_KEY_COLUMNS.join(", ")
            ));
            builder.push_values(chunk, |mut b, (key, votes)| {
                b.push_bind(key.election_date)
                    .push_bind(&key.county)
                    .push_bind(&key.precinct)
                    .push_bind(&key.contest)
                    .push_bind(&key.district)
                    .push_bind(&key.candidate)
                    .push_bind(key.party.as_str())
                    .push_bind(**votes);
            });
            builder.push(upsert_conflict_sql(ELECTION_KEY_COLUMNS, "votes"));
            builder.build().execute(&mut *self.tx).await?;
        }
        Ok(diff.outcome)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let window = self.window;
        self.tx.commit().await?;
        info!(%window, "load window committed");
        Ok(())
    }
}
