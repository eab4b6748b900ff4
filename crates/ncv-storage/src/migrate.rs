//! Ordered, versioned, idempotent schema migrations.
//!
//! The plan is replayed against an in-process [`SchemaCatalog`] before anything
//! touches a store, so a step that depends on a table or column created later is
//! rejected up front.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{info, info_span, Instrument};

use crate::{StoreError, WarehouseStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub sql_type: &'static str,
}

const fn col(name: &'static str, sql_type: &'static str) -> ColumnDef {
    ColumnDef { name, sql_type }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaOp {
    CreateSchema {
        schema: &'static str,
    },
    /// `relocated_to` names the schema a later step moves the table into; the table
    /// is not recreated once it lives there.
    CreateTable {
        schema: &'static str,
        table: &'static str,
        columns: &'static [ColumnDef],
        relocated_to: Option<&'static str>,
    },
    AddColumn {
        schema: &'static str,
        table: &'static str,
        column: ColumnDef,
    },
    MoveTable {
        table: &'static str,
        from: &'static str,
        to: &'static str,
    },
    CreateIndex {
        schema: &'static str,
        table: &'static str,
        name: &'static str,
        columns: &'static [&'static str],
        unique: bool,
    },
}

impl SchemaOp {
    /// Postgres DDL for this operation. Every statement is safe to re-run.
    pub fn to_sql(&self) -> String {
        match self {
            SchemaOp::CreateSchema { schema } => format!("CREATE SCHEMA IF NOT EXISTS {schema}"),
            SchemaOp::CreateTable {
                schema,
                table,
                columns,
                relocated_to,
            } => {
                let cols = columns
                    .iter()
                    .map(|c| format!("{} {}", c.name, c.sql_type))
                    .collect::<Vec<_>>()
                    .join(", ");
                let create = format!("CREATE TABLE IF NOT EXISTS {schema}.{table} ({cols})");
                match relocated_to {
                    None => create,
                    Some(to) => format!(
                        r#"DO $$
BEGIN
    IF NOT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_schema = '{to}' AND table_name = '{table}') THEN
        {create};
    END IF;
END $$"#
                    ),
                }
            }
            SchemaOp::AddColumn {
                schema,
                table,
                column,
            } => format!(
                "ALTER TABLE {schema}.{table} ADD COLUMN IF NOT EXISTS {} {}",
                column.name, column.sql_type
            ),
            SchemaOp::MoveTable { table, from, to } => format!(
                r#"DO $$
BEGIN
    IF EXISTS (SELECT 1 FROM information_schema.tables WHERE table_schema = '{from}' AND table_name = '{table}')
       AND NOT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_schema = '{to}' AND table_name = '{table}') THEN
        ALTER TABLE {from}.{table} SET SCHEMA {to};
    END IF;
END $$"#
            ),
            SchemaOp::CreateIndex {
                schema,
                table,
                name,
                columns,
                unique,
            } => format!(
                "CREATE {}INDEX IF NOT EXISTS {name} ON {schema}.{table} ({})",
                if *unique { "UNIQUE " } else { "" },
                columns.join(", ")
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStep {
    pub version: u32,
    pub name: &'static str,
    pub ops: Vec<SchemaOp>,
}

#[derive(Debug, Clone, Default)]
struct TableModel {
    columns: BTreeSet<String>,
}

/// Structural model of a store: schemas, tables with their columns, index names.
#[derive(Debug, Clone)]
pub struct SchemaCatalog {
    schemas: BTreeSet<String>,
    tables: BTreeMap<(String, String), TableModel>,
    indexes: BTreeSet<(String, String)>,
}

impl Default for SchemaCatalog {
    fn default() -> Self {
        Self {
            schemas: BTreeSet::from(["public".to_string()]),
            tables: BTreeMap::new(),
            indexes: BTreeSet::new(),
        }
    }
}

impl SchemaCatalog {
    pub fn has_table(&self, schema: &str, table: &str) -> bool {
        self.tables
            .contains_key(&(schema.to_string(), table.to_string()))
    }

    pub fn has_column(&self, schema: &str, table: &str, column: &str) -> bool {
        self.tables
            .get(&(schema.to_string(), table.to_string()))
            .is_some_and(|t| t.columns.contains(column))
    }

    pub fn has_index(&self, schema: &str, name: &str) -> bool {
        self.indexes.contains(&(schema.to_string(), name.to_string()))
    }

    /// Applies one operation. Returns whether anything changed; an operation whose
    /// prerequisite is missing is an ordering error.
    pub fn apply(&mut self, version: u32, op: &SchemaOp) -> Result<bool, StoreError> {
        let order_err = |detail: String| StoreError::MigrationOrder { version, detail };
        match op {
            SchemaOp::CreateSchema { schema } => Ok(self.schemas.insert(schema.to_string())),
            SchemaOp::CreateTable {
                schema,
                table,
                columns,
                relocated_to,
            } => {
                if !self.schemas.contains(*schema) {
                    return Err(order_err(format!("schema {schema} does not exist yet")));
                }
                let key = (schema.to_string(), table.to_string());
                if self.tables.contains_key(&key) {
                    return Ok(false);
                }
                if relocated_to.is_some_and(|to| self.has_table(to, table)) {
                    return Ok(false);
                }
                self.tables.insert(
                    key,
                    TableModel {
                        columns: columns.iter().map(|c| c.name.to_string()).collect(),
                    },
                );
                Ok(true)
            }
            SchemaOp::AddColumn {
                schema,
                table,
                column,
            } => {
                let Some(model) = self
                    .tables
                    .get_mut(&(schema.to_string(), table.to_string()))
                else {
                    return Err(order_err(format!("table {schema}.{table} does not exist yet")));
                };
                Ok(model.columns.insert(column.name.to_string()))
            }
            SchemaOp::MoveTable { table, from, to } => {
                if !self.schemas.contains(*to) {
                    return Err(order_err(format!("schema {to} does not exist yet")));
                }
                let src = (from.to_string(), table.to_string());
                let dst = (to.to_string(), table.to_string());
                match (self.tables.contains_key(&src), self.tables.contains_key(&dst)) {
                    (_, true) => Ok(false),
                    (true, false) => {
                        if let Some(model) = self.tables.remove(&src) {
                            self.tables.insert(dst, model);
                        }
                        Ok(true)
                    }
                    (false, false) => Err(order_err(format!(
                        "table {from}.{table} does not exist yet"
                    ))),
                }
            }
            SchemaOp::CreateIndex {
                schema,
                table,
                name,
                columns,
                ..
            } => {
                let Some(model) = self.tables.get(&(schema.to_string(), table.to_string())) else {
                    return Err(order_err(format!("table {schema}.{table} does not exist yet")));
                };
                if let Some(missing) = columns.iter().find(|c| !model.columns.contains(**c)) {
                    return Err(order_err(format!(
                        "index {name} needs column {schema}.{table}.{missing}"
                    )));
                }
                Ok(self.indexes.insert((schema.to_string(), name.to_string())))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub from_version: u32,
    pub to_version: u32,
    pub applied: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Migrator {
    steps: Vec<MigrationStep>,
}

impl Migrator {
    /// Validates versions are contiguous from 1 and that every step only depends on
    /// structures created by earlier steps.
    pub fn new(steps: Vec<MigrationStep>) -> Result<Self, StoreError> {
        let mut catalog = SchemaCatalog::default();
        for (idx, step) in steps.iter().enumerate() {
            let expected = idx as u32 + 1;
            if step.version != expected {
                return Err(StoreError::MigrationOrder {
                    version: step.version,
                    detail: format!("expected version {expected} at position {idx}"),
                });
            }
            for op in &step.ops {
                catalog.apply(step.version, op)?;
            }
        }
        Ok(Self { steps })
    }

    pub fn standard() -> Result<Self, StoreError> {
        Self::new(standard_plan())
    }

    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    pub fn latest_version(&self) -> u32 {
        self.steps.last().map(|s| s.version).unwrap_or(0)
    }

    /// Applies a single step. Already-applied steps are a no-op; anything other than
    /// the next version is refused.
    pub async fn apply_step(
        &self,
        store: &dyn WarehouseStore,
        step: &MigrationStep,
    ) -> Result<bool, StoreError> {
        let applied = store.schema_version().await?;
        if step.version <= applied {
            return Ok(false);
        }
        if step.version != applied + 1 {
            return Err(StoreError::MigrationOrder {
                version: step.version,
                detail: format!("store is at version {applied}; refusing to skip ahead"),
            });
        }
        let span = info_span!("migration_step", version = step.version, name = step.name);
        store.apply_migration(step).instrument(span).await?;
        info!(version = step.version, name = step.name, "migration applied");
        Ok(true)
    }

    pub async fn migrate(&self, store: &dyn WarehouseStore) -> Result<MigrationReport, StoreError> {
        let from_version = store.schema_version().await?;
        if from_version > self.latest_version() {
            return Err(StoreError::MigrationOrder {
                version: from_version,
                detail: format!(
                    "store is ahead of this build (latest known version {})",
                    self.latest_version()
                ),
            });
        }
        let mut applied = Vec::new();
        for step in &self.steps {
            if self.apply_step(store, step).await? {
                applied.push(format!("{:03}_{}", step.version, step.name));
            }
        }
        Ok(MigrationReport {
            from_version,
            to_version: store.schema_version().await?,
            applied,
        })
    }
}

const RAW_VOTER_COLUMNS: &[ColumnDef] = &[
    col("seq", "BIGSERIAL PRIMARY KEY"),
    col("load_id", "UUID NOT NULL"),
    col("snapshot_date", "DATE NOT NULL"),
    col("source_file", "TEXT NOT NULL"),
    col("line_no", "BIGINT NOT NULL"),
    col("county_id", "SMALLINT"),
    col("county_desc", "TEXT NOT NULL"),
    col("voter_reg_num", "TEXT NOT NULL"),
    col("ncid", "TEXT NOT NULL"),
    col("status_cd", "TEXT NOT NULL"),
    col("registr_dt", "DATE"),
    col("race_code", "TEXT NOT NULL"),
    col("ethnic_code", "TEXT NOT NULL"),
    col("party_cd", "TEXT NOT NULL"),
    col("gender_code", "TEXT NOT NULL"),
    col("birth_year", "TEXT NOT NULL"),
    col("precinct_abbrv", "TEXT NOT NULL"),
    col("precinct_desc", "TEXT NOT NULL"),
    col("municipality_abbrv", "TEXT"),
    col("ward_abbrv", "TEXT"),
    col("cong_dist_abbrv", "TEXT"),
    col("nc_senate_abbrv", "TEXT"),
    col("nc_house_abbrv", "TEXT"),
    col("loaded_at", "TIMESTAMPTZ NOT NULL DEFAULT now()"),
];

const RAW_ELECTION_COLUMNS: &[ColumnDef] = &[
    col("seq", "BIGSERIAL PRIMARY KEY"),
    col("load_id", "UUID NOT NULL"),
    col("snapshot_date", "DATE NOT NULL"),
    col("source_file", "TEXT NOT NULL"),
    col("line_no", "BIGINT NOT NULL"),
    col("county", "TEXT NOT NULL"),
    col("election_date", "DATE NOT NULL"),
    col("precinct", "TEXT NOT NULL"),
    col("contest_name", "TEXT NOT NULL"),
    col("district", "TEXT NOT NULL"),
    col("candidate_name", "TEXT NOT NULL"),
    col("party_abbrv", "TEXT NOT NULL"),
    col("votes", "TEXT NOT NULL"),
    col("loaded_at", "TIMESTAMPTZ NOT NULL DEFAULT now()"),
];

const COUNTY_COLUMNS: &[ColumnDef] = &[
    col("fips_code", "CHAR(5) NOT NULL"),
    col("county_name", "TEXT NOT NULL"),
    col("county_id", "SMALLINT"),
    col("updated_at", "TIMESTAMPTZ NOT NULL DEFAULT now()"),
];

const VOTER_REGISTRATION_COLUMNS: &[ColumnDef] = &[
    col("registration_date", "DATE NOT NULL"),
    col("county", "TEXT NOT NULL"),
    col("party", "TEXT NOT NULL"),
    col("race", "TEXT NOT NULL"),
    col("ethnicity", "TEXT NOT NULL"),
    col("gender", "TEXT NOT NULL"),
    col("total", "BIGINT NOT NULL"),
    col("updated_at", "TIMESTAMPTZ NOT NULL DEFAULT now()"),
];

const ELECTION_RESULT_COLUMNS: &[ColumnDef] = &[
    col("election_date", "DATE NOT NULL"),
    col("county", "TEXT NOT NULL"),
    col("precinct", "TEXT NOT NULL"),
    col("contest", "TEXT NOT NULL"),
    col("district", "TEXT NOT NULL"),
    col("candidate", "TEXT NOT NULL"),
    col("party", "TEXT NOT NULL"),
    col("votes", "BIGINT NOT NULL"),
    col("updated_at", "TIMESTAMPTZ NOT NULL DEFAULT now()"),
];

pub const REGISTRATION_KEY_COLUMNS: &[&str] = &[
    "registration_date",
    "county",
    "party",
    "race",
    "ethnicity",
    "gender",
    "age_bucket",
];

pub const ELECTION_KEY_COLUMNS: &[&str] = &[
    "election_date",
    "county",
    "precinct",
    "contest",
    "district",
    "candidate",
    "party",
];

/// The migration history of the warehouse, oldest first.
pub fn standard_plan() -> Vec<MigrationStep> {
    vec![
        MigrationStep {
            version: 1,
            name: "create_schemas",
            ops: vec![
                SchemaOp::CreateSchema { schema: "raw" },
                SchemaOp::CreateSchema {
                    schema: "registration",
                },
                SchemaOp::CreateSchema { schema: "elections" },
            ],
        },
        MigrationStep {
            version: 2,
            name: "create_counties",
            ops: vec![
                SchemaOp::CreateTable {
                    schema: "public",
                    table: "counties",
                    columns: COUNTY_COLUMNS,
                    relocated_to: None,
                },
                SchemaOp::CreateIndex {
                    schema: "public",
                    table: "counties",
                    name: "counties_fips_code_key",
                    columns: &["fips_code"],
                    unique: true,
                },
                SchemaOp::CreateIndex {
                    schema: "public",
                    table: "counties",
                    name: "counties_county_name_key",
                    columns: &["county_name"],
                    unique: true,
                },
            ],
        },
        MigrationStep {
            version: 3,
            name: "create_raw_voters",
            ops: vec![SchemaOp::CreateTable {
                schema: "registration",
                table: "raw_voters",
                columns: RAW_VOTER_COLUMNS,
                relocated_to: Some("raw"),
            }],
        },
        MigrationStep {
            version: 4,
            name: "move_raw_voters_to_raw_schema",
            ops: vec![
                SchemaOp::MoveTable {
                    table: "raw_voters",
                    from: "registration",
                    to: "raw",
                },
                SchemaOp::CreateIndex {
                    schema: "raw",
                    table: "raw_voters",
                    name: "raw_voters_snapshot_date_idx",
                    columns: &["snapshot_date", "seq"],
                    unique: false,
                },
            ],
        },
        MigrationStep {
            version: 5,
            name: "raw_voters_2026_layout",
            ops: vec![
                SchemaOp::AddColumn {
                    schema: "raw",
                    table: "raw_voters",
                    column: col("ssn", "TEXT"),
                },
                SchemaOp::AddColumn {
                    schema: "raw",
                    table: "raw_voters",
                    column: col("no_dl_ssn_chkbx", "TEXT"),
                },
                SchemaOp::AddColumn {
                    schema: "raw",
                    table: "raw_voters",
                    column: col("hava_id_req", "TEXT"),
                },
            ],
        },
        MigrationStep {
            version: 6,
            name: "create_raw_election_results",
            ops: vec![
                SchemaOp::CreateTable {
                    schema: "raw",
                    table: "raw_election_results",
                    columns: RAW_ELECTION_COLUMNS,
                    relocated_to: None,
                },
                SchemaOp::CreateIndex {
                    schema: "raw",
                    table: "raw_election_results",
                    name: "raw_election_results_election_date_idx",
                    columns: &["election_date"],
                    unique: false,
                },
            ],
        },
        MigrationStep {
            version: 7,
            name: "create_voter_registration",
            ops: vec![SchemaOp::CreateTable {
                schema: "registration",
                table: "voter_registration",
                columns: VOTER_REGISTRATION_COLUMNS,
                relocated_to: None,
            }],
        },
        MigrationStep {
            version: 8,
            name: "voter_registration_age_bucket",
            ops: vec![
                SchemaOp::AddColumn {
                    schema: "registration",
                    table: "voter_registration",
                    column: col("age_bucket", "TEXT NOT NULL DEFAULT 'UNKNOWN'"),
                },
                SchemaOp::CreateIndex {
                    schema: "registration",
                    table: "voter_registration",
                    name: "voter_registration_key_idx",
                    columns: REGISTRATION_KEY_COLUMNS,
                    unique: true,
                },
                SchemaOp::CreateIndex {
                    schema: "registration",
                    table: "voter_registration",
                    name: "voter_registration_date_idx",
                    columns: &["registration_date"],
                    unique: false,
                },
                SchemaOp::CreateIndex {
                    schema: "registration",
                    table: "voter_registration",
                    name: "voter_registration_county_party_idx",
                    columns: &["county", "party"],
                    unique: false,
                },
            ],
        },
        MigrationStep {
            version: 9,
            name: "create_election_results",
            ops: vec![
                SchemaOp::CreateTable {
                    schema: "elections",
                    table: "election_results",
                    columns: ELECTION_RESULT_COLUMNS,
                    relocated_to: None,
                },
                SchemaOp::CreateIndex {
                    schema: "elections",
                    table: "election_results",
                    name: "election_results_key_idx",
                    columns: ELECTION_KEY_COLUMNS,
                    unique: true,
                },
                SchemaOp::CreateIndex {
                    schema: "elections",
                    table: "election_results",
                    name: "election_results_date_idx",
                    columns: &["election_date"],
                    unique: false,
                },
                SchemaOp::CreateIndex {
                    schema: "elections",
                    table: "election_results",
                    name: "election_results_candidate_party_idx",
                    columns: &["candidate", "party"],
                    unique: false,
                },
                SchemaOp::CreateIndex {
                    schema: "elections",
                    table: "election_results",
                    name: "election_results_contest_district_idx",
                    columns: &["contest", "district"],
                    unique: false,
                },
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    #[test]
    fn standard_plan_validates() {
        let migrator = Migrator::standard().expect("plan is ordered");
        assert_eq!(migrator.latest_version(), 9);
    }

    #[test]
    fn every_op_renders_a_single_statement() {
        let migrator = Migrator::standard().unwrap();
        for step in migrator.steps() {
            for op in &step.ops {
                let sql = op.to_sql();
                assert!(!sql.trim().is_empty(), "step {} renders empty sql", step.version);
                assert!(!sql.contains(';'), "step {}: {sql}", step.version);
            }
        }
    }

    #[test]
    fn index_before_its_column_is_an_order_error() {
        let mut plan = standard_plan();
        // Put the age_bucket index into the step that only creates the table.
        let index = plan[7].ops.remove(1);
        plan[6].ops.push(index);
        let err = Migrator::new(plan).unwrap_err();
        assert!(matches!(err, StoreError::MigrationOrder { version: 7, .. }));
    }

    #[test]
    fn gaps_in_versions_are_rejected() {
        let mut plan = standard_plan();
        plan.remove(2);
        assert!(matches!(
            Migrator::new(plan),
            Err(StoreError::MigrationOrder { version: 4, .. })
        ));
    }

    #[test]
    fn catalog_operations_are_idempotent() {
        let mut catalog = SchemaCatalog::default();
        for step in standard_plan() {
            for op in &step.ops {
                catalog.apply(step.version, op).unwrap();
            }
        }
        for step in standard_plan() {
            for op in &step.ops {
                assert!(!catalog.apply(step.version, op).unwrap(), "{op:?} changed on replay");
            }
        }
        assert!(catalog.has_table("raw", "raw_voters"));
        assert!(!catalog.has_table("registration", "raw_voters"));
        assert!(catalog.has_column("raw", "raw_voters", "hava_id_req"));
        assert!(catalog.has_index("registration", "voter_registration_key_idx"));
    }

    #[test]
    fn ddl_is_guarded_for_reruns() {
        for step in standard_plan() {
            for op in &step.ops {
                let sql = op.to_sql();
                assert!(
                    sql.contains("IF NOT EXISTS") || sql.contains("NOT EXISTS (SELECT 1"),
                    "unguarded ddl: {sql}"
                );
            }
        }
        let add = SchemaOp::AddColumn {
            schema: "raw",
            table: "raw_voters",
            column: col("ssn", "TEXT"),
        };
        assert_eq!(
            add.to_sql(),
            "ALTER TABLE raw.raw_voters ADD COLUMN IF NOT EXISTS ssn TEXT"
        );
    }

    #[tokio::test]
    async fn migrate_twice_is_a_noop() {
        let store = MemoryStore::new();
        let migrator = Migrator::standard().unwrap();
        let first = migrator.migrate(&store).await.unwrap();
        assert_eq!(first.from_version, 0);
        assert_eq!(first.to_version, 9);
        assert_eq!(first.applied.len(), 9);

        let second = migrator.migrate(&store).await.unwrap();
        assert_eq!(second.from_version, 9);
        assert!(second.applied.is_empty());
    }

    #[tokio::test]
    async fn apply_step_refuses_to_skip_ahead() {
        let store = MemoryStore::new();
        let migrator = Migrator::standard().unwrap();
        let step3 = migrator.steps()[2].clone();
        let err = migrator.apply_step(&store, &step3).await.unwrap_err();
        assert!(matches!(err, StoreError::MigrationOrder { version: 3, .. }));
        assert_eq!(store.schema_version().await.unwrap(), 0);

        assert!(migrator.apply_step(&store, &migrator.steps()[0]).await.unwrap());
        assert!(!migrator.apply_step(&store, &migrator.steps()[0]).await.unwrap());
    }
}
