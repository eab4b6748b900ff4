//! Snapshot file ingestion: delimited-record readers for the voter registration and
//! election results layouts, plus the scraper's download manifest.

use std::path::PathBuf;

use thiserror::Error;

mod delimited;
pub mod election;
pub mod manifest;
pub mod registration;

pub use delimited::{
    parse_date, split_record, ColumnMap, Layout, ParsedBatch, Record, RowParser, SnapshotReader,
};
pub use election::{ElectionParser, ELECTION_LAYOUT};
pub use manifest::{latest_file, load_manifest, resolve_latest, ManifestEntry};
pub use registration::{RegistrationParser, REGISTRATION_LAYOUT};

pub const CRATE_NAME: &str = "ncv-ingest";

/// File-level failures. Unlike record errors these stop the load of the file.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{layout} header is missing required columns: {}", missing.join(", "))]
    MissingColumns {
        layout: &'static str,
        missing: Vec<String>,
    },
    #[error("parsing manifest {}: {source}", path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no `{file_type}` entry in manifest {}", path.display())]
    NoManifestEntry { path: PathBuf, file_type: String },
}
