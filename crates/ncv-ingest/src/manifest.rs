//! The scraper's download manifest (`data/raw/manifest.json`).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::LoadError;

pub const REGISTRATION_FILE_TYPE: &str = "registration_data";
pub const RESULTS_FILE_TYPE: &str = "results_data";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub filename: String,
    pub url: String,
    /// Older manifests predate typed entries.
    #[serde(default)]
    pub file_type: Option<String>,
    pub downloaded_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: JsonValue,
}

/// Reads the manifest; a missing file is an empty manifest.
pub fn load_manifest(path: impl AsRef<Path>) -> Result<Vec<ManifestEntry>, LoadError> {
    let path = path.as_ref();
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "manifest not found");
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(LoadError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&text).map_err(|source| LoadError::Manifest {
        path: path.to_path_buf(),
        source,
    })
}

/// Most recently downloaded entry of `file_type`.
pub fn latest_file<'a>(entries: &'a [ManifestEntry], file_type: &str) -> Option<&'a ManifestEntry> {
    entries
        .iter()
        .filter(|e| e.file_type.as_deref() == Some(file_type))
        .max_by_key(|e| e.downloaded_at)
}

/// Path of the latest `file_type` download, relative to the manifest's directory.
pub fn resolve_latest(manifest_path: impl AsRef<Path>, file_type: &str) -> Result<PathBuf, LoadError> {
    let manifest_path = manifest_path.as_ref();
    let entries = load_manifest(manifest_path)?;
    let entry = latest_file(&entries, file_type).ok_or_else(|| LoadError::NoManifestEntry {
        path: manifest_path.to_path_buf(),
        file_type: file_type.to_string(),
    })?;
    let dir = manifest_path.parent().unwrap_or_else(|| Path::new("."));
    let path = dir.join(&entry.filename);
    info!(file_type, path = %path.display(), "resolved latest download from manifest");
    Ok(path)
}
