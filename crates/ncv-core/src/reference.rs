//! County/FIPS reference table.
//!
//! The table is an explicitly passed, read-only lookup. Nothing in the workspace keeps
//! a global copy, so tests build their own fixture tables.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::RecordError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountyEntry {
    pub fips_code: String,
    pub county_name: String,
    /// Numeric county id used by the voter file (`county_id`).
    #[serde(default)]
    pub county_id: Option<u16>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CountyReferenceFile {
    #[allow(dead_code)]
    version: u32,
    counties: Vec<CountyEntry>,
}

#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("duplicate fips_code {0} in county reference")]
    DuplicateFips(String),
    #[error("duplicate county name or alias `{0}` in county reference")]
    DuplicateName(String),
    #[error("duplicate county_id {0} in county reference")]
    DuplicateCountyId(u16),
    #[error("invalid fips_code `{0}` (expected 5 digits)")]
    InvalidFips(String),
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing county reference: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Default)]
pub struct CountyReference {
    entries: Vec<CountyEntry>,
    by_name: HashMap<String, usize>,
    by_fips: HashMap<String, usize>,
    by_county_id: HashMap<u16, usize>,
}

fn name_key(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches('"')
        .to_ascii_uppercase()
}

impl CountyReference {
    pub fn from_entries(entries: Vec<CountyEntry>) -> Result<Self, ReferenceError> {
        let mut reference = CountyReference::default();
        for (idx, entry) in entries.iter().enumerate() {
            if entry.fips_code.len() != 5 || !entry.fips_code.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ReferenceError::InvalidFips(entry.fips_code.clone()));
            }
            if reference.by_fips.insert(entry.fips_code.clone(), idx).is_some() {
                return Err(ReferenceError::DuplicateFips(entry.fips_code.clone()));
            }
            for name in std::iter::once(&entry.county_name).chain(entry.aliases.iter()) {
                let key = name_key(name);
                if reference.by_name.insert(key.clone(), idx).is_some() {
                    return Err(ReferenceError::DuplicateName(key));
                }
            }
            if let Some(county_id) = entry.county_id {
                if reference.by_county_id.insert(county_id, idx).is_some() {
                    return Err(ReferenceError::DuplicateCountyId(county_id));
                }
            }
        }
        reference.entries = entries;
        Ok(reference)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ReferenceError> {
        let file: CountyReferenceFile = serde_yaml::from_str(yaml)?;
        Self::from_entries(file.counties)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ReferenceError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ReferenceError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn entries(&self) -> &[CountyEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn by_name(&self, name: &str) -> Option<&CountyEntry> {
        self.by_name.get(&name_key(name)).map(|idx| &self.entries[*idx])
    }

    /// Accepts the full 5-digit code or the 3-digit county part.
    pub fn by_fips(&self, code: &str) -> Option<&CountyEntry> {
        let code = code.trim();
        if let Some(idx) = self.by_fips.get(code) {
            return Some(&self.entries[*idx]);
        }
        if code.len() == 3 {
            return self
                .entries
                .iter()
                .find(|entry| entry.fips_code.ends_with(code));
        }
        None
    }

    pub fn by_county_id(&self, county_id: u16) -> Option<&CountyEntry> {
        self.by_county_id.get(&county_id).map(|idx| &self.entries[*idx])
    }

    /// Resolves a free-form county reference: name or alias first, then the numeric
    /// county id, then a FIPS code.
    pub fn lookup(&self, raw: &str) -> Option<&CountyEntry> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Some(entry) = self.by_name(trimmed) {
            return Some(entry);
        }
        if trimmed.bytes().all(|b| b.is_ascii_digit()) {
            if trimmed.len() >= 3 {
                if let Some(entry) = self.by_fips(trimmed) {
                    return Some(entry);
                }
            }
            if let Ok(county_id) = trimmed.parse::<u16>() {
                return self.by_county_id(county_id);
            }
        }
        None
    }

    /// Resolves a county from a description with a numeric id fallback.
    pub fn resolve(
        &self,
        description: &str,
        county_id: Option<u16>,
    ) -> Result<&CountyEntry, RecordError> {
        if let Some(entry) = self.lookup(description) {
            return Ok(entry);
        }
        if let Some(entry) = county_id.and_then(|id| self.by_county_id(id)) {
            return Ok(entry);
        }
        Err(RecordError::ReferenceResolution {
            line: None,
            reference: match county_id {
                Some(id) => format!("county `{}` (id {id})", description.trim()),
                None => format!("county `{}`", description.trim()),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fips: &str, name: &str, id: u16) -> CountyEntry {
        CountyEntry {
            fips_code: fips.to_string(),
            county_name: name.to_string(),
            county_id: Some(id),
            aliases: vec![],
        }
    }

    fn fixture() -> CountyReference {
        let mut hanover = entry("37129", "New Hanover", 65);
        hanover.aliases.push("NEWHANOVER".into());
        CountyReference::from_entries(vec![
            entry("37183", "Wake", 92),
            entry("37135", "Orange", 68),
            hanover,
        ])
        .unwrap()
    }

    #[test]
    fn resolves_by_name_alias_id_and_fips() {
        let reference = fixture();
        assert_eq!(reference.lookup("wake").unwrap().fips_code, "37183");
        assert_eq!(reference.lookup("  NEW   HANOVER ").unwrap().county_name, "New Hanover");
        assert_eq!(reference.lookup("NewHanover").unwrap().county_name, "New Hanover");
        assert_eq!(reference.lookup("68").unwrap().county_name, "Orange");
        assert_eq!(reference.lookup("37135").unwrap().county_name, "Orange");
        assert_eq!(reference.lookup("183").unwrap().county_name, "Wake");
        assert!(reference.lookup("Atlantis").is_none());
        assert!(reference.lookup("").is_none());
    }

    #[test]
    fn resolve_falls_back_to_county_id() {
        let reference = fixture();
        assert_eq!(reference.resolve("WAKE CO", Some(92)).unwrap().county_name, "Wake");
        let err = reference.resolve("Atlantis", Some(7)).unwrap_err();
        assert!(matches!(err, RecordError::ReferenceResolution { .. }));
    }

    #[test]
    fn rejects_duplicate_names_and_fips() {
        let dup_name = CountyReference::from_entries(vec![
            entry("37183", "Wake", 92),
            entry("37185", "WAKE", 93),
        ]);
        assert!(matches!(dup_name, Err(ReferenceError::DuplicateName(_))));

        let dup_fips = CountyReference::from_entries(vec![
            entry("37183", "Wake", 92),
            entry("37183", "Warren", 93),
        ]);
        assert!(matches!(dup_fips, Err(ReferenceError::DuplicateFips(_))));

        let bad = CountyReference::from_entries(vec![entry("183", "Wake", 92)]);
        assert!(matches!(bad, Err(ReferenceError::InvalidFips(_))));
    }

    #[test]
    fn shipped_reference_file_covers_all_counties() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../data/counties.yaml");
        let reference = CountyReference::load(path).expect("load counties.yaml");
        assert_eq!(reference.len(), 100);
        assert_eq!(reference.by_county_id(92).unwrap().county_name, "Wake");
        assert_eq!(reference.by_fips("37119").unwrap().county_name, "Mecklenburg");
    }
}
