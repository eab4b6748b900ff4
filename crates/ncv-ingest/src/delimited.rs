use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use ncv_core::RecordError;
use tracing::{debug, warn};

use crate::LoadError;

/// Column layout of one snapshot file type.
#[derive(Debug)]
pub struct Layout {
    pub name: &'static str,
    /// Positional order used when the file carries no header row.
    pub columns: &'static [&'static str],
    /// Columns a header row must name.
    pub required: &'static [&'static str],
    /// Minimum field count for headerless rows.
    pub min_fields: usize,
    /// Alternative header spellings, already normalized, mapped to layout columns.
    pub aliases: &'static [(&'static str, &'static str)],
}

impl Layout {
    fn canonical_header(&self, cell: &str) -> String {
        let normalized = cell
            .trim()
            .to_ascii_lowercase()
            .split(|c: char| c.is_whitespace() || c == '-')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("_");
        self.aliases
            .iter()
            .find(|(alias, _)| *alias == normalized)
            .map(|(_, column)| column.to_string())
            .unwrap_or(normalized)
    }

    /// A header either starts with the layout's first column or names every
    /// required column.
    pub fn is_header(&self, cells: &[String]) -> bool {
        let names = cells
            .iter()
            .map(|c| self.canonical_header(c))
            .collect::<Vec<_>>();
        let leads = names
            .first()
            .zip(self.columns.first())
            .is_some_and(|(name, first)| name == first);
        leads || self.required.iter().all(|r| names.iter().any(|n| n == r))
    }
}

/// Field positions for one file, from its header or the positional layout.
#[derive(Debug, Clone)]
pub struct ColumnMap {
    indices: HashMap<&'static str, usize>,
    min_fields: usize,
}

impl ColumnMap {
    pub fn positional(layout: &Layout) -> Self {
        Self {
            indices: layout
                .columns
                .iter()
                .enumerate()
                .map(|(i, c)| (*c, i))
                .collect(),
            min_fields: layout.min_fields,
        }
    }

    pub fn from_header(layout: &'static Layout, cells: &[String]) -> Result<Self, LoadError> {
        let mut indices = HashMap::new();
        for (i, cell) in cells.iter().enumerate() {
            let name = layout.canonical_header(cell);
            if let Some(column) = layout.columns.iter().find(|c| **c == name) {
                indices.entry(*column).or_insert(i);
            }
        }
        let missing = layout
            .required
            .iter()
            .filter(|c| !indices.contains_key(*c))
            .map(|c| c.to_string())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(LoadError::MissingColumns {
                layout: layout.name,
                missing,
            });
        }
        let min_fields = layout
            .required
            .iter()
            .filter_map(|c| indices.get(c))
            .max()
            .map_or(0, |i| i + 1);
        Ok(Self {
            indices,
            min_fields,
        })
    }

    pub fn index(&self, column: &str) -> Option<usize> {
        self.indices.get(column).copied()
    }

    pub fn min_fields(&self) -> usize {
        self.min_fields
    }
}

/// One data row with typed accessors over its cells.
pub struct Record<'a> {
    line: u64,
    cells: &'a [String],
    columns: &'a ColumnMap,
}

impl<'a> Record<'a> {
    pub fn new(line: u64, cells: &'a [String], columns: &'a ColumnMap) -> Self {
        Self {
            line,
            cells,
            columns,
        }
    }

    pub fn line(&self) -> u64 {
        self.line
    }

    pub fn malformed(&self, reason: impl Into<String>) -> RecordError {
        RecordError::Malformed {
            line: self.line,
            reason: reason.into(),
        }
    }

    /// Trimmed cell text; empty when the column is absent from this file.
    pub fn text(&self, column: &str) -> &'a str {
        self.columns
            .index(column)
            .and_then(|i| self.cells.get(i))
            .map(|s| s.trim())
            .unwrap_or("")
    }

    pub fn required(&self, column: &str) -> Result<String, RecordError> {
        match self.text(column) {
            "" => Err(self.malformed(format!("missing {column}"))),
            value => Ok(value.to_string()),
        }
    }

    pub fn optional(&self, column: &str) -> Option<String> {
        Some(self.text(column))
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    pub fn date(&self, column: &str) -> Result<Option<NaiveDate>, RecordError> {
        parse_date(self.text(column)).map_err(|reason| self.malformed(format!("{column}: {reason}")))
    }
}

/// Splits a tab-delimited line, removing one level of surrounding double quotes.
pub fn split_record(line: &str) -> Vec<String> {
    line.split('\t')
        .map(|cell| {
            let trimmed = cell.trim();
            if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
                trimmed[1..trimmed.len() - 1].replace("\"\"", "\"")
            } else {
                trimmed.to_string()
            }
        })
        .collect()
}

/// Accepts `MM/DD/YYYY` and `YYYY-MM-DD`. Blank and the source's `xx/xx/xxxx`
/// placeholder are absent values.
pub fn parse_date(raw: &str) -> Result<Option<NaiveDate>, String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("xx/xx/xxxx") {
        return Ok(None);
    }
    NaiveDate::parse_from_str(raw, "%m/%d/%Y")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .map(Some)
        .map_err(|_| format!("unparsable date `{raw}`"))
}

/// Source files are mostly UTF-8 but older extracts are Latin-1.
fn decode_line(bytes: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(bytes) {
        Ok(s) => Cow::Borrowed(s),
        Err(_) => Cow::Owned(bytes.iter().map(|&b| b as char).collect()),
    }
}

pub trait RowParser {
    type Row;

    fn layout(&self) -> &'static Layout;

    fn parse(&self, record: &Record<'_>) -> Result<Self::Row, RecordError>;
}

#[derive(Debug)]
pub struct ParsedBatch<T> {
    pub rows: Vec<T>,
    pub errors: Vec<RecordError>,
    /// Data rows consumed for this batch, including the ones that failed to parse.
    pub records: u64,
}

impl<T> Default for ParsedBatch<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            errors: Vec::new(),
            records: 0,
        }
    }
}

/// Streams a snapshot file in bounded batches. Header rows and blank lines are not
/// records; every other line yields either a row or a [`RecordError`].
pub struct SnapshotReader<R, P> {
    reader: R,
    parser: P,
    path: PathBuf,
    columns: Option<ColumnMap>,
    line_no: u64,
    records_read: u64,
    buf: Vec<u8>,
}

impl<P: RowParser> SnapshotReader<BufReader<File>, P> {
    pub fn open(path: impl AsRef<Path>, parser: P) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(BufReader::new(file), parser, path))
    }
}

impl<R: BufRead, P: RowParser> SnapshotReader<R, P> {
    pub fn new(reader: R, parser: P, path: impl Into<PathBuf>) -> Self {
        Self {
            reader,
            parser,
            path: path.into(),
            columns: None,
            line_no: 0,
            records_read: 0,
            buf: Vec::new(),
        }
    }

    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    /// Reads until `max_records` records have been consumed or the file ends.
    /// Returns `None` once the file is exhausted.
    pub fn next_batch(
        &mut self,
        max_records: usize,
    ) -> Result<Option<ParsedBatch<P::Row>>, LoadError> {
        let mut batch = ParsedBatch::default();
        let max_records = max_records.max(1) as u64;
        while batch.records < max_records {
            self.buf.clear();
            let n = self
                .reader
                .read_until(b'\n', &mut self.buf)
                .map_err(|source| LoadError::Io {
                    path: self.path.clone(),
                    source,
                })?;
            if n == 0 {
                break;
            }
            self.line_no += 1;
            let line = decode_line(&self.buf);
            let line = line.trim_end_matches(['\n', '\r']);
            if line.trim().is_empty() {
                continue;
            }
            let cells = split_record(line);
            if self.columns.is_none() {
                let layout = self.parser.layout();
                let header = layout.is_header(&cells);
                self.columns = Some(if header {
                    ColumnMap::from_header(layout, &cells)?
                } else {
                    ColumnMap::positional(layout)
                });
                debug!(layout = layout.name, header, "column map established");
                if header {
                    continue;
                }
            }
            let Some(columns) = &self.columns else {
                continue;
            };
            batch.records += 1;
            self.records_read += 1;
            let result = if cells.len() < columns.min_fields() {
                Err(RecordError::Malformed {
                    line: self.line_no,
                    reason: format!(
                        "expected at least {} fields, found {}",
                        columns.min_fields(),
                        cells.len()
                    ),
                })
            } else {
                self.parser
                    .parse(&Record::new(self.line_no, &cells, columns))
            };
            match result {
                Ok(row) => batch.rows.push(row),
                Err(err) => {
                    warn!(file = %self.path.display(), "{err}");
                    batch.errors.push(err);
                }
            }
        }
        if batch.records == 0 {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }

    /// Drains the rest of the file into one batch.
    pub fn read_to_end(mut self) -> Result<ParsedBatch<P::Row>, LoadError> {
        let mut all = ParsedBatch::default();
        while let Some(batch) = self.next_batch(10_000)? {
            all.rows.extend(batch.rows);
            all.errors.extend(batch.errors);
            all.records += batch.records;
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    static PAIR_LAYOUT: Layout = Layout {
        name: "pair",
        columns: &["name", "count", "note"],
        required: &["name", "count"],
        min_fields: 2,
        aliases: &[("total", "count")],
    };

    struct PairParser;

    impl RowParser for PairParser {
        type Row = (String, u32);

        fn layout(&self) -> &'static Layout {
            &PAIR_LAYOUT
        }

        fn parse(&self, record: &Record<'_>) -> Result<Self::Row, RecordError> {
            let name = record.required("name")?;
            let count = record
                .text("count")
                .parse()
                .map_err(|_| record.malformed("count is not a number"))?;
            Ok((name, count))
        }
    }

    fn reader(text: &[u8]) -> SnapshotReader<Cursor<Vec<u8>>, PairParser> {
        SnapshotReader::new(Cursor::new(text.to_vec()), PairParser, "pairs.txt")
    }

    #[test]
    fn splits_tabs_and_strips_quotes() {
        assert_eq!(
            split_record("\"WAKE\"\t 92 \t\"say \"\"hi\"\"\""),
            vec!["WAKE", "92", "say \"hi\""]
        );
    }

    #[test]
    fn parses_both_date_styles_and_placeholders() {
        let expected = NaiveDate::from_ymd_opt(2022, 2, 12);
        assert_eq!(parse_date("02/12/2022").unwrap(), expected);
        assert_eq!(parse_date("2022-02-12").unwrap(), expected);
        assert_eq!(parse_date("xx/xx/xxxx").unwrap(), None);
        assert_eq!(parse_date("  ").unwrap(), None);
        assert!(parse_date("12/2022").is_err());
    }

    #[test]
    fn headerless_file_uses_positional_layout() {
        let parsed = reader(b"a\t1\nb\t2\textra\tcolumns\n")
            .read_to_end()
            .unwrap();
        assert_eq!(parsed.rows, vec![("a".into(), 1), ("b".into(), 2)]);
        assert_eq!(parsed.records, 2);
    }

    #[test]
    fn header_row_reorders_columns_and_resolves_aliases() {
        let parsed = reader(b"\"Note\"\t\"Total\"\t\"Name\"\nhi\t7\tz\n")
            .read_to_end()
            .unwrap();
        assert_eq!(parsed.rows, vec![("z".into(), 7)]);
        assert_eq!(parsed.records, 1);
    }

    #[test]
    fn header_missing_required_column_is_fatal() {
        let err = reader(b"name\tnote\nx\ty\n").read_to_end().unwrap_err();
        assert!(matches!(err, LoadError::MissingColumns { .. }));
    }

    #[test]
    fn bad_rows_are_skipped_not_fatal() {
        let parsed = reader(b"a\t1\n\nshort\nb\tNaN\n\r\nc\t3\n")
            .read_to_end()
            .unwrap();
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.errors.len(), 2);
        assert_eq!(parsed.records, 4);
        assert_eq!(
            parsed.errors[0],
            RecordError::Malformed {
                line: 3,
                reason: "expected at least 2 fields, found 1".into(),
            }
        );
    }

    #[test]
    fn batches_respect_the_record_limit() {
        let mut r = reader(b"a\t1\nb\t2\nc\t3\n");
        assert_eq!(r.next_batch(2).unwrap().unwrap().rows.len(), 2);
        assert_eq!(r.next_batch(2).unwrap().unwrap().rows.len(), 1);
        assert!(r.next_batch(2).unwrap().is_none());
        assert_eq!(r.records_read(), 3);
    }

    #[test]
    fn latin1_bytes_are_decoded() {
        let parsed = reader(b"Pe\xf1a\t1\n").read_to_end().unwrap();
        assert_eq!(parsed.rows, vec![("Peña".into(), 1)]);
    }
}
