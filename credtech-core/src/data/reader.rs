//! Source Reader: opens one raw extract and yields its rows lazily.
//!
//! Raw files come from several exporters over the years, so the reader
//! detects the text encoding (BOM, UTF-8, Windows-1252 fallback) and the
//! delimiter before handing rows to the canonicalizer. Workbooks
//! (xlsx, xls, xlsm, ods) are read from their first sheet holding data.
//! Individual bad rows are reported as [`MalformedRow`] items and never
//! abort the read.

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, StringRecordsIntoIter, Terminator};
use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use std::fmt;
use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::domain::Fingerprint;

/// Candidate delimiters, in tie-break order.
const DELIMITERS: [u8; 4] = [b';', b',', b'\t', b'|'];

/// Lines inspected by delimiter detection.
const SNIFF_LINES: usize = 20;

const SPREADSHEET_EXTENSIONS: [&str; 4] = ["xlsx", "xls", "xlsm", "ods"];

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("source unavailable: {path}: {reason}")]
    SourceUnavailable { path: PathBuf, reason: String },

    #[error("source malformed: {path}: {reason}")]
    SourceMalformed { path: PathBuf, reason: String },
}

impl ReadError {
    fn malformed(path: &Path, reason: impl Into<String>) -> Self {
        ReadError::SourceMalformed {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// Physical layout a raw extract was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceFormat {
    Delimited {
        encoding: &'static str,
        delimiter: char,
    },
    Spreadsheet {
        sheet: String,
    },
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceFormat::Delimited {
                encoding,
                delimiter,
            } => write!(f, "{encoding} '{}'", delimiter.escape_default()),
            SourceFormat::Spreadsheet { sheet } => write!(f, "sheet '{sheet}'"),
        }
    }
}

/// Where a raw row came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    /// File name of the raw extract.
    pub file: String,
    pub path: PathBuf,
    pub extracted_at: DateTime<Utc>,
    pub fingerprint: Fingerprint,
    pub format: SourceFormat,
}

impl Provenance {
    pub fn delimiter(&self) -> Option<char> {
        match &self.format {
            SourceFormat::Delimited { delimiter, .. } => Some(*delimiter),
            SourceFormat::Spreadsheet { .. } => None,
        }
    }

    pub fn encoding(&self) -> Option<&'static str> {
        match &self.format {
            SourceFormat::Delimited { encoding, .. } => Some(*encoding),
            SourceFormat::Spreadsheet { .. } => None,
        }
    }
}

/// One data row as extracted. Cells line up with the owning source's headers.
#[derive(Debug, Clone)]
pub struct RawRecord {
    /// 1-based line number in the decoded text (row number for sheets).
    pub line: u64,
    pub cells: Vec<String>,
    /// Cells that were typed numbers in a workbook; always dot-decimal.
    numeric: Vec<bool>,
    headers: Arc<[String]>,
    provenance: Arc<Provenance>,
}

impl RawRecord {
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// Cell by original column name.
    pub fn get(&self, column: &str) -> Option<&str> {
        let index = self.headers.iter().position(|h| h == column)?;
        self.cells.get(index).map(String::as_str)
    }

    pub fn cell(&self, index: usize) -> Option<&str> {
        self.cells.get(index).map(String::as_str)
    }

    pub fn is_number(&self, index: usize) -> bool {
        self.numeric.get(index).copied().unwrap_or(false)
    }
}

/// A row the reader could not shape into a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRow {
    pub line: u64,
    pub reason: String,
}

impl fmt::Display for MalformedRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.reason)
    }
}

/// An opened raw extract: header row, provenance and a lazy row iterator.
pub struct RawSource {
    headers: Arc<[String]>,
    provenance: Arc<Provenance>,
    rows: Rows,
}

enum Rows {
    Delimited(StringRecordsIntoIter<Cursor<Vec<u8>>>),
    Sheet(std::vec::IntoIter<SheetRow>),
}

struct SheetRow {
    line: u64,
    cells: Vec<String>,
    numeric: Vec<bool>,
}

impl fmt::Debug for RawSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawSource")
            .field("headers", &self.headers)
            .field("provenance", &self.provenance)
            .finish_non_exhaustive()
    }
}

impl RawSource {
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }
}

impl Iterator for RawSource {
    type Item = Result<RawRecord, MalformedRow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (line, mut cells, mut numeric) = match &mut self.rows {
                Rows::Delimited(records) => match records.next()? {
                    Ok(record) => (
                        record.position().map(|p| p.line()).unwrap_or_default(),
                        record.iter().map(|c| c.trim().to_string()).collect::<Vec<_>>(),
                        Vec::new(),
                    ),
                    Err(e) => {
                        let line = e.position().map(|p| p.line()).unwrap_or_default();
                        return Some(Err(MalformedRow {
                            line,
                            reason: e.to_string(),
                        }));
                    }
                },
                Rows::Sheet(rows) => {
                    let row = rows.next()?;
                    (row.line, row.cells, row.numeric)
                }
            };

            if cells.iter().all(String::is_empty) {
                continue;
            }

            let width = self.headers.len();
            if cells.len() > width {
                if cells[width..].iter().any(|c| !c.is_empty()) {
                    return Some(Err(MalformedRow {
                        line,
                        reason: format!(
                            "{} cells but the header has {} columns",
                            cells.len(),
                            width
                        ),
                    }));
                }
                cells.truncate(width);
            }
            cells.resize(width, String::new());
            numeric.truncate(width);

            return Some(Ok(RawRecord {
                line,
                cells,
                numeric,
                headers: Arc::clone(&self.headers),
                provenance: Arc::clone(&self.provenance),
            }));
        }
    }
}

/// Opens raw extracts.
pub struct SourceReader;

impl SourceReader {
    /// Read, decode and sniff one raw file.
    pub fn open(path: &Path) -> Result<RawSource, ReadError> {
        let bytes = fs::read(path).map_err(|e| ReadError::SourceUnavailable {
            path: path.to_path_buf(),
            reason: match e.kind() {
                io::ErrorKind::NotFound => "file does not exist".to_string(),
                _ => e.to_string(),
            },
        })?;
        Self::from_bytes(path, &bytes)
    }

    /// Same as [`SourceReader::open`] for bytes already in memory.
    pub fn from_bytes(path: &Path, bytes: &[u8]) -> Result<RawSource, ReadError> {
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(ReadError::malformed(path, "empty file"));
        }

        let fingerprint = Fingerprint::of_bytes(bytes);
        if is_spreadsheet(path) {
            return read_workbook(path, bytes, fingerprint);
        }

        let (text, encoding) = decode(bytes);
        if text.contains('\0') {
            return Err(ReadError::malformed(path, "binary content"));
        }

        let delimiter = detect_delimiter(&text)
            .ok_or_else(|| ReadError::malformed(path, "no consistent delimiter found"))?;

        let mut reader = ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .flexible(true)
            .terminator(Terminator::Any(b'\n'))
            .from_reader(Cursor::new(text.into_bytes()));

        let mut header_record = csv::StringRecord::new();
        let has_header = reader
            .read_record(&mut header_record)
            .map_err(|e| ReadError::malformed(path, format!("unreadable header: {e}")))?;
        if !has_header {
            return Err(ReadError::malformed(path, "missing header row"));
        }

        let headers: Vec<String> = header_record
            .iter()
            .enumerate()
            .map(|(i, h)| {
                let h = h.trim().trim_start_matches('\u{feff}').trim_matches('\r');
                if h.is_empty() {
                    format!("column_{i}")
                } else {
                    h.to_string()
                }
            })
            .collect();

        let provenance = provenance(
            path,
            fingerprint,
            SourceFormat::Delimited {
                encoding: encoding.name(),
                delimiter: delimiter as char,
            },
        );

        tracing::debug!(
            file = %provenance.file,
            format = %provenance.format,
            columns = headers.len(),
            "opened raw source"
        );

        Ok(RawSource {
            headers: headers.into(),
            provenance: Arc::new(provenance),
            rows: Rows::Delimited(reader.into_records()),
        })
    }
}

fn provenance(path: &Path, fingerprint: Fingerprint, format: SourceFormat) -> Provenance {
    Provenance {
        file: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        path: path.to_path_buf(),
        extracted_at: Utc::now(),
        fingerprint,
        format,
    }
}

fn is_spreadsheet(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            SPREADSHEET_EXTENSIONS
                .iter()
                .any(|s| s.eq_ignore_ascii_case(ext))
        })
}

/// Read the first sheet with any data. The first non-blank row is the
/// header; typed numbers are rendered dot-decimal and flagged per cell.
fn read_workbook(
    path: &Path,
    bytes: &[u8],
    fingerprint: Fingerprint,
) -> Result<RawSource, ReadError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| ReadError::malformed(path, format!("unreadable workbook: {e}")))?;

    let (sheet, range) = workbook
        .worksheets()
        .into_iter()
        .find(|(_, range)| range.rows().any(|row| !is_blank_row(row)))
        .ok_or_else(|| ReadError::malformed(path, "workbook has no data"))?;

    let first_row = range.start().map(|(row, _)| u64::from(row)).unwrap_or(0);
    let mut rows = range
        .rows()
        .enumerate()
        .map(|(i, row)| (first_row + i as u64 + 1, row))
        .skip_while(|(_, row)| is_blank_row(row));

    let headers: Vec<String> = match rows.next() {
        Some((_, header)) => header
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let (text, _) = render_cell(cell);
                if text.is_empty() {
                    format!("column_{i}")
                } else {
                    text
                }
            })
            .collect(),
        None => return Err(ReadError::malformed(path, "missing header row")),
    };
    if headers.len() < 2 {
        return Err(ReadError::malformed(path, "header has a single column"));
    }

    let body: Vec<SheetRow> = rows
        .map(|(line, row)| {
            let (cells, numeric): (Vec<String>, Vec<bool>) = row.iter().map(render_cell).unzip();
            SheetRow {
                line,
                cells,
                numeric,
            }
        })
        .collect();

    let provenance = provenance(path, fingerprint, SourceFormat::Spreadsheet { sheet });
    tracing::debug!(
        file = %provenance.file,
        format = %provenance.format,
        columns = headers.len(),
        rows = body.len(),
        "opened raw source"
    );

    Ok(RawSource {
        headers: headers.into(),
        provenance: Arc::new(provenance),
        rows: Rows::Sheet(body.into_iter()),
    })
}

fn is_blank_row(row: &[Data]) -> bool {
    row.iter().all(|cell| render_cell(cell).0.is_empty())
}

/// Cell text plus whether it came from a typed number.
fn render_cell(cell: &Data) -> (String, bool) {
    match cell {
        Data::Empty => (String::new(), false),
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => {
            (s.trim().to_string(), false)
        }
        Data::Int(v) => (v.to_string(), true),
        // f64 Display never uses an exponent and keeps the shortest
        // round-trip digits
        Data::Float(v) => (v.to_string(), true),
        Data::Bool(b) => (b.to_string(), false),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(at) => (at.format("%Y-%m-%d").to_string(), false),
            None => (dt.as_f64().to_string(), true),
        },
        Data::Error(e) => (e.to_string(), false),
    }
}

/// Decode raw bytes: BOM first, then strict UTF-8, then Windows-1252.
fn decode(bytes: &[u8]) -> (String, &'static Encoding) {
    if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
        let (text, _) = encoding.decode_without_bom_handling(&bytes[bom_len..]);
        return (text.into_owned(), encoding);
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => (text.to_string(), UTF_8),
        Err(_) => {
            let (text, _) = WINDOWS_1252.decode_without_bom_handling(bytes);
            (text.into_owned(), WINDOWS_1252)
        }
    }
}

/// Pick the delimiter whose per-line field count is most consistent with
/// the header line.
fn detect_delimiter(text: &str) -> Option<u8> {
    let lines: Vec<&str> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(SNIFF_LINES)
        .collect();
    let header = lines.first()?;

    let mut best: Option<(u8, (usize, usize))> = None;
    for delimiter in DELIMITERS {
        let header_fields = count_fields(header, delimiter);
        if header_fields < 2 {
            continue;
        }
        let consistent = lines[1..]
            .iter()
            .filter(|line| count_fields(line, delimiter) == header_fields)
            .count();
        let score = (consistent, header_fields);
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((delimiter, score));
        }
    }
    best.map(|(d, _)| d)
}

/// Field count for one line, ignoring delimiters inside double quotes.
fn count_fields(line: &str, delimiter: u8) -> usize {
    let mut fields = 1;
    let mut quoted = false;
    for b in line.bytes() {
        if b == b'"' {
            quoted = !quoted;
        } else if b == delimiter && !quoted {
            fields += 1;
        }
    }
    fields
}
