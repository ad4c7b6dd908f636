//! Persisted Silver/Gold layer store.
//!
//! Layout: `{root}/{family}/{family}_{key}.{csv|parquet}`
//!
//! - Atomic writes (write to .tmp, rename into place)
//! - Unchanged content is not rewritten
//! - Metadata sidecar per artifact (row count, content hash, columns)
//! - Corrupt artifacts are quarantined on read (`{file}.quarantined`)

use chrono::NaiveDate;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::schema::{Cell, ColumnKind, SchemaError, Table, TableSchema};
use crate::domain::{Family, Fingerprint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerFormat {
    #[default]
    Csv,
    Parquet,
}

impl LayerFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            LayerFormat::Csv => "csv",
            LayerFormat::Parquet => "parquet",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LayerError {
    #[error("layer I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact not found: {0}")]
    NotFound(PathBuf),

    #[error("CSV error in {path}: {reason}")]
    Csv { path: PathBuf, reason: String },

    #[error("Parquet error in {path}: {reason}")]
    Parquet { path: PathBuf, reason: String },

    #[error("schema error in {path}: {source}")]
    Schema {
        path: PathBuf,
        #[source]
        source: SchemaError,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> LayerError + '_ {
    move |source| LayerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Sidecar written next to every artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub family: Family,
    pub key: String,
    pub rows: usize,
    pub columns: Vec<String>,
    pub content_hash: String,
}

/// Whether a write replaced the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Unchanged,
}

/// One refinement layer (Silver or Gold) on disk.
#[derive(Debug, Clone)]
pub struct LayerStore {
    root: PathBuf,
    format: LayerFormat,
}

impl LayerStore {
    pub fn new(root: impl Into<PathBuf>, format: LayerFormat) -> Self {
        Self {
            root: root.into(),
            format,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn format(&self) -> LayerFormat {
        self.format
    }

    fn family_dir(&self, family: Family) -> PathBuf {
        self.root.join(family.as_str())
    }

    /// `{root}/{family}/{family}_{key}.{ext}`
    pub fn path_for(&self, family: Family, key: &str, format: LayerFormat) -> PathBuf {
        self.family_dir(family)
            .join(format!("{}_{key}.{}", family.as_str(), format.extension()))
    }

    fn meta_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".meta.json");
        path.with_file_name(name)
    }

    /// Write a table in the store's format.
    pub fn write(&self, family: Family, key: &str, table: &Table) -> Result<WriteOutcome, LayerError> {
        self.write_as(family, key, table, self.format)
    }

    /// Write a table in an explicit format.
    pub fn write_as(
        &self,
        family: Family,
        key: &str,
        table: &Table,
        format: LayerFormat,
    ) -> Result<WriteOutcome, LayerError> {
        let path = self.path_for(family, key, format);
        table.validate().map_err(|source| LayerError::Schema {
            path: path.clone(),
            source,
        })?;

        let bytes = match format {
            LayerFormat::Csv => table_to_csv(table, &path)?,
            LayerFormat::Parquet => table_to_parquet(table, &path)?,
        };

        if fs::read(&path).map(|existing| existing == bytes).unwrap_or(false) {
            return Ok(WriteOutcome::Unchanged);
        }

        let dir = self.family_dir(family);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let tmp_path = path.with_extension(format!("{}.tmp", format.extension()));
        fs::write(&tmp_path, &bytes).map_err(io_err(&tmp_path))?;
        fs::rename(&tmp_path, &path).map_err(|source| {
            let _ = fs::remove_file(&tmp_path);
            LayerError::Io {
                path: path.clone(),
                source,
            }
        })?;

        let meta = ArtifactMeta {
            family,
            key: key.to_string(),
            rows: table.len(),
            columns: table.schema.names().iter().map(|s| s.to_string()).collect(),
            content_hash: Fingerprint::of_bytes(&bytes).0,
        };
        let meta_path = Self::meta_path(&path);
        let meta_json = serde_json::to_string_pretty(&meta).map_err(|e| LayerError::Csv {
            path: meta_path.clone(),
            reason: format!("meta serialization: {e}"),
        })?;
        fs::write(&meta_path, meta_json).map_err(io_err(&meta_path))?;

        tracing::debug!(path = %path.display(), rows = table.len(), "layer artifact written");
        Ok(WriteOutcome::Written)
    }

    /// Read an artifact and project it onto `schema`.
    ///
    /// An artifact that cannot be decoded is renamed to `.quarantined`.
    pub fn read(&self, family: Family, key: &str, schema: &TableSchema) -> Result<Table, LayerError> {
        let path = self.path_for(family, key, self.format);
        if !path.exists() {
            return Err(LayerError::NotFound(path));
        }
        let result = match self.format {
            LayerFormat::Csv => csv_to_table(&path, schema),
            LayerFormat::Parquet => parquet_to_table(&path, schema),
        };
        if let Err(e @ (LayerError::Csv { .. } | LayerError::Parquet { .. })) = &result {
            let quarantine = path.with_extension(format!("{}.quarantined", self.format.extension()));
            tracing::warn!(path = %path.display(), error = %e, "quarantining corrupt layer artifact");
            let _ = fs::rename(&path, &quarantine);
        }
        result
    }

    pub fn meta(&self, family: Family, key: &str) -> Option<ArtifactMeta> {
        let path = Self::meta_path(&self.path_for(family, key, self.format));
        let content = fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn exists(&self, family: Family, key: &str) -> bool {
        self.path_for(family, key, self.format).exists()
    }

    /// Keys of every artifact of a family in the store's format, sorted.
    pub fn keys(&self, family: Family) -> Result<Vec<String>, LayerError> {
        let dir = self.family_dir(family);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let prefix = format!("{}_", family.as_str());
        let suffix = format!(".{}", self.format.extension());
        let mut keys = Vec::new();
        for entry in fs::read_dir(&dir).map_err(io_err(&dir))? {
            let entry = entry.map_err(io_err(&dir))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(key) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(&suffix))
            {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

// ── CSV ─────────────────────────────────────────────────────────────

fn table_to_csv(table: &Table, path: &Path) -> Result<Vec<u8>, LayerError> {
    let csv_err = |e: csv::Error| LayerError::Csv {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(table.schema.names()).map_err(csv_err)?;
    for row in &table.rows {
        writer
            .write_record(row.iter().map(Cell::render))
            .map_err(csv_err)?;
    }
    writer.into_inner().map_err(|e| LayerError::Csv {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn csv_to_table(path: &Path, schema: &TableSchema) -> Result<Table, LayerError> {
    let csv_err = |e: csv::Error| LayerError::Csv {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    let schema_err = |source: SchemaError| LayerError::Schema {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::Reader::from_path(path).map_err(csv_err)?;
    let headers: Vec<String> = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(str::to_string)
        .collect();

    // Kind per file column: from the target schema, text for unknown columns.
    let file_schema = TableSchema {
        columns: headers
            .iter()
            .map(|h| match schema.column(h) {
                Some(spec) => spec.clone(),
                None => super::schema::ColumnSpec::optional(h, ColumnKind::Text),
            })
            .collect(),
        key: Vec::new(),
    };

    let mut table = Table::new(file_schema);
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        let row = table
            .schema
            .columns
            .iter()
            .zip(record.iter())
            .map(|(spec, raw)| Cell::parse(spec.kind, &spec.name, raw))
            .collect::<Result<Vec<_>, _>>()
            .map_err(schema_err)?;
        table.rows.push(row);
    }
    table.project(schema).map_err(schema_err)
}

// ── Parquet ─────────────────────────────────────────────────────────

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

fn table_to_parquet(table: &Table, path: &Path) -> Result<Vec<u8>, LayerError> {
    let pq_err = |e: PolarsError| LayerError::Parquet {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    let mut columns = Vec::with_capacity(table.schema.columns.len());
    for (index, spec) in table.schema.columns.iter().enumerate() {
        let cells = table.rows.iter().map(|row| &row[index]);
        let name: PlSmallStr = spec.name.as_str().into();
        let column = match spec.kind {
            ColumnKind::Text | ColumnKind::Decimal => {
                let values: Vec<Option<String>> = cells
                    .map(|c| (!c.is_null()).then(|| c.render()))
                    .collect();
                Column::new(name, values)
            }
            ColumnKind::Integer => {
                let values: Vec<Option<i64>> = cells
                    .map(|c| match c {
                        Cell::Integer(i) => Some(*i),
                        _ => None,
                    })
                    .collect();
                Column::new(name, values)
            }
            ColumnKind::Date => {
                let values: Vec<Option<i32>> = cells
                    .map(|c| match c {
                        Cell::Date(d) => Some((*d - epoch()).num_days() as i32),
                        _ => None,
                    })
                    .collect();
                Column::new(name, values).cast(&DataType::Date).map_err(pq_err)?
            }
        };
        columns.push(column);
    }

    let mut df = DataFrame::new(columns).map_err(pq_err)?;
    let mut buffer = Vec::new();
    ParquetWriter::new(&mut buffer)
        .finish(&mut df)
        .map_err(pq_err)?;
    Ok(buffer)
}

fn parquet_to_table(path: &Path, schema: &TableSchema) -> Result<Table, LayerError> {
    let pq_err = |e: PolarsError| LayerError::Parquet {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    let schema_err = |source: SchemaError| LayerError::Schema {
        path: path.to_path_buf(),
        source,
    };

    let file = fs::File::open(path).map_err(io_err(path))?;
    let df = ParquetReader::new(file).finish().map_err(pq_err)?;

    let mut file_schema = TableSchema {
        columns: Vec::new(),
        key: Vec::new(),
    };
    let mut columns: Vec<Vec<Cell>> = Vec::new();
    for spec in &schema.columns {
        let Ok(column) = df.column(&spec.name) else {
            continue;
        };
        let cells = match spec.kind {
            ColumnKind::Text | ColumnKind::Decimal => {
                let ca = column.str().map_err(pq_err)?;
                ca.into_iter()
                    .map(|v| match v {
                        Some(raw) => Cell::parse(spec.kind, &spec.name, raw),
                        None => Ok(Cell::Null),
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(schema_err)?
            }
            ColumnKind::Integer => {
                let ca = column.i64().map_err(pq_err)?;
                ca.into_iter()
                    .map(|v| v.map_or(Cell::Null, Cell::Integer))
                    .collect()
            }
            ColumnKind::Date => {
                let ca = column.date().map_err(pq_err)?;
                (0..df.height())
                    .map(|i| {
                        ca.get(i).map_or(Cell::Null, |days| {
                            Cell::Date(epoch() + chrono::Duration::days(days as i64))
                        })
                    })
                    .collect()
            }
        };
        file_schema.columns.push(spec.clone());
        columns.push(cells);
    }

    let mut table = Table::new(file_schema);
    for i in 0..df.height() {
        table
            .rows
            .push(columns.iter().map(|c| c[i].clone()).collect());
    }
    table.project(schema).map_err(schema_err)
}
