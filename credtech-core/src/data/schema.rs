//! Typed tables shared by the layer store and the relational loader.
//!
//! A [`Table`] is a column schema plus rows of [`Cell`]s. Domain records
//! convert to and from tables through [`TableRecord`]; columns are matched by
//! name so an artifact with reordered columns still loads.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    Text,
    Integer,
    /// Exact decimal, rendered as canonical decimal text.
    Decimal,
    /// ISO `YYYY-MM-DD`.
    Date,
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnKind::Text => "text",
            ColumnKind::Integer => "integer",
            ColumnKind::Decimal => "decimal",
            ColumnKind::Date => "date",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
    pub nullable: bool,
}

impl ColumnSpec {
    pub fn required(name: &str, kind: ColumnKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            nullable: false,
        }
    }

    pub fn optional(name: &str, kind: ColumnKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            nullable: true,
        }
    }
}

/// Column set plus the natural key used for ordering and upserts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub columns: Vec<ColumnSpec>,
    pub key: Vec<String>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnSpec>, key: &[&str]) -> Self {
        Self {
            columns,
            key: key.iter().map(|k| k.to_string()).collect(),
        }
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Cell {
    Null,
    Text(String),
    Integer(i64),
    Decimal(Decimal),
    Date(NaiveDate),
}

impl Cell {
    /// Text cell; the empty string is stored as null.
    pub fn text(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.is_empty() {
            Cell::Null
        } else {
            Cell::Text(value)
        }
    }

    pub fn opt_text(value: Option<&str>) -> Self {
        value.map_or(Cell::Null, Cell::text)
    }

    pub fn opt_decimal(value: Option<Decimal>) -> Self {
        value.map_or(Cell::Null, Cell::Decimal)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Layer text form; null renders as the empty string.
    pub fn render(&self) -> String {
        match self {
            Cell::Null => String::new(),
            Cell::Text(s) => s.clone(),
            Cell::Integer(i) => i.to_string(),
            Cell::Decimal(d) => d.to_string(),
            Cell::Date(d) => d.format("%Y-%m-%d").to_string(),
        }
    }

    /// Inverse of [`Cell::render`] for a column of the given kind.
    pub fn parse(kind: ColumnKind, column: &str, raw: &str) -> Result<Cell, SchemaError> {
        if raw.is_empty() {
            return Ok(Cell::Null);
        }
        let mismatch = || SchemaError::TypeMismatch {
            column: column.to_string(),
            expected: kind,
            actual: raw.to_string(),
        };
        Ok(match kind {
            ColumnKind::Text => Cell::Text(raw.to_string()),
            ColumnKind::Integer => Cell::Integer(raw.parse().map_err(|_| mismatch())?),
            ColumnKind::Decimal => Cell::Decimal(Decimal::from_str(raw).map_err(|_| mismatch())?),
            ColumnKind::Date => Cell::Date(
                NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| mismatch())?,
            ),
        })
    }

    fn mismatch(&self, column: &str, expected: ColumnKind) -> SchemaError {
        SchemaError::TypeMismatch {
            column: column.to_string(),
            expected,
            actual: self.render(),
        }
    }

    pub fn as_text(&self, column: &str) -> Result<String, SchemaError> {
        match self {
            Cell::Text(s) if !s.is_empty() => Ok(s.clone()),
            Cell::Null | Cell::Text(_) => Err(SchemaError::NullValue(column.to_string())),
            other => Err(other.mismatch(column, ColumnKind::Text)),
        }
    }

    pub fn as_opt_text(&self, column: &str) -> Result<Option<String>, SchemaError> {
        match self {
            Cell::Null => Ok(None),
            Cell::Text(s) if s.is_empty() => Ok(None),
            Cell::Text(s) => Ok(Some(s.clone())),
            other => Err(other.mismatch(column, ColumnKind::Text)),
        }
    }

    pub fn as_integer(&self, column: &str) -> Result<i64, SchemaError> {
        match self {
            Cell::Integer(i) => Ok(*i),
            Cell::Null => Err(SchemaError::NullValue(column.to_string())),
            other => Err(other.mismatch(column, ColumnKind::Integer)),
        }
    }

    pub fn as_decimal(&self, column: &str) -> Result<Decimal, SchemaError> {
        self.as_opt_decimal(column)?
            .ok_or_else(|| SchemaError::NullValue(column.to_string()))
    }

    pub fn as_opt_decimal(&self, column: &str) -> Result<Option<Decimal>, SchemaError> {
        match self {
            Cell::Decimal(d) => Ok(Some(*d)),
            Cell::Integer(i) => Ok(Some(Decimal::from(*i))),
            Cell::Null => Ok(None),
            other => Err(other.mismatch(column, ColumnKind::Decimal)),
        }
    }

    pub fn as_date(&self, column: &str) -> Result<NaiveDate, SchemaError> {
        match self {
            Cell::Date(d) => Ok(*d),
            Cell::Null => Err(SchemaError::NullValue(column.to_string())),
            other => Err(other.mismatch(column, ColumnKind::Date)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub schema: TableSchema,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Check widths and nullability of every row against the schema.
    pub fn validate(&self) -> Result<(), SchemaError> {
        let width = self.schema.columns.len();
        for (index, row) in self.rows.iter().enumerate() {
            if row.len() != width {
                return Err(SchemaError::RowWidth {
                    row: index,
                    expected: width,
                    actual: row.len(),
                });
            }
            for (spec, cell) in self.schema.columns.iter().zip(row) {
                if !spec.nullable && cell.is_null() {
                    return Err(SchemaError::NullValue(spec.name.clone()));
                }
            }
        }
        Ok(())
    }

    /// Project the table onto `target`, matching columns by name.
    ///
    /// Missing nullable columns become nulls; a missing required column is
    /// an error.
    pub fn project(&self, target: &TableSchema) -> Result<Table, SchemaError> {
        let mut mapping = Vec::with_capacity(target.columns.len());
        for spec in &target.columns {
            match self.schema.position(&spec.name) {
                Some(index) => mapping.push(Some(index)),
                None if spec.nullable => mapping.push(None),
                None => return Err(SchemaError::MissingColumn(spec.name.clone())),
            }
        }
        let rows = self
            .rows
            .iter()
            .map(|row| {
                mapping
                    .iter()
                    .map(|m| m.and_then(|i| row.get(i).cloned()).unwrap_or(Cell::Null))
                    .collect()
            })
            .collect();
        Ok(Table {
            schema: target.clone(),
            rows,
        })
    }
}

/// A domain record with a fixed tabular layout.
pub trait TableRecord: Sized {
    fn schema() -> TableSchema;

    /// Cells in [`TableRecord::schema`] column order.
    fn to_row(&self) -> Vec<Cell>;

    /// Inverse of [`TableRecord::to_row`].
    fn from_row(row: &[Cell]) -> Result<Self, SchemaError>;
}

pub fn to_table<R: TableRecord>(records: &[R]) -> Table {
    Table {
        schema: R::schema(),
        rows: records.iter().map(TableRecord::to_row).collect(),
    }
}

pub fn from_table<R: TableRecord>(table: &Table) -> Result<Vec<R>, SchemaError> {
    let projected = table.project(&R::schema())?;
    projected.rows.iter().map(|row| R::from_row(row)).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("missing required column: {0}")]
    MissingColumn(String),

    #[error("type mismatch in column {column}: expected {expected}, got '{actual}'")]
    TypeMismatch {
        column: String,
        expected: ColumnKind,
        actual: String,
    },

    #[error("null value in required column {0}")]
    NullValue(String),

    #[error("row {row} has {actual} cells, schema has {expected}")]
    RowWidth {
        row: usize,
        expected: usize,
        actual: usize,
    },

    #[error("invalid value in column {column}: {reason}")]
    InvalidValue { column: String, reason: String },
}
