//! Gold→DB: idempotent upsert into the relational store.
//!
//! The store is PostgreSQL in production; a single-file SQLite store serves
//! local runs and tests. Both sit behind [`Store`]. Each [`Loader::load`]
//! opens its own connection, applies the whole batch in one transaction and
//! reports how many rows were inserted, updated, deleted or left untouched.
//! Rows whose stored values already match are not rewritten, so reloading
//! unchanged Gold data changes nothing.
//!
//! A batch may name the partition it fully replaces (one credit month, one
//! indicator series). Stored rows of that partition the batch no longer
//! contains are deleted in the same transaction.

mod postgres;
mod sqlite;

pub use self::postgres::PostgresStore;
pub use self::sqlite::SqliteStore;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::ops::AddAssign;

use credtech_core::data::{Cell, ColumnKind, ColumnSpec, Table, TableSchema};

use crate::config::{DatabaseBackend, DatabaseConfig, RetryConfig};
use crate::retry::{RetryPolicy, Retryable};

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("schema mismatch on table {table}: {reason}")]
    SchemaMismatch { table: String, reason: String },

    #[error("store connection failed: {reason}")]
    Connection { reason: String },

    #[error("constraint violation on table {table}: {reason}")]
    ConstraintViolation { table: String, reason: String },

    #[error("store error on table {table}: {reason}")]
    Store { table: String, reason: String },
}

impl Retryable for LoadError {
    fn is_retryable(&self) -> bool {
        matches!(self, LoadError::Connection { .. })
    }
}

impl LoadError {
    fn mismatch(table: &str, reason: impl Into<String>) -> Self {
        LoadError::SchemaMismatch {
            table: table.to_string(),
            reason: reason.into(),
        }
    }
}

/// Slice of the target table a batch replaces as a whole.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub column: String,
    pub value: Cell,
}

/// Rows for one Loader invocation: the Gold table plus its target.
#[derive(Debug, Clone)]
pub struct LoadBatch {
    pub target: String,
    pub data: Table,
    pub partition: Option<Partition>,
}

impl LoadBatch {
    pub fn new(target: impl Into<String>, data: Table) -> Self {
        Self {
            target: target.into(),
            data,
            partition: None,
        }
    }

    /// Make the batch authoritative for every stored row whose `column`
    /// equals `value`.
    pub fn replacing(mut self, column: impl Into<String>, value: Cell) -> Self {
        self.partition = Some(Partition {
            column: column.into(),
            value,
        });
        self
    }

    pub fn key_columns(&self) -> &[String] {
        &self.data.schema.key
    }

    fn check(&self) -> Result<(), LoadError> {
        let table = self.target.as_str();
        self.data
            .validate()
            .map_err(|e| LoadError::ConstraintViolation {
                table: table.to_string(),
                reason: e.to_string(),
            })?;
        if self.key_columns().is_empty() {
            return Err(LoadError::mismatch(table, "batch declares no key columns"));
        }
        let Some(partition) = &self.partition else {
            return Ok(());
        };
        let Some(index) = self.data.schema.position(&partition.column) else {
            return Err(LoadError::mismatch(
                table,
                format!("partition column '{}' is not in the batch", partition.column),
            ));
        };
        if let Some(row) = self.data.rows.iter().find(|r| r[index] != partition.value) {
            return Err(LoadError::ConstraintViolation {
                table: table.to_string(),
                reason: format!(
                    "row with {} = '{}' lies outside partition '{}'",
                    partition.column,
                    row[index].render(),
                    partition.value.render()
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadCounts {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    /// Stale rows of a replaced partition.
    #[serde(default)]
    pub deleted: u64,
}

impl LoadCounts {
    /// Rows the load actually wrote or removed.
    pub fn changed(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }

    /// Account one upserted row from whether its key existed and how many
    /// rows the statement touched.
    fn tally(&mut self, existed: bool, written: u64) {
        match (existed, written) {
            (false, _) => self.inserted += 1,
            (true, 0) => self.unchanged += 1,
            (true, _) => self.updated += 1,
        }
    }
}

impl AddAssign for LoadCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.updated += rhs.updated;
        self.unchanged += rhs.unchanged;
        self.deleted += rhs.deleted;
    }
}

/// One relational backend. Every call opens its own connection; `apply`
/// commits the whole batch or nothing.
pub trait Store: Send + Sync + fmt::Debug {
    /// Where rows go, without credentials.
    fn describe(&self) -> String;

    fn apply(&self, batch: &LoadBatch) -> Result<LoadCounts, LoadError>;

    /// Every stored row of `table` projected onto `schema`, ordered by key.
    /// A table that does not exist yet reads as empty.
    fn read_back(&self, table: &str, schema: &TableSchema) -> Result<Table, LoadError>;
}

/// Upserts Gold batches into a [`Store`] under a retry policy.
#[derive(Debug)]
pub struct Loader {
    store: Box<dyn Store>,
    retry: RetryPolicy,
}

impl Loader {
    pub fn new(store: impl Store + 'static, retry: RetryPolicy) -> Self {
        Self {
            store: Box::new(store),
            retry,
        }
    }

    pub fn from_config(database: &DatabaseConfig, retry: &RetryConfig) -> Self {
        let retry = RetryPolicy::from_config(retry);
        match database.backend {
            DatabaseBackend::Postgres => Self::new(PostgresStore::from_config(database), retry),
            DatabaseBackend::Sqlite => Self::new(SqliteStore::from_config(database), retry),
        }
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// Upsert the batch keyed on its natural key columns, then delete stale
    /// rows of its partition.
    ///
    /// Connection-level failures are retried by the policy; each attempt
    /// opens a fresh connection and either commits the whole batch or
    /// nothing.
    pub fn load(&self, batch: &LoadBatch) -> Result<LoadCounts, LoadError> {
        batch.check()?;
        let counts = self.retry.run("load", |_| self.store.apply(batch))?;
        tracing::info!(
            table = %batch.target,
            store = %self.store.describe(),
            inserted = counts.inserted,
            updated = counts.updated,
            unchanged = counts.unchanged,
            deleted = counts.deleted,
            "batch loaded"
        );
        Ok(counts)
    }

    pub fn read_back(&self, table: &str, schema: &TableSchema) -> Result<Table, LoadError> {
        self.retry
            .run("read_back", |_| self.store.read_back(table, schema))
    }
}

// ── Stale rows ──────────────────────────────────────────────────────

fn key_specs(schema: &TableSchema) -> Vec<&ColumnSpec> {
    schema
        .key
        .iter()
        .filter_map(|k| schema.column(k))
        .collect()
}

fn key_positions(schema: &TableSchema) -> Vec<usize> {
    schema
        .key
        .iter()
        .filter_map(|k| schema.position(k))
        .collect()
}

fn render_key(cells: &[Cell]) -> Vec<String> {
    cells.iter().map(Cell::render).collect()
}

/// Stored partition keys the batch no longer carries.
fn stale_keys(batch: &LoadBatch, stored: Vec<Vec<Cell>>) -> Vec<Vec<Cell>> {
    let positions = key_positions(&batch.data.schema);
    let current: BTreeSet<Vec<String>> = batch
        .data
        .rows
        .iter()
        .map(|row| positions.iter().map(|&i| row[i].render()).collect())
        .collect();
    stored
        .into_iter()
        .filter(|key| !current.contains(&render_key(key)))
        .collect()
}

// ── Table shape ─────────────────────────────────────────────────────

/// What introspection found for an existing table.
struct ExistingTable {
    columns: BTreeSet<String>,
    /// Column sets of the primary key and every full unique index.
    unique_keys: Vec<BTreeSet<String>>,
}

/// Columns to add so an existing table can take the batch.
///
/// Missing nullable columns are added; a missing required column, or no
/// primary key / unique index covering exactly the key columns, is a
/// schema mismatch.
fn plan_alter<'a>(
    table: &str,
    schema: &'a TableSchema,
    existing: &ExistingTable,
) -> Result<Vec<&'a ColumnSpec>, LoadError> {
    let mut missing = Vec::new();
    for spec in &schema.columns {
        if existing.columns.contains(&spec.name) {
            continue;
        }
        if !spec.nullable {
            return Err(LoadError::mismatch(
                table,
                format!("missing required column '{}'", spec.name),
            ));
        }
        missing.push(spec);
    }

    let key: BTreeSet<String> = schema.key.iter().cloned().collect();
    if !existing.unique_keys.contains(&key) {
        return Err(LoadError::mismatch(
            table,
            format!("no unique constraint on ({})", schema.key.join(", ")),
        ));
    }
    Ok(missing)
}

// ── SQL text ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    fn placeholder(self, n: usize) -> String {
        match self {
            Dialect::Sqlite => format!("?{n}"),
            Dialect::Postgres => format!("${n}"),
        }
    }

    fn column_type(self, kind: ColumnKind) -> &'static str {
        match (self, kind) {
            (Dialect::Sqlite, ColumnKind::Integer) => "INTEGER",
            // decimals and dates as canonical text so they read back exactly
            (Dialect::Sqlite, _) => "TEXT",
            (Dialect::Postgres, ColumnKind::Integer) => "BIGINT",
            (Dialect::Postgres, ColumnKind::Decimal) => "NUMERIC",
            (Dialect::Postgres, ColumnKind::Date) => "DATE",
            (Dialect::Postgres, ColumnKind::Text) => "TEXT",
        }
    }

    /// Null-safe inequality.
    fn differs(self) -> &'static str {
        match self {
            Dialect::Sqlite => "IS NOT",
            Dialect::Postgres => "IS DISTINCT FROM",
        }
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quoted_list<S: AsRef<str>>(names: &[S]) -> String {
    names
        .iter()
        .map(|n| quote(n.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn column_sql(dialect: Dialect, spec: &ColumnSpec) -> String {
    let ty = dialect.column_type(spec.kind);
    if spec.nullable {
        format!("{} {ty}", quote(&spec.name))
    } else {
        format!("{} {ty} NOT NULL", quote(&spec.name))
    }
}

fn create_sql(dialect: Dialect, table: &str, schema: &TableSchema) -> String {
    let mut parts: Vec<String> = schema
        .columns
        .iter()
        .map(|c| column_sql(dialect, c))
        .collect();
    parts.push(format!("PRIMARY KEY ({})", quoted_list(&schema.key)));
    format!("CREATE TABLE {} ({})", quote(table), parts.join(", "))
}

fn add_column_sql(dialect: Dialect, table: &str, spec: &ColumnSpec) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {}",
        quote(table),
        column_sql(dialect, spec)
    )
}

/// `k1 = ?1 AND k2 = ?2`, numbering from `first`.
fn key_predicate(dialect: Dialect, key: &[String], first: usize) -> String {
    key.iter()
        .enumerate()
        .map(|(i, k)| format!("{} = {}", quote(k), dialect.placeholder(first + i)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn select_sql(dialect: Dialect, table: &str, schema: &TableSchema) -> String {
    format!(
        "SELECT 1 FROM {} WHERE {}",
        quote(table),
        key_predicate(dialect, &schema.key, 1)
    )
}

/// `INSERT … ON CONFLICT (key) DO UPDATE … WHERE <any column differs>`;
/// an unchanged row matches no update and reports zero changes.
fn upsert_sql(dialect: Dialect, table: &str, schema: &TableSchema) -> String {
    let names: Vec<&str> = schema.columns.iter().map(|c| c.name.as_str()).collect();
    let placeholders: Vec<String> = (1..=names.len()).map(|i| dialect.placeholder(i)).collect();
    let payload: Vec<&ColumnSpec> = schema
        .columns
        .iter()
        .filter(|c| !schema.key.contains(&c.name))
        .collect();

    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) ",
        quote(table),
        quoted_list(&names),
        placeholders.join(", "),
        quoted_list(&schema.key)
    );
    if payload.is_empty() {
        sql.push_str("DO NOTHING");
        return sql;
    }
    let set = payload
        .iter()
        .map(|c| format!("{0} = excluded.{0}", quote(&c.name)))
        .collect::<Vec<_>>()
        .join(", ");
    let changed = payload
        .iter()
        .map(|c| {
            format!(
                "{0}.{1} {2} excluded.{1}",
                quote(table),
                quote(&c.name),
                dialect.differs()
            )
        })
        .collect::<Vec<_>>()
        .join(" OR ");
    sql.push_str(&format!("DO UPDATE SET {set} WHERE {changed}"));
    sql
}

/// Key columns of every stored row in the partition.
fn partition_keys_sql(dialect: Dialect, table: &str, schema: &TableSchema, column: &str) -> String {
    format!(
        "SELECT {} FROM {} WHERE {} = {}",
        quoted_list(&schema.key),
        quote(table),
        quote(column),
        dialect.placeholder(1)
    )
}

fn delete_sql(dialect: Dialect, table: &str, schema: &TableSchema) -> String {
    format!(
        "DELETE FROM {} WHERE {}",
        quote(table),
        key_predicate(dialect, &schema.key, 1)
    )
}

fn read_sql(table: &str, schema: &TableSchema) -> String {
    let columns: Vec<&str> = schema.columns.iter().map(|c| c.name.as_str()).collect();
    let mut sql = format!("SELECT {} FROM {}", quoted_list(&columns), quote(table));
    if !schema.key.is_empty() {
        sql.push_str(&format!(" ORDER BY {}", quoted_list(&schema.key)));
    }
    sql
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    pub(super) fn schema() -> TableSchema {
        TableSchema::new(
            vec![
                ColumnSpec::required("reference_month", ColumnKind::Text),
                ColumnSpec::required("segment", ColumnKind::Text),
                ColumnSpec::required("balance", ColumnKind::Decimal),
                ColumnSpec::required("contracts", ColumnKind::Integer),
                ColumnSpec::optional("overdue_15d", ColumnKind::Decimal),
            ],
            &["reference_month", "segment"],
        )
    }

    pub(super) fn row(month: &str, segment: &str, balance: Decimal, contracts: i64) -> Vec<Cell> {
        vec![
            Cell::text(month),
            Cell::text(segment),
            Cell::Decimal(balance),
            Cell::Integer(contracts),
            Cell::Null,
        ]
    }

    pub(super) fn batch(rows: Vec<Vec<Cell>>) -> LoadBatch {
        let mut data = Table::new(schema());
        data.rows = rows;
        LoadBatch::new("ft_test", data)
    }

    #[test]
    fn upsert_statement_skips_unchanged_rows() {
        let sql = upsert_sql(Dialect::Sqlite, "t", &schema());
        assert!(sql.contains("VALUES (?1, ?2, ?3, ?4, ?5)"));
        assert!(sql.contains("ON CONFLICT (\"reference_month\", \"segment\")"));
        assert!(sql.contains("\"t\".\"balance\" IS NOT excluded.\"balance\""));
        assert!(!sql.contains("\"segment\" = excluded"));

        let sql = upsert_sql(Dialect::Postgres, "t", &schema());
        assert!(sql.contains("VALUES ($1, $2, $3, $4, $5)"));
        assert!(sql.contains("\"t\".\"balance\" IS DISTINCT FROM excluded.\"balance\""));
    }

    #[test]
    fn postgres_tables_use_native_numeric_types() {
        let sql = create_sql(Dialect::Postgres, "ft", &schema());
        assert!(sql.contains("\"balance\" NUMERIC NOT NULL"));
        assert!(sql.contains("\"contracts\" BIGINT NOT NULL"));
        assert!(sql.contains("\"overdue_15d\" NUMERIC,"));
        assert!(sql.ends_with("PRIMARY KEY (\"reference_month\", \"segment\"))"));

        let sql = create_sql(Dialect::Sqlite, "ft", &schema());
        assert!(sql.contains("\"balance\" TEXT NOT NULL"));
    }

    #[test]
    fn partition_statements_bind_in_key_order() {
        assert_eq!(
            partition_keys_sql(Dialect::Postgres, "ft", &schema(), "reference_month"),
            "SELECT \"reference_month\", \"segment\" FROM \"ft\" WHERE \"reference_month\" = $1"
        );
        assert_eq!(
            delete_sql(Dialect::Sqlite, "ft", &schema()),
            "DELETE FROM \"ft\" WHERE \"reference_month\" = ?1 AND \"segment\" = ?2"
        );
    }

    #[test]
    fn stale_keys_are_those_missing_from_the_batch() {
        let b = batch(vec![
            row("2024-03", "A", dec!(1), 1),
            row("2024-03", "*", dec!(1), 1),
        ]);
        let stored = vec![
            vec![Cell::text("2024-03"), Cell::text("A")],
            vec![Cell::text("2024-03"), Cell::text("C")],
            vec![Cell::text("2024-03"), Cell::text("*")],
        ];
        assert_eq!(
            stale_keys(&b, stored),
            vec![vec![Cell::text("2024-03"), Cell::text("C")]]
        );
    }

    #[test]
    fn partition_must_cover_every_row() {
        let b = batch(vec![row("2024-03", "A", dec!(1), 1), row("2024-04", "A", dec!(1), 1)])
            .replacing("reference_month", Cell::text("2024-03"));
        let err = b.check().unwrap_err();
        assert!(matches!(err, LoadError::ConstraintViolation { .. }), "{err}");

        let b = batch(vec![]).replacing("month", Cell::text("2024-03"));
        assert!(matches!(b.check(), Err(LoadError::SchemaMismatch { .. })));
    }

    #[test]
    fn existing_table_needs_the_key_as_a_unique_constraint() {
        let existing = ExistingTable {
            columns: ["reference_month", "segment", "balance", "contracts"]
                .into_iter()
                .map(String::from)
                .collect(),
            unique_keys: vec![["segment", "reference_month"]
                .into_iter()
                .map(String::from)
                .collect()],
        };
        let binding = schema();
        let missing = plan_alter("ft", &binding, &existing).unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].name, "overdue_15d");

        let no_key = ExistingTable {
            unique_keys: Vec::new(),
            ..existing
        };
        assert!(matches!(
            plan_alter("ft", &schema(), &no_key),
            Err(LoadError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn counts_include_deletions() {
        let mut total = LoadCounts {
            inserted: 1,
            ..LoadCounts::default()
        };
        total += LoadCounts {
            deleted: 2,
            unchanged: 5,
            ..LoadCounts::default()
        };
        assert_eq!(total.changed(), 3);
        assert_eq!(total.unchanged, 5);
    }
}
