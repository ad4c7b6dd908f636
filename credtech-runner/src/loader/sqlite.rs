//! Embedded single-file store.

use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, ErrorCode, OptionalExtension, Transaction};
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use credtech_core::data::{Cell, ColumnKind, ColumnSpec, Table, TableSchema};

use super::{
    add_column_sql, create_sql, delete_sql, key_positions, key_specs, partition_keys_sql,
    plan_alter, read_sql, select_sql, stale_keys, upsert_sql, Dialect, ExistingTable, LoadBatch,
    LoadCounts, LoadError, Partition, Store,
};
use crate::config::DatabaseConfig;

const DIALECT: Dialect = Dialect::Sqlite;

fn store_err(table: &str) -> impl Fn(rusqlite::Error) -> LoadError + '_ {
    move |e| {
        let reason = e.to_string();
        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen) => {
                LoadError::Connection { reason }
            }
            Some(ErrorCode::ConstraintViolation | ErrorCode::TypeMismatch) => {
                LoadError::ConstraintViolation {
                    table: table.to_string(),
                    reason,
                }
            }
            _ => LoadError::Store {
                table: table.to_string(),
                reason,
            },
        }
    }
}

/// SQLite database file at `path`.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            busy_timeout,
        }
    }

    pub fn from_config(database: &DatabaseConfig) -> Self {
        Self::new(
            &database.path,
            Duration::from_millis(database.busy_timeout_ms),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection, LoadError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| LoadError::Connection {
                reason: format!("{}: {e}", parent.display()),
            })?;
        }
        let conn = Connection::open(&self.path).map_err(|e| LoadError::Connection {
            reason: format!("{}: {e}", self.path.display()),
        })?;
        conn.busy_timeout(self.busy_timeout)
            .map_err(|e| LoadError::Connection {
                reason: e.to_string(),
            })?;
        Ok(conn)
    }
}

impl Store for SqliteStore {
    fn describe(&self) -> String {
        format!("sqlite://{}", self.path.display())
    }

    fn apply(&self, batch: &LoadBatch) -> Result<LoadCounts, LoadError> {
        let mut conn = self.connect()?;
        let table = batch.target.as_str();
        let err = store_err(table);
        let schema = &batch.data.schema;

        let tx = conn.transaction().map_err(&err)?;
        ensure_table(&tx, table, schema)?;

        let mut counts = LoadCounts::default();
        {
            let key_positions = key_positions(schema);
            let mut exists = tx.prepare(&select_sql(DIALECT, table, schema)).map_err(&err)?;
            let mut upsert = tx.prepare(&upsert_sql(DIALECT, table, schema)).map_err(&err)?;

            for row in &batch.data.rows {
                let values: Vec<Value> = row.iter().map(to_sql).collect();
                let key: Vec<&Value> = key_positions.iter().map(|&i| &values[i]).collect();
                let existed = exists.exists(params_from_iter(key)).map_err(&err)?;
                let written = upsert.execute(params_from_iter(values.iter())).map_err(&err)?;
                counts.tally(existed, written as u64);
            }
        }
        if let Some(partition) = &batch.partition {
            counts.deleted = delete_stale(&tx, batch, partition)?;
        }

        tx.commit().map_err(&err)?;
        Ok(counts)
    }

    fn read_back(&self, table: &str, schema: &TableSchema) -> Result<Table, LoadError> {
        let mut out = Table::new(schema.clone());
        // reading never creates the store file
        if !self.path.is_file() {
            return Ok(out);
        }
        let conn = self.connect()?;
        let err = store_err(table);
        if !table_exists(&conn, table).map_err(&err)? {
            return Ok(out);
        }

        let mut stmt = conn.prepare(&read_sql(table, schema)).map_err(&err)?;
        let mut rows = stmt.query([]).map_err(&err)?;
        while let Some(row) = rows.next().map_err(&err)? {
            let mut cells = Vec::with_capacity(schema.columns.len());
            for (index, spec) in schema.columns.iter().enumerate() {
                let value: Value = row.get(index).map_err(&err)?;
                cells.push(from_sql(table, spec, value)?);
            }
            out.rows.push(cells);
        }
        Ok(out)
    }
}

/// Delete stored rows of the partition whose key the batch no longer has.
fn delete_stale(
    tx: &Transaction<'_>,
    batch: &LoadBatch,
    partition: &Partition,
) -> Result<u64, LoadError> {
    let table = batch.target.as_str();
    let err = store_err(table);
    let schema = &batch.data.schema;
    let keys = key_specs(schema);

    let mut stored = Vec::new();
    {
        let mut select = tx
            .prepare(&partition_keys_sql(DIALECT, table, schema, &partition.column))
            .map_err(&err)?;
        let mut rows = select.query([to_sql(&partition.value)]).map_err(&err)?;
        while let Some(row) = rows.next().map_err(&err)? {
            let mut cells = Vec::with_capacity(keys.len());
            for (index, spec) in keys.iter().enumerate() {
                let value: Value = row.get(index).map_err(&err)?;
                cells.push(from_sql(table, spec, value)?);
            }
            stored.push(cells);
        }
    }

    let mut delete = tx.prepare(&delete_sql(DIALECT, table, schema)).map_err(&err)?;
    let mut deleted = 0;
    for key in stale_keys(batch, stored) {
        deleted += delete
            .execute(params_from_iter(key.iter().map(to_sql)))
            .map_err(&err)? as u64;
    }
    Ok(deleted)
}

/// Create the table when absent; otherwise add missing nullable columns.
fn ensure_table(tx: &Transaction<'_>, table: &str, schema: &TableSchema) -> Result<(), LoadError> {
    let err = store_err(table);
    if !table_exists(tx, table).map_err(&err)? {
        tx.execute_batch(&create_sql(DIALECT, table, schema))
            .map_err(&err)?;
        tracing::info!(table, "created table");
        return Ok(());
    }

    let existing = introspect(tx, table).map_err(&err)?;
    for spec in plan_alter(table, schema, &existing)? {
        tx.execute_batch(&add_column_sql(DIALECT, table, spec))
            .map_err(&err)?;
        tracing::info!(table, column = %spec.name, "added nullable column");
    }
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

fn introspect(conn: &Connection, table: &str) -> rusqlite::Result<ExistingTable> {
    let mut columns = BTreeSet::new();
    let mut primary_key = BTreeSet::new();
    {
        let mut stmt = conn.prepare("SELECT name, pk FROM pragma_table_info(?1)")?;
        let rows =
            stmt.query_map([table], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (name, pk) = row?;
            if pk > 0 {
                primary_key.insert(name.clone());
            }
            columns.insert(name);
        }
    }

    let mut unique_keys = vec![primary_key];
    let mut list = conn.prepare(
        "SELECT name FROM pragma_index_list(?1) WHERE \"unique\" = 1 AND partial = 0",
    )?;
    let indexes = list
        .query_map([table], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut info = conn.prepare("SELECT name FROM pragma_index_info(?1)")?;
    for index in indexes {
        unique_keys.push(
            info.query_map([&index], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<BTreeSet<_>>>()?,
        );
    }
    Ok(ExistingTable {
        columns,
        unique_keys,
    })
}

// ── Values ──────────────────────────────────────────────────────────

fn to_sql(cell: &Cell) -> Value {
    match cell {
        Cell::Null => Value::Null,
        Cell::Integer(v) => Value::Integer(*v),
        Cell::Text(_) | Cell::Decimal(_) | Cell::Date(_) => Value::Text(cell.render()),
    }
}

fn from_sql(table: &str, spec: &ColumnSpec, value: Value) -> Result<Cell, LoadError> {
    let bad = |found: &str| {
        LoadError::mismatch(
            table,
            format!("column '{}' holds {found}, expected {}", spec.name, spec.kind),
        )
    };
    let cell = match (spec.kind, value) {
        (_, Value::Null) => Cell::Null,
        (ColumnKind::Integer, Value::Integer(v)) => Cell::Integer(v),
        (ColumnKind::Text, Value::Text(s)) => Cell::text(s),
        (ColumnKind::Decimal, Value::Text(s)) => {
            Cell::Decimal(Decimal::from_str(&s).map_err(|_| bad(&format!("'{s}'")))?)
        }
        (ColumnKind::Decimal, Value::Integer(v)) => Cell::Decimal(Decimal::from(v)),
        (ColumnKind::Date, Value::Text(s)) => Cell::Date(
            NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|_| bad(&format!("'{s}'")))?,
        ),
        (_, Value::Integer(_)) => return Err(bad("an integer")),
        (_, Value::Real(_)) => return Err(bad("a float")),
        (_, Value::Text(_)) => return Err(bad("text")),
        (_, Value::Blob(_)) => return Err(bad("a blob")),
    };
    Ok(cell)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::tests::{batch, row, schema};
    use crate::loader::Loader;
    use crate::retry::{RetryPolicy, Retryable};
    use rust_decimal_macros::dec;

    fn store(dir: &Path) -> SqliteStore {
        SqliteStore::new(dir.join("store.db"), Duration::from_millis(100))
    }

    fn loader(dir: &Path) -> Loader {
        Loader::new(store(dir), RetryPolicy::none())
    }

    fn march(segment: &str, balance: Decimal, contracts: i64) -> Vec<Cell> {
        row("2024-03", segment, balance, contracts)
    }

    #[test]
    fn first_load_inserts_second_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path());
        let b = batch(vec![
            march("A", dec!(1000), 10),
            march("B", dec!(500), 5),
            march("*", dec!(1500), 15),
        ]);

        let first = loader.load(&b).unwrap();
        assert_eq!(first, LoadCounts { inserted: 3, ..LoadCounts::default() });
        let second = loader.load(&b).unwrap();
        assert_eq!(second, LoadCounts { unchanged: 3, ..LoadCounts::default() });
        assert_eq!(loader.read_back("ft_test", &schema()).unwrap().len(), 3);
    }

    #[test]
    fn changed_values_update_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path());
        loader.load(&batch(vec![march("A", dec!(1000), 10)])).unwrap();
        let counts = loader
            .load(&batch(vec![march("A", dec!(1200), 12), march("B", dec!(1), 1)]))
            .unwrap();
        assert_eq!(
            counts,
            LoadCounts {
                inserted: 1,
                updated: 1,
                ..LoadCounts::default()
            }
        );

        let back = loader.read_back("ft_test", &schema()).unwrap();
        assert_eq!(back.rows[0][2], Cell::Decimal(dec!(1200)));
        assert_eq!(back.rows[0][3], Cell::Integer(12));
    }

    #[test]
    fn replaced_partition_drops_rows_the_batch_no_longer_has() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path());
        let april = row("2024-04", "C", dec!(7), 1);
        loader
            .load(&batch(vec![
                march("A", dec!(1000), 10),
                march("B", dec!(500), 5),
                march("C", dec!(300), 3),
                march("*", dec!(1800), 18),
                april.clone(),
            ]))
            .unwrap();

        let corrected = batch(vec![
            march("A", dec!(1000), 10),
            march("B", dec!(500), 5),
            march("*", dec!(1500), 15),
        ])
        .replacing("reference_month", Cell::text("2024-03"));
        let counts = loader.load(&corrected).unwrap();
        assert_eq!(
            counts,
            LoadCounts {
                inserted: 0,
                updated: 1,
                unchanged: 2,
                deleted: 1,
            }
        );

        let back = loader.read_back("ft_test", &schema()).unwrap();
        assert_eq!(back.len(), 4);
        assert!(!back.rows.iter().any(|r| r[0] == Cell::text("2024-03") && r[1] == Cell::text("C")));
        // other partitions are untouched
        assert!(back.rows.contains(&april));

        // an empty batch clears its partition
        let cleared = batch(Vec::new()).replacing("reference_month", Cell::text("2024-03"));
        assert_eq!(loader.load(&cleared).unwrap().deleted, 3);
        assert_eq!(loader.read_back("ft_test", &schema()).unwrap().rows, vec![april]);
    }

    #[test]
    fn decimals_round_trip_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path());
        let mut r = march("A", dec!(123456789.12345678), 1);
        r[4] = Cell::Decimal(dec!(0.00000001));
        let b = batch(vec![r]);
        loader.load(&b).unwrap();
        assert_eq!(loader.read_back("ft_test", &schema()).unwrap().rows, b.data.rows);
    }

    #[test]
    fn missing_store_reads_back_empty_without_creating_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.read_back("ft_absent", &schema()).unwrap().is_empty());
        assert!(!store.path().exists());

        loader(dir.path()).load(&batch(vec![march("A", dec!(1), 1)])).unwrap();
        assert!(store.read_back("ft_absent", &schema()).unwrap().is_empty());
    }

    #[test]
    fn table_without_key_constraint_is_a_schema_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(store(dir.path()).path()).unwrap();
        conn.execute_batch(
            "CREATE TABLE ft_test (reference_month TEXT, segment TEXT, balance TEXT, contracts INTEGER)",
        )
        .unwrap();
        drop(conn);

        let err = loader(dir.path())
            .load(&batch(vec![march("A", dec!(1), 1)]))
            .unwrap_err();
        assert!(matches!(err, LoadError::SchemaMismatch { .. }), "{err}");
    }

    #[test]
    fn unique_index_counts_as_key_and_optional_columns_are_added() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(store(dir.path()).path()).unwrap();
        conn.execute_batch(
            "CREATE TABLE ft_test (reference_month TEXT, segment TEXT, balance TEXT, contracts INTEGER);
             CREATE UNIQUE INDEX ux_key ON ft_test (segment, reference_month);",
        )
        .unwrap();
        drop(conn);

        let loader = loader(dir.path());
        let counts = loader.load(&batch(vec![march("A", dec!(1), 1)])).unwrap();
        assert_eq!(counts.inserted, 1);
        assert_eq!(loader.read_back("ft_test", &schema()).unwrap().len(), 1);
    }

    #[test]
    fn missing_required_column_is_a_schema_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(store(dir.path()).path()).unwrap();
        conn.execute_batch(
            "CREATE TABLE ft_test (reference_month TEXT, segment TEXT, balance TEXT,
             PRIMARY KEY (reference_month, segment))",
        )
        .unwrap();
        drop(conn);

        let err = loader(dir.path())
            .load(&batch(vec![march("A", dec!(1), 1)]))
            .unwrap_err();
        assert!(matches!(err, LoadError::SchemaMismatch { reason, .. } if reason.contains("contracts")));
    }

    #[test]
    fn null_in_required_column_is_a_constraint_violation() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = march("A", dec!(1), 1);
        r[2] = Cell::Null;
        let err = loader(dir.path()).load(&batch(vec![r])).unwrap_err();
        assert!(matches!(err, LoadError::ConstraintViolation { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn check_constraint_failure_rolls_back_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(store(dir.path()).path()).unwrap();
        conn.execute_batch(
            "CREATE TABLE ft_test (reference_month TEXT NOT NULL, segment TEXT NOT NULL,
             balance TEXT NOT NULL, contracts INTEGER NOT NULL CHECK (contracts < 100),
             overdue_15d TEXT, PRIMARY KEY (reference_month, segment))",
        )
        .unwrap();
        drop(conn);

        let loader = loader(dir.path());
        let err = loader
            .load(&batch(vec![march("A", dec!(1), 1), march("B", dec!(1), 500)]))
            .unwrap_err();
        assert!(matches!(err, LoadError::ConstraintViolation { .. }), "{err}");
        assert!(loader.read_back("ft_test", &schema()).unwrap().is_empty());
    }

    #[test]
    fn unopenable_store_is_a_retryable_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        // a directory cannot be opened as a database file
        let loader = Loader::new(
            SqliteStore::new(dir.path(), Duration::from_millis(10)),
            RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(1)),
        );
        let err = loader.load(&batch(vec![march("A", dec!(1), 1)])).unwrap_err();
        assert!(err.is_retryable(), "{err}");
    }
}
