//! PostgreSQL store over the synchronous `postgres` client.
//!
//! Decimals are NUMERIC and dates DATE, so the stored values keep their
//! scale and compare natively in SQL.

use ::postgres::error::SqlState;
use ::postgres::types::ToSql;
use ::postgres::{Client, Config, GenericClient, NoTls, Row, Transaction};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::error::Error as _;
use std::time::Duration;

use credtech_core::data::{Cell, ColumnKind, ColumnSpec, Table, TableSchema};

use super::{
    add_column_sql, create_sql, delete_sql, key_positions, key_specs, partition_keys_sql,
    plan_alter, read_sql, select_sql, stale_keys, upsert_sql, Dialect, ExistingTable, LoadBatch,
    LoadCounts, LoadError, Partition, Store,
};
use crate::config::DatabaseConfig;

const DIALECT: Dialect = Dialect::Postgres;

type Param = Box<dyn ToSql + Sync>;

/// Map a client error onto the loader's failure classes by SQLSTATE class.
fn store_err(table: &str) -> impl Fn(::postgres::Error) -> LoadError + '_ {
    move |e| {
        let reason = e.to_string();
        let table = table.to_string();
        match e.code() {
            Some(code) if *code == SqlState::DATATYPE_MISMATCH || *code == SqlState::UNDEFINED_COLUMN => {
                LoadError::SchemaMismatch { table, reason }
            }
            Some(code) => match code.code().get(..2) {
                // integrity constraint, data exception
                Some("23" | "22") => LoadError::ConstraintViolation { table, reason },
                // connection, transaction rollback, resources, operator intervention
                Some("08" | "40" | "53" | "57") => LoadError::Connection { reason },
                _ => LoadError::Store { table, reason },
            },
            None if e.is_closed() || e.source().is_some_and(|s| s.is::<std::io::Error>()) => {
                LoadError::Connection { reason }
            }
            // parameter or column conversion: the table's types differ from the batch
            None => LoadError::SchemaMismatch { table, reason },
        }
    }
}

/// PostgreSQL database reached over TCP.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    config: Config,
    label: String,
}

impl PostgresStore {
    /// `label` names the store in logs; keep credentials out of it.
    pub fn new(config: Config, label: impl Into<String>) -> Self {
        Self {
            config,
            label: label.into(),
        }
    }

    pub fn from_config(database: &DatabaseConfig) -> Self {
        let mut config = Config::new();
        config
            .host(&database.host)
            .port(database.port)
            .dbname(&database.database)
            .user(&database.user)
            .application_name("credtech")
            .connect_timeout(Duration::from_millis(database.connect_timeout_ms));
        if !database.password.is_empty() {
            config.password(&database.password);
        }
        Self::new(config, database.describe())
    }

    fn connect(&self) -> Result<Client, LoadError> {
        self.config
            .connect(NoTls)
            .map_err(|e| LoadError::Connection {
                reason: format!("{}: {e}", self.label),
            })
    }
}

impl Store for PostgresStore {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn apply(&self, batch: &LoadBatch) -> Result<LoadCounts, LoadError> {
        let mut client = self.connect()?;
        let table = batch.target.as_str();
        let err = store_err(table);
        let schema = &batch.data.schema;

        let mut tx = client.transaction().map_err(&err)?;
        ensure_table(&mut tx, table, schema)?;

        let key_positions = key_positions(schema);
        let exists = tx.prepare(&select_sql(DIALECT, table, schema)).map_err(&err)?;
        let upsert = tx.prepare(&upsert_sql(DIALECT, table, schema)).map_err(&err)?;

        let mut counts = LoadCounts::default();
        for row in &batch.data.rows {
            let values: Vec<Param> = schema
                .columns
                .iter()
                .zip(row)
                .map(|(spec, cell)| to_param(spec.kind, cell))
                .collect();
            let key: Vec<&(dyn ToSql + Sync)> =
                key_positions.iter().map(|&i| values[i].as_ref()).collect();
            let existed = tx.query_opt(&exists, &key).map_err(&err)?.is_some();
            let written = tx.execute(&upsert, &refs(&values)).map_err(&err)?;
            counts.tally(existed, written);
        }
        if let Some(partition) = &batch.partition {
            counts.deleted = delete_stale(&mut tx, batch, partition)?;
        }

        tx.commit().map_err(&err)?;
        Ok(counts)
    }

    fn read_back(&self, table: &str, schema: &TableSchema) -> Result<Table, LoadError> {
        let mut client = self.connect()?;
        let err = store_err(table);
        let mut out = Table::new(schema.clone());
        if !table_exists(&mut client, table).map_err(&err)? {
            return Ok(out);
        }

        let sql = read_sql(table, schema);
        for row in client.query(sql.as_str(), &[]).map_err(&err)? {
            let cells = schema
                .columns
                .iter()
                .enumerate()
                .map(|(index, spec)| from_row(table, &row, index, spec))
                .collect::<Result<Vec<_>, _>>()?;
            out.rows.push(cells);
        }
        Ok(out)
    }
}

fn refs(values: &[Param]) -> Vec<&(dyn ToSql + Sync)> {
    values.iter().map(|v| v.as_ref()).collect()
}

/// Delete stored rows of the partition whose key the batch no longer has.
fn delete_stale(
    tx: &mut Transaction<'_>,
    batch: &LoadBatch,
    partition: &Partition,
) -> Result<u64, LoadError> {
    let table = batch.target.as_str();
    let err = store_err(table);
    let schema = &batch.data.schema;
    let keys = key_specs(schema);
    let partition_kind = schema
        .column(&partition.column)
        .map(|spec| spec.kind)
        .unwrap_or(ColumnKind::Text);

    let sql = partition_keys_sql(DIALECT, table, schema, &partition.column);
    let value = to_param(partition_kind, &partition.value);
    let rows = tx.query(sql.as_str(), &[value.as_ref()]).map_err(&err)?;
    let stored = rows
        .iter()
        .map(|row| {
            keys.iter()
                .enumerate()
                .map(|(index, spec)| from_row(table, row, index, spec))
                .collect::<Result<Vec<_>, _>>()
        })
        .collect::<Result<Vec<_>, _>>()?;

    let delete = tx.prepare(&delete_sql(DIALECT, table, schema)).map_err(&err)?;
    let mut deleted = 0;
    for key in stale_keys(batch, stored) {
        let values: Vec<Param> = keys
            .iter()
            .zip(&key)
            .map(|(spec, cell)| to_param(spec.kind, cell))
            .collect();
        deleted += tx.execute(&delete, &refs(&values)).map_err(&err)?;
    }
    Ok(deleted)
}

/// Create the table when absent; otherwise add missing nullable columns.
fn ensure_table(
    tx: &mut Transaction<'_>,
    table: &str,
    schema: &TableSchema,
) -> Result<(), LoadError> {
    let err = store_err(table);
    let Some(existing) = introspect(tx, table).map_err(&err)? else {
        tx.batch_execute(&create_sql(DIALECT, table, schema))
            .map_err(&err)?;
        tracing::info!(table, "created table");
        return Ok(());
    };
    for spec in plan_alter(table, schema, &existing)? {
        tx.batch_execute(&add_column_sql(DIALECT, table, spec))
            .map_err(&err)?;
        tracing::info!(table, column = %spec.name, "added nullable column");
    }
    Ok(())
}

fn table_exists(client: &mut impl GenericClient, table: &str) -> Result<bool, ::postgres::Error> {
    let found = client.query_opt(
        "SELECT 1 FROM information_schema.tables \
         WHERE table_schema = current_schema() AND table_name::text = $1",
        &[&table],
    )?;
    Ok(found.is_some())
}

/// Columns and unique key sets of `table` in the current schema, or `None`
/// when the table does not exist.
fn introspect(
    client: &mut impl GenericClient,
    table: &str,
) -> Result<Option<ExistingTable>, ::postgres::Error> {
    let columns = client
        .query(
            "SELECT column_name::text FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name::text = $1",
            &[&table],
        )?
        .iter()
        .map(|row| row.try_get::<_, String>(0))
        .collect::<Result<BTreeSet<_>, _>>()?;
    if columns.is_empty() {
        return Ok(None);
    }

    // primary keys are unique indexes too; partial indexes cannot back ON CONFLICT
    let unique_keys = client
        .query(
            "SELECT array_agg(a.attname::text) \
             FROM pg_index i \
             JOIN pg_class c ON c.oid = i.indrelid \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = ANY(i.indkey) \
             WHERE n.nspname = current_schema() AND c.relname::text = $1 \
               AND i.indisunique AND i.indpred IS NULL \
             GROUP BY i.indexrelid",
            &[&table],
        )?
        .iter()
        .map(|row| {
            row.try_get::<_, Vec<String>>(0)
                .map(|names| names.into_iter().collect::<BTreeSet<_>>())
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(ExistingTable {
        columns,
        unique_keys,
    }))
}

// ── Values ──────────────────────────────────────────────────────────

/// Bind a cell with the Rust type matching its column kind, so nulls are
/// typed too.
fn to_param(kind: ColumnKind, cell: &Cell) -> Param {
    match (kind, cell) {
        (_, Cell::Integer(v)) => Box::new(*v),
        (_, Cell::Decimal(v)) => Box::new(*v),
        (_, Cell::Date(v)) => Box::new(*v),
        (_, Cell::Text(s)) => Box::new(s.clone()),
        (ColumnKind::Integer, Cell::Null) => Box::new(None::<i64>),
        (ColumnKind::Decimal, Cell::Null) => Box::new(None::<Decimal>),
        (ColumnKind::Date, Cell::Null) => Box::new(None::<NaiveDate>),
        (ColumnKind::Text, Cell::Null) => Box::new(None::<String>),
    }
}

fn from_row(table: &str, row: &Row, index: usize, spec: &ColumnSpec) -> Result<Cell, LoadError> {
    let cell = match spec.kind {
        ColumnKind::Integer => row
            .try_get::<_, Option<i64>>(index)
            .map(|v| v.map(Cell::Integer)),
        ColumnKind::Decimal => row
            .try_get::<_, Option<Decimal>>(index)
            .map(|v| v.map(Cell::Decimal)),
        ColumnKind::Date => row
            .try_get::<_, Option<NaiveDate>>(index)
            .map(|v| v.map(Cell::Date)),
        ColumnKind::Text => row
            .try_get::<_, Option<String>>(index)
            .map(|v| v.map(Cell::text)),
    };
    cell.map(|c| c.unwrap_or(Cell::Null)).map_err(|e| {
        LoadError::mismatch(
            table,
            format!("column '{}' does not read as {}: {e}", spec.name, spec.kind),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::tests::{batch, row, schema};
    use crate::loader::Loader;
    use crate::retry::{RetryPolicy, Retryable};
    use rust_decimal_macros::dec;
    use std::str::FromStr;

    /// Live tests run only when this names a scratch database,
    /// e.g. `host=localhost user=postgres dbname=credtech_test`.
    const URL_VAR: &str = "CREDTECH_TEST_POSTGRES_URL";

    fn live_store() -> Option<PostgresStore> {
        let url = std::env::var(URL_VAR).ok()?;
        let config = Config::from_str(&url).unwrap();
        Some(PostgresStore::new(config, "postgres test"))
    }

    fn drop_table(store: &PostgresStore, table: &str) {
        let mut client = store.connect().unwrap();
        client
            .batch_execute(&format!("DROP TABLE IF EXISTS \"{table}\""))
            .unwrap();
    }

    #[test]
    fn config_maps_onto_the_client() {
        let database = DatabaseConfig {
            host: "db.internal".into(),
            port: 6543,
            user: "etl".into(),
            password: "s3cret".into(),
            ..DatabaseConfig::default()
        };
        let store = PostgresStore::from_config(&database);
        assert_eq!(store.config.get_ports(), [6543]);
        assert_eq!(store.config.get_dbname(), Some("credtech"));
        assert_eq!(store.config.get_user(), Some("etl"));
        assert_eq!(store.config.get_password(), Some(&b"s3cret"[..]));
        assert_eq!(store.describe(), "postgres://etl@db.internal:6543/credtech");
    }

    #[test]
    fn unreachable_server_is_a_retryable_connection_error() {
        let mut config = Config::new();
        config
            .host("127.0.0.1")
            .port(1)
            .user("nobody")
            .connect_timeout(Duration::from_millis(200));
        let loader = Loader::new(PostgresStore::new(config, "closed port"), RetryPolicy::none());
        let err = loader
            .load(&batch(vec![row("2024-03", "A", dec!(1), 1)]))
            .unwrap_err();
        assert!(matches!(err, LoadError::Connection { .. }), "{err}");
        assert!(err.is_retryable());
    }

    #[test]
    fn live_upsert_replace_and_read_back() {
        let Some(store) = live_store() else {
            eprintln!("{URL_VAR} not set; skipping");
            return;
        };
        let table = "ft_credtech_loader_test";
        drop_table(&store, table);
        let loader = Loader::new(store.clone(), RetryPolicy::none());
        let with_target = |mut b: LoadBatch| {
            b.target = table.to_string();
            b
        };

        let first = with_target(batch(vec![
            row("2024-03", "A", dec!(1000.50), 10),
            row("2024-03", "C", dec!(300), 3),
            row("2024-03", "*", dec!(1300.50), 13),
        ]));
        assert_eq!(loader.load(&first).unwrap().inserted, 3);
        assert_eq!(loader.load(&first).unwrap().unchanged, 3);

        let corrected = with_target(batch(vec![
            row("2024-03", "A", dec!(1000.50), 10),
            row("2024-03", "*", dec!(1000.50), 10),
        ]))
        .replacing("reference_month", Cell::text("2024-03"));
        assert_eq!(
            loader.load(&corrected).unwrap(),
            LoadCounts {
                inserted: 0,
                updated: 1,
                unchanged: 1,
                deleted: 1,
            }
        );

        let mut back = loader.read_back(table, &schema()).unwrap().rows;
        back.sort();
        let mut expected = corrected.data.rows.clone();
        expected.sort();
        assert_eq!(back, expected);
        // NUMERIC keeps the scale
        assert!(back.iter().all(|r| r[2].render() == "1000.50"));
        drop_table(&store, table);
    }

    #[test]
    fn live_missing_table_reads_back_empty() {
        let Some(store) = live_store() else {
            eprintln!("{URL_VAR} not set; skipping");
            return;
        };
        assert!(store
            .read_back("ft_credtech_absent", &schema())
            .unwrap()
            .is_empty());
    }
}
