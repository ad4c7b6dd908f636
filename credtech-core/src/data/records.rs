//! Tabular layouts of the Silver and Gold records.

use std::collections::BTreeMap;

use super::schema::{Cell, ColumnKind, ColumnSpec, SchemaError, TableRecord, TableSchema};
use crate::domain::{
    CreditAggregate, CreditRecord, Dimension, IndicatorObservation, IndicatorPoint, Observation,
    Periodicity, ReferenceMonth,
};

fn month_cell(column: &str, cell: &Cell) -> Result<ReferenceMonth, SchemaError> {
    let raw = cell.as_text(column)?;
    raw.parse().map_err(|e: crate::domain::PeriodError| SchemaError::InvalidValue {
        column: column.to_string(),
        reason: e.to_string(),
    })
}

fn periodicity_cell(column: &str, cell: &Cell) -> Result<Periodicity, SchemaError> {
    let raw = cell.as_text(column)?;
    raw.parse()
        .map_err(|reason| SchemaError::InvalidValue {
            column: column.to_string(),
            reason,
        })
}

const CREDIT_MEASURES: usize = 5;

impl TableRecord for CreditRecord {
    fn schema() -> TableSchema {
        let mut columns = vec![
            ColumnSpec::required("reference_month", ColumnKind::Text),
            ColumnSpec::required("segment", ColumnKind::Text),
            ColumnSpec::required("modality", ColumnKind::Text),
        ];
        columns.extend(
            Dimension::ALL
                .iter()
                .map(|d| ColumnSpec::optional(d.column(), ColumnKind::Text)),
        );
        columns.extend([
            ColumnSpec::required("balance", ColumnKind::Decimal),
            ColumnSpec::required("contracts", ColumnKind::Integer),
            ColumnSpec::optional("overdue_15d", ColumnKind::Decimal),
            ColumnSpec::optional("defaulted", ColumnKind::Decimal),
            ColumnSpec::optional("problem_assets", ColumnKind::Decimal),
        ]);

        let mut key = vec!["reference_month", "segment", "modality"];
        key.extend(Dimension::ALL.iter().map(|d| d.column()));
        TableSchema::new(columns, &key)
    }

    fn to_row(&self) -> Vec<Cell> {
        let mut row = Vec::with_capacity(3 + Dimension::ALL.len() + CREDIT_MEASURES);
        row.push(Cell::text(self.reference_month.to_string()));
        row.push(Cell::text(&self.segment));
        row.push(Cell::text(&self.modality));
        for dim in Dimension::ALL {
            row.push(Cell::opt_text(self.dimensions.get(&dim).map(String::as_str)));
        }
        row.push(Cell::Decimal(self.balance));
        row.push(Cell::Integer(self.contracts));
        row.push(Cell::opt_decimal(self.overdue_15d));
        row.push(Cell::opt_decimal(self.defaulted));
        row.push(Cell::opt_decimal(self.problem_assets));
        row
    }

    fn from_row(row: &[Cell]) -> Result<Self, SchemaError> {
        let dims = Dimension::ALL.len();
        let mut dimensions = BTreeMap::new();
        for (offset, dim) in Dimension::ALL.iter().enumerate() {
            if let Some(value) = row[3 + offset].as_opt_text(dim.column())? {
                dimensions.insert(*dim, value);
            }
        }
        let m = 3 + dims;
        Ok(CreditRecord {
            reference_month: month_cell("reference_month", &row[0])?,
            segment: row[1].as_opt_text("segment")?.unwrap_or_default(),
            modality: row[2].as_opt_text("modality")?.unwrap_or_default(),
            dimensions,
            balance: row[m].as_decimal("balance")?,
            contracts: row[m + 1].as_integer("contracts")?,
            overdue_15d: row[m + 2].as_opt_decimal("overdue_15d")?,
            defaulted: row[m + 3].as_opt_decimal("defaulted")?,
            problem_assets: row[m + 4].as_opt_decimal("problem_assets")?,
        })
    }
}

impl TableRecord for CreditAggregate {
    fn schema() -> TableSchema {
        TableSchema::new(
            vec![
                ColumnSpec::required("reference_month", ColumnKind::Text),
                ColumnSpec::required("segment", ColumnKind::Text),
                ColumnSpec::required("modality", ColumnKind::Text),
                ColumnSpec::required("balance", ColumnKind::Decimal),
                ColumnSpec::required("contracts", ColumnKind::Integer),
                ColumnSpec::optional("overdue_15d", ColumnKind::Decimal),
                ColumnSpec::optional("defaulted", ColumnKind::Decimal),
                ColumnSpec::optional("problem_assets", ColumnKind::Decimal),
                ColumnSpec::required("record_count", ColumnKind::Integer),
                ColumnSpec::required("default_rate", ColumnKind::Decimal),
                ColumnSpec::required("problem_asset_ratio", ColumnKind::Decimal),
            ],
            &["reference_month", "segment", "modality"],
        )
    }

    fn to_row(&self) -> Vec<Cell> {
        vec![
            Cell::text(self.reference_month.to_string()),
            Cell::text(&self.segment),
            Cell::text(&self.modality),
            Cell::Decimal(self.balance),
            Cell::Integer(self.contracts),
            Cell::opt_decimal(self.overdue_15d),
            Cell::opt_decimal(self.defaulted),
            Cell::opt_decimal(self.problem_assets),
            Cell::Integer(self.record_count as i64),
            Cell::Decimal(self.default_rate()),
            Cell::Decimal(self.problem_asset_ratio()),
        ]
    }

    /// Ratios are derived, so the stored ratio columns are not read back.
    fn from_row(row: &[Cell]) -> Result<Self, SchemaError> {
        let record_count = row[8].as_integer("record_count")?;
        Ok(CreditAggregate {
            reference_month: month_cell("reference_month", &row[0])?,
            segment: row[1].as_opt_text("segment")?.unwrap_or_default(),
            modality: row[2].as_opt_text("modality")?.unwrap_or_default(),
            balance: row[3].as_decimal("balance")?,
            contracts: row[4].as_integer("contracts")?,
            overdue_15d: row[5].as_opt_decimal("overdue_15d")?,
            defaulted: row[6].as_opt_decimal("defaulted")?,
            problem_assets: row[7].as_opt_decimal("problem_assets")?,
            record_count: u64::try_from(record_count).map_err(|_| SchemaError::InvalidValue {
                column: "record_count".into(),
                reason: format!("negative count {record_count}"),
            })?,
        })
    }
}

impl TableRecord for IndicatorObservation {
    fn schema() -> TableSchema {
        TableSchema::new(
            vec![
                ColumnSpec::required("indicator_code", ColumnKind::Text),
                ColumnSpec::required("date", ColumnKind::Date),
                ColumnSpec::required("value", ColumnKind::Decimal),
                ColumnSpec::optional("unit", ColumnKind::Text),
                ColumnSpec::required("periodicity", ColumnKind::Text),
            ],
            &["indicator_code", "date"],
        )
    }

    fn to_row(&self) -> Vec<Cell> {
        vec![
            Cell::text(&self.code),
            Cell::Date(self.date),
            Cell::Decimal(self.value),
            Cell::text(&self.unit),
            Cell::text(self.periodicity.as_str()),
        ]
    }

    fn from_row(row: &[Cell]) -> Result<Self, SchemaError> {
        Ok(IndicatorObservation {
            code: row[0].as_text("indicator_code")?,
            date: row[1].as_date("date")?,
            value: row[2].as_decimal("value")?,
            unit: row[3].as_opt_text("unit")?.unwrap_or_default(),
            periodicity: periodicity_cell("periodicity", &row[4])?,
        })
    }
}

impl TableRecord for IndicatorPoint {
    fn schema() -> TableSchema {
        TableSchema::new(
            vec![
                ColumnSpec::required("date", ColumnKind::Date),
                ColumnSpec::required("indicator_code", ColumnKind::Text),
                ColumnSpec::required("status", ColumnKind::Text),
                ColumnSpec::optional("value", ColumnKind::Decimal),
                ColumnSpec::optional("last_observed", ColumnKind::Decimal),
                ColumnSpec::optional("unit", ColumnKind::Text),
                ColumnSpec::required("periodicity", ColumnKind::Text),
            ],
            &["date", "indicator_code"],
        )
    }

    fn to_row(&self) -> Vec<Cell> {
        vec![
            Cell::Date(self.date),
            Cell::text(&self.code),
            Cell::text(self.observation.status()),
            Cell::opt_decimal(self.observation.value()),
            Cell::opt_decimal(self.last_observed),
            Cell::text(&self.unit),
            Cell::text(self.periodicity.as_str()),
        ]
    }

    fn from_row(row: &[Cell]) -> Result<Self, SchemaError> {
        let status = row[2].as_text("status")?;
        let value = row[3].as_opt_decimal("value")?;
        let observation = match (status.as_str(), value) {
            ("observed", Some(v)) => Observation::Observed(v),
            ("no_observation", None) => Observation::NoObservation,
            _ => {
                return Err(SchemaError::InvalidValue {
                    column: "status".into(),
                    reason: format!("status '{status}' inconsistent with value"),
                })
            }
        };
        Ok(IndicatorPoint {
            date: row[0].as_date("date")?,
            code: row[1].as_text("indicator_code")?,
            observation,
            last_observed: row[4].as_opt_decimal("last_observed")?,
            unit: row[5].as_opt_text("unit")?.unwrap_or_default(),
            periodicity: periodicity_cell("periodicity", &row[6])?,
        })
    }
}
