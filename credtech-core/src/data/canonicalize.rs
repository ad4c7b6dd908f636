//! Bronze→Silver: map, coerce and deduplicate one raw unit.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::coerce::{self, CoercionError, NumberLocale};
use super::mapping::{CanonicalField, MappingTable, ResolvedMapping, UnknownSourceSchema};
use super::reader::{RawRecord, RawSource};
use crate::domain::{
    CreditRecord, Family, IndicatorObservation, IndicatorSpec, Periodicity, ReferenceMonth,
    TOTAL_MARKER,
};

/// Rejection samples kept per unit for the run summary.
const MAX_REJECTION_SAMPLES: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum CanonicalizeError {
    #[error(transparent)]
    UnknownSourceSchema(#[from] UnknownSourceSchema),
}

/// Why a single raw row was dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RowRejection {
    #[error(transparent)]
    Coercion(#[from] CoercionError),

    #[error("required field '{0}' is empty")]
    MissingValue(&'static str),

    #[error("row belongs to {found}, unit covers {expected}")]
    ForeignPeriod {
        expected: ReferenceMonth,
        found: ReferenceMonth,
    },

    #[error("'{field}' value '*' is reserved for the month total")]
    ReservedValue { field: &'static str },

    #[error("{date} is off the {periodicity} grid")]
    OffGrid {
        date: NaiveDate,
        periodicity: Periodicity,
    },

    #[error("malformed row: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionSample {
    pub line: u64,
    pub reason: String,
}

/// Row accounting for one canonicalized unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalReport {
    pub vintage: String,
    pub rows_read: u64,
    pub rejected: u64,
    /// Of `rejected`, rows the reader could not shape at all.
    pub malformed: u64,
    /// Rows replaced by a later row with the same natural key.
    pub superseded: u64,
    pub samples: Vec<RejectionSample>,
}

impl CanonicalReport {
    fn reject(&mut self, line: u64, rejection: &RowRejection) {
        self.rejected += 1;
        if matches!(rejection, RowRejection::Malformed(_)) {
            self.malformed += 1;
        }
        if self.samples.len() < MAX_REJECTION_SAMPLES {
            self.samples.push(RejectionSample {
                line,
                reason: rejection.to_string(),
            });
        }
    }
}

/// Cleaned records of one unit, sorted by natural key.
#[derive(Debug, Clone)]
pub struct CanonicalBatch<R> {
    pub records: Vec<R>,
    pub report: CanonicalReport,
}

/// Canonicalize a credit extract for the unit's reference month.
pub fn canonicalize_credit(
    source: RawSource,
    period: ReferenceMonth,
    mappings: &MappingTable,
) -> Result<CanonicalBatch<CreditRecord>, CanonicalizeError> {
    let mapping = mappings.resolve(Family::Credit, source.headers())?;
    Ok(run(
        source,
        &mapping,
        |row| credit_row(&mapping, row, period),
        CreditRecord::key,
    ))
}

/// Canonicalize an indicator series described by `spec`.
pub fn canonicalize_indicator(
    source: RawSource,
    spec: &IndicatorSpec,
    mappings: &MappingTable,
) -> Result<CanonicalBatch<IndicatorObservation>, CanonicalizeError> {
    let mapping = mappings.resolve(Family::Indicator, source.headers())?;
    Ok(run(
        source,
        &mapping,
        |row| indicator_row(&mapping, row, spec),
        IndicatorObservation::key,
    ))
}

/// Drive rows through `build`, dedupe by `key` (later row wins) and sort.
fn run<R, K, B, F>(source: RawSource, mapping: &ResolvedMapping, build: B, key: F) -> CanonicalBatch<R>
where
    K: Ord,
    B: Fn(&RawRecord) -> Result<R, RowRejection>,
    F: Fn(&R) -> K,
{
    let mut report = CanonicalReport {
        vintage: mapping.vintage.to_string(),
        ..CanonicalReport::default()
    };
    let mut by_key: BTreeMap<K, R> = BTreeMap::new();

    for item in source {
        report.rows_read += 1;
        let row = match item {
            Ok(row) => row,
            Err(malformed) => {
                report.reject(malformed.line, &RowRejection::Malformed(malformed.reason));
                continue;
            }
        };
        match build(&row) {
            Ok(record) => {
                if by_key.insert(key(&record), record).is_some() {
                    report.superseded += 1;
                }
            }
            Err(rejection) => {
                tracing::trace!(line = row.line, %rejection, "row rejected");
                report.reject(row.line, &rejection);
            }
        }
    }

    CanonicalBatch {
        records: by_key.into_values().collect(),
        report,
    }
}

fn field<'a>(mapping: &ResolvedMapping, row: &'a RawRecord, field: CanonicalField) -> &'a str {
    mapping
        .index(field)
        .and_then(|i| row.cell(i))
        .unwrap_or("")
}

/// Cell text and the number format to read it with. Typed workbook numbers
/// are dot-decimal whatever the vintage declares.
fn number<'a>(
    mapping: &ResolvedMapping,
    row: &'a RawRecord,
    field: CanonicalField,
) -> (&'a str, NumberLocale) {
    match mapping.index(field) {
        Some(i) if row.is_number(i) => (row.cell(i).unwrap_or(""), NumberLocale::Dot),
        Some(i) => (row.cell(i).unwrap_or(""), mapping.locale),
        None => ("", mapping.locale),
    }
}

fn decimal(
    mapping: &ResolvedMapping,
    row: &RawRecord,
    field: CanonicalField,
    column: &str,
) -> Result<Option<Decimal>, CoercionError> {
    let (raw, locale) = number(mapping, row, field);
    coerce::decimal(column, raw, locale)
}

fn count(
    mapping: &ResolvedMapping,
    row: &RawRecord,
    field: CanonicalField,
    column: &str,
) -> Result<Option<i64>, CoercionError> {
    let (raw, locale) = number(mapping, row, field);
    coerce::count(column, raw, locale)
}

fn required<T>(value: Option<T>, name: &'static str) -> Result<T, RowRejection> {
    value.ok_or(RowRejection::MissingValue(name))
}

fn credit_row(
    mapping: &ResolvedMapping,
    row: &RawRecord,
    period: ReferenceMonth,
) -> Result<CreditRecord, RowRejection> {
    let month = required(
        coerce::month("data_base", field(mapping, row, CanonicalField::ReferenceMonth))?,
        "reference_month",
    )?;
    if month != period {
        return Err(RowRejection::ForeignPeriod {
            expected: period,
            found: month,
        });
    }

    let mut dimensions = BTreeMap::new();
    for (dim, index) in mapping.dimensions() {
        if let Some(value) = row.cell(index).and_then(coerce::text) {
            dimensions.insert(dim, value);
        }
    }

    Ok(CreditRecord {
        reference_month: month,
        segment: group_value(mapping, row, CanonicalField::Segment, "segment")?,
        modality: group_value(mapping, row, CanonicalField::Modality, "modality")?,
        dimensions,
        balance: required(
            decimal(mapping, row, CanonicalField::Balance, "carteira_ativa")?,
            "balance",
        )?,
        contracts: required(
            count(mapping, row, CanonicalField::Contracts, "numero_de_operacoes")?,
            "contracts",
        )?,
        overdue_15d: decimal(
            mapping,
            row,
            CanonicalField::Overdue15d,
            "vencido_acima_de_15_dias",
        )?,
        defaulted: decimal(
            mapping,
            row,
            CanonicalField::Defaulted,
            "carteira_inadimplida_arrastada",
        )?,
        problem_assets: decimal(mapping, row, CanonicalField::ProblemAssets, "ativo_problematico")?,
    })
}

/// Segment or modality text; the total marker is never a real group.
fn group_value(
    mapping: &ResolvedMapping,
    row: &RawRecord,
    canonical: CanonicalField,
    name: &'static str,
) -> Result<String, RowRejection> {
    let value = required(coerce::text(field(mapping, row, canonical)), name)?;
    if value == TOTAL_MARKER {
        return Err(RowRejection::ReservedValue { field: name });
    }
    Ok(value)
}

fn indicator_row(
    mapping: &ResolvedMapping,
    row: &RawRecord,
    spec: &IndicatorSpec,
) -> Result<IndicatorObservation, RowRejection> {
    let date = required(
        coerce::date("date", field(mapping, row, CanonicalField::Date))?,
        "date",
    )?;
    if spec.periodicity.slot_of(date).is_none() {
        return Err(RowRejection::OffGrid {
            date,
            periodicity: spec.periodicity,
        });
    }
    let value = required(decimal(mapping, row, CanonicalField::Value, "value")?, "value")?;
    Ok(IndicatorObservation {
        code: spec.code.clone(),
        date,
        value,
        unit: spec.unit.clone(),
        periodicity: spec.periodicity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::reader::SourceReader;
    use rust_decimal_macros::dec;
    use std::path::Path;

    fn source(bytes: &[u8]) -> RawSource {
        SourceReader::from_bytes(Path::new("scr_202403.csv"), bytes).unwrap()
    }

    fn march() -> ReferenceMonth {
        ReferenceMonth::new(2024, 3).unwrap()
    }

    #[test]
    fn credit_rows_are_coerced_and_sorted() {
        let raw = "data_base;cliente;modalidade;numero_de_operacoes;carteira_ativa\n\
                   2024-03-31;PJ;Capital de giro;<= 15;2.500,00\n\
                   2024-03-31;PF;Veiculos;10;1.000,50\n";
        let batch = canonicalize_credit(source(raw.as_bytes()), march(), &MappingTable::builtin())
            .unwrap();
        assert_eq!(batch.report.vintage, "scr-2012");
        assert_eq!(batch.report.rows_read, 2);
        assert_eq!(batch.report.rejected, 0);
        assert_eq!(batch.records[0].segment, "PF");
        assert_eq!(batch.records[0].balance, dec!(1000.50));
        assert_eq!(batch.records[1].contracts, 15);
    }

    #[test]
    fn bad_rows_are_counted_not_fatal() {
        let raw = "data_base;cliente;modalidade;numero_de_operacoes;carteira_ativa\n\
                   2024-03-31;PF;Veiculos;10;abc\n\
                   2024-03-31;;Veiculos;10;5\n\
                   2024-02-29;PF;Veiculos;10;5\n\
                   2024-03-31;PF;Veiculos;1;2;3\n\
                   2024-03-31;PF;Veiculos;10;7\n";
        let batch = canonicalize_credit(source(raw.as_bytes()), march(), &MappingTable::builtin())
            .unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.report.rows_read, 5);
        assert_eq!(batch.report.rejected, 4);
        assert_eq!(batch.report.malformed, 1);
        assert_eq!(batch.report.samples[0].line, 2);
    }

    #[test]
    fn later_row_wins_on_duplicate_key() {
        let raw = "data_base;cliente;modalidade;numero_de_operacoes;carteira_ativa\n\
                   2024-03-31;PF;Veiculos;10;100\n\
                   2024-03-31;PF;Veiculos;12;120\n";
        let batch = canonicalize_credit(source(raw.as_bytes()), march(), &MappingTable::builtin())
            .unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].balance, dec!(120));
        assert_eq!(batch.report.superseded, 1);
    }

    #[test]
    fn total_marker_is_not_a_segment_or_modality() {
        let raw = "data_base;cliente;modalidade;numero_de_operacoes;carteira_ativa\n\
                   2024-03-31;*;Veiculos;10;100\n\
                   2024-03-31;PF;*;10;100\n\
                   2024-03-31;PF;Veiculos;10;100\n";
        let batch = canonicalize_credit(source(raw.as_bytes()), march(), &MappingTable::builtin())
            .unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.report.rejected, 2);
        assert!(batch.report.samples[0].reason.contains("reserved"));
        assert!(batch.report.samples.iter().all(|s| s.line != 4));
    }

    #[test]
    fn unknown_schema_fails_the_unit() {
        let raw = "foo;bar\n1;2\n";
        let err = canonicalize_credit(source(raw.as_bytes()), march(), &MappingTable::builtin())
            .unwrap_err();
        assert!(matches!(err, CanonicalizeError::UnknownSourceSchema(_)));
    }

    #[test]
    fn indicator_series_use_catalog_metadata() {
        let spec = IndicatorSpec::new("432", "selic", "Selic", "% a.a.", Periodicity::Daily);
        let raw = "data;valor\n15/03/2024;10,75\n14/03/2024;10,75\n14/03/2024;10,50\n";
        let batch = canonicalize_indicator(source(raw.as_bytes()), &spec, &MappingTable::builtin())
            .unwrap();
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.records[0].date.to_string(), "2024-03-14");
        assert_eq!(batch.records[0].value, dec!(10.50));
        assert_eq!(batch.records[0].unit, "% a.a.");
        assert_eq!(batch.report.superseded, 1);
    }

    #[test]
    fn weekend_rows_of_a_business_daily_series_are_rejected() {
        let spec = IndicatorSpec::new("1", "dolar", "", "R$", Periodicity::BusinessDaily);
        // 2024-03-16 is a Saturday
        let raw = "data;valor\n15/03/2024;4,97\n16/03/2024;4,98\n18/03/2024;4,99\n";
        let batch = canonicalize_indicator(source(raw.as_bytes()), &spec, &MappingTable::builtin())
            .unwrap();
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.report.rejected, 1);
        assert_eq!(batch.report.samples[0].line, 3);
        assert!(batch.report.samples[0].reason.contains("off the business_daily grid"));
    }
}
