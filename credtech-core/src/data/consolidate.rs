//! Merge per-indicator Gold series into one (date, indicator) table.
//!
//! Outer join over dates: every indicator contributes a row for every date
//! present in any series, either its own point or a `NoObservation` marker
//! with its forward-carried last value.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::schema::{Cell, ColumnKind, ColumnSpec, Table, TableSchema};
use crate::domain::{IndicatorPoint, IndicatorSpec, Observation};

/// Optional inclusive date range applied to the consolidated table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidationWindow {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl ConsolidationWindow {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date <= e)
    }
}

/// Outer-join the given series, sorted by (date, indicator code).
pub fn consolidate(series: &[Vec<IndicatorPoint>], window: ConsolidationWindow) -> Vec<IndicatorPoint> {
    let dates: BTreeSet<NaiveDate> = series
        .iter()
        .flatten()
        .map(|p| p.date)
        .filter(|d| window.contains(*d))
        .collect();

    let mut by_code: BTreeMap<&str, BTreeMap<NaiveDate, &IndicatorPoint>> = BTreeMap::new();
    for point in series.iter().flatten() {
        by_code
            .entry(point.code.as_str())
            .or_default()
            .insert(point.date, point);
    }

    let mut out = Vec::with_capacity(dates.len() * by_code.len());
    for date in &dates {
        for points in by_code.values() {
            if let Some(point) = points.get(date) {
                out.push((*point).clone());
                continue;
            }
            // Carry from the closest earlier point of this series, if any.
            let Some((_, template)) = points.iter().next() else {
                continue;
            };
            let last_observed = points
                .range(..*date)
                .next_back()
                .and_then(|(_, p)| p.last_observed);
            out.push(IndicatorPoint {
                code: template.code.clone(),
                date: *date,
                observation: Observation::NoObservation,
                last_observed,
                unit: template.unit.clone(),
                periodicity: template.periodicity,
            });
        }
    }
    out
}

/// Pivot consolidated points into one row per date and one column per
/// indicator (by catalog name), holding the forward-carried value.
pub fn wide_view(points: &[IndicatorPoint], catalog: &[IndicatorSpec]) -> Table {
    let codes: BTreeSet<&str> = points.iter().map(|p| p.code.as_str()).collect();
    let name_of = |code: &str| -> String {
        catalog
            .iter()
            .find(|s| s.code == code)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| format!("sgs_{code}"))
    };

    let mut columns = vec![ColumnSpec::required("date", ColumnKind::Date)];
    columns.extend(
        codes
            .iter()
            .map(|code| ColumnSpec::optional(&name_of(*code), ColumnKind::Decimal)),
    );
    let mut table = Table::new(TableSchema::new(columns, &["date"]));

    let mut rows: BTreeMap<NaiveDate, BTreeMap<&str, Option<Decimal>>> = BTreeMap::new();
    for point in points {
        rows.entry(point.date)
            .or_default()
            .insert(point.code.as_str(), point.last_observed);
    }
    for (date, values) in rows {
        let mut row = vec![Cell::Date(date)];
        row.extend(
            codes
                .iter()
                .map(|code| Cell::opt_decimal(values.get(code).copied().flatten())),
        );
        table.rows.push(row);
    }
    table
}
