//! Silver→Gold: roll canonical records up by month (credit) or by indicator.
//!
//! When several units feed the same rollup key, their records are merged
//! first. For credit the unit whose id sorts last replaces every record an
//! earlier unit had for the same (segment, modality), whatever dimensions
//! either vintage carries. For indicators the later unit wins per grid slot.
//! Everything after that merge is a commutative fold, so the output does not
//! depend on the order units or records arrive in.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::domain::{
    CreditAggregate, CreditRecord, IndicatorObservation, IndicatorPoint, IndicatorSpec,
    Observation, Periodicity, ReferenceMonth, UnitId, TOTAL_MARKER,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AggregateError {
    #[error("aggregation key missing: record from {unit} has an empty {field}")]
    AggregationKeyMissing { unit: String, field: &'static str },

    #[error("record from {unit} belongs to {found}, rollup is {expected}")]
    ForeignRecord {
        unit: String,
        expected: String,
        found: String,
    },

    #[error("observation from {unit} on {date} is off the {periodicity} grid")]
    OffGrid {
        unit: String,
        date: NaiveDate,
        periodicity: Periodicity,
    },
}

/// Aggregate all units of one credit month into per-(segment, modality)
/// rows plus the month total, sorted by key.
pub fn aggregate_credit(
    month: ReferenceMonth,
    mut units: Vec<(UnitId, Vec<CreditRecord>)>,
) -> Result<Vec<CreditAggregate>, AggregateError> {
    units.sort_by(|a, b| a.0.cmp(&b.0));

    let mut merged: BTreeMap<(String, String), Vec<CreditRecord>> = BTreeMap::new();
    for (unit, records) in units {
        let mut groups: BTreeMap<(String, String), Vec<CreditRecord>> = BTreeMap::new();
        for record in records {
            if record.reference_month != month {
                return Err(AggregateError::ForeignRecord {
                    unit: unit.to_string(),
                    expected: month.to_string(),
                    found: record.reference_month.to_string(),
                });
            }
            if record.segment.trim().is_empty() {
                return Err(AggregateError::AggregationKeyMissing {
                    unit: unit.to_string(),
                    field: "segment",
                });
            }
            if record.modality.trim().is_empty() {
                return Err(AggregateError::AggregationKeyMissing {
                    unit: unit.to_string(),
                    field: "modality",
                });
            }
            groups
                .entry((record.segment.clone(), record.modality.clone()))
                .or_default()
                .push(record);
        }
        // a later vintage may drop or add dimensions, so it replaces the
        // whole group rather than matching record keys
        merged.extend(groups);
    }

    Ok(fold_credit(month, merged.values().flatten()))
}

/// Group records by (segment, modality) and append the total row.
pub fn fold_credit<'a>(
    month: ReferenceMonth,
    records: impl IntoIterator<Item = &'a CreditRecord>,
) -> Vec<CreditAggregate> {
    let mut groups: BTreeMap<(String, String), CreditAggregate> = BTreeMap::new();
    let mut total = CreditAggregate::empty(month, TOTAL_MARKER, TOTAL_MARKER);

    for record in records {
        groups
            .entry((record.segment.clone(), record.modality.clone()))
            .or_insert_with(|| CreditAggregate::empty(month, &record.segment, &record.modality))
            .add(record);
        total.add(record);
    }

    if groups.is_empty() {
        return Vec::new();
    }
    let mut out: Vec<CreditAggregate> = groups.into_values().collect();
    out.push(total);
    sort_aggregates(&mut out);
    out
}

/// Merge partial aggregates of the same month. Rows sharing
/// (month, segment, modality) are summed.
pub fn merge_partials(
    left: Vec<CreditAggregate>,
    right: Vec<CreditAggregate>,
) -> Vec<CreditAggregate> {
    let mut by_key: BTreeMap<(ReferenceMonth, String, String), CreditAggregate> = BTreeMap::new();
    for agg in left.into_iter().chain(right) {
        let key = (agg.reference_month, agg.segment.clone(), agg.modality.clone());
        match by_key.get_mut(&key) {
            Some(existing) => existing.merge(&agg),
            None => {
                by_key.insert(key, agg);
            }
        }
    }
    by_key.into_values().collect()
}

fn sort_aggregates(rows: &mut [CreditAggregate]) {
    rows.sort_by(|a, b| {
        (a.reference_month, &a.segment, &a.modality).cmp(&(b.reference_month, &b.segment, &b.modality))
    });
}

/// Place one indicator's observations on its periodicity grid.
///
/// Grid slots without an observation become [`Observation::NoObservation`];
/// `last_observed` carries the most recent observed value forward.
pub fn aggregate_indicator(
    spec: &IndicatorSpec,
    mut units: Vec<(UnitId, Vec<IndicatorObservation>)>,
) -> Result<Vec<IndicatorPoint>, AggregateError> {
    units.sort_by(|a, b| a.0.cmp(&b.0));

    // Later unit wins per slot; within a unit, records are date-sorted so the
    // last observation of a monthly slot wins.
    let mut slots: BTreeMap<NaiveDate, Decimal> = BTreeMap::new();
    for (unit, observations) in units {
        for obs in observations {
            if obs.code != spec.code {
                return Err(AggregateError::ForeignRecord {
                    unit: unit.to_string(),
                    expected: spec.code.clone(),
                    found: obs.code,
                });
            }
            let Some(slot) = spec.periodicity.slot_of(obs.date) else {
                return Err(AggregateError::OffGrid {
                    unit: unit.to_string(),
                    date: obs.date,
                    periodicity: spec.periodicity,
                });
            };
            slots.insert(slot, obs.value);
        }
    }

    let (Some(first), Some(last)) = (
        slots.keys().next().copied(),
        slots.keys().next_back().copied(),
    ) else {
        return Ok(Vec::new());
    };

    let mut carried: Option<Decimal> = None;
    let points = spec
        .periodicity
        .grid(first, last)
        .into_iter()
        .map(|date| {
            let observation = match slots.get(&date) {
                Some(value) => {
                    carried = Some(*value);
                    Observation::Observed(*value)
                }
                None => Observation::NoObservation,
            };
            IndicatorPoint {
                code: spec.code.clone(),
                date,
                observation,
                last_observed: carried,
                unit: spec.unit.clone(),
                periodicity: spec.periodicity,
            }
        })
        .collect();
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Dimension;
    use rust_decimal_macros::dec;

    fn march() -> ReferenceMonth {
        ReferenceMonth::new(2024, 3).unwrap()
    }

    fn record(segment: &str, modality: &str, balance: Decimal, contracts: i64) -> CreditRecord {
        CreditRecord {
            reference_month: march(),
            segment: segment.into(),
            modality: modality.into(),
            dimensions: Default::default(),
            balance,
            contracts,
            overdue_15d: None,
            defaulted: None,
            problem_assets: None,
        }
    }

    #[test]
    fn two_segments_produce_rows_and_total() {
        let unit = UnitId::period("scr", march());
        let rows = aggregate_credit(
            march(),
            vec![(
                unit,
                vec![record("A", "X", dec!(1000), 10), record("B", "X", dec!(500), 5)],
            )],
        )
        .unwrap();
        assert_eq!(rows.len(), 3);
        let total = rows.iter().find(|r| r.is_total()).unwrap();
        assert_eq!(total.balance, dec!(1500));
        assert_eq!(total.contracts, 15);
        assert_eq!(total.record_count, 2);
        assert_eq!(rows[0].segment, TOTAL_MARKER);
    }

    #[test]
    fn later_unit_wins_on_key_collision() {
        let early = UnitId::period("scr", march());
        let late = UnitId::period("scr", march()).with_tag("reexport");
        let rows = aggregate_credit(
            march(),
            vec![
                (late, vec![record("A", "X", dec!(900), 9)]),
                (early, vec![record("A", "X", dec!(1000), 10)]),
            ],
        )
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].balance, dec!(900));
    }

    #[test]
    fn later_vintage_replaces_groups_with_other_dimensions() {
        let mut by_state = record("A", "X", dec!(1000), 10);
        by_state.dimensions.insert(Dimension::Uf, "SP".into());
        let early = UnitId::period("scr", march());
        let late = UnitId::period("scr", march()).with_tag("reexport");
        let rows = aggregate_credit(
            march(),
            vec![
                (early, vec![by_state, record("B", "X", dec!(500), 5)]),
                (late, vec![record("A", "X", dec!(1100), 11)]),
            ],
        )
        .unwrap();
        assert_eq!(rows.len(), 3);
        let a = rows.iter().find(|r| r.segment == "A").unwrap();
        assert_eq!(a.balance, dec!(1100));
        assert_eq!(a.contracts, 11);
        assert_eq!(a.record_count, 1);
        let total = rows.iter().find(|r| r.is_total()).unwrap();
        assert_eq!(total.balance, dec!(1600));
    }

    #[test]
    fn empty_segment_fails_the_rollup() {
        let unit = UnitId::period("scr", march());
        let err = aggregate_credit(march(), vec![(unit, vec![record("", "X", dec!(1), 1)])])
            .unwrap_err();
        assert!(matches!(
            err,
            AggregateError::AggregationKeyMissing { field: "segment", .. }
        ));
    }

    #[test]
    fn partial_aggregates_merge_to_the_whole() {
        let a = record("A", "X", dec!(1000), 10);
        let b = record("A", "X", dec!(1), 1);
        let c = record("B", "Y", dec!(500), 5);
        let whole = fold_credit(march(), [&a, &b, &c]);
        let merged = merge_partials(fold_credit(march(), [&a]), fold_credit(march(), [&b, &c]));
        assert_eq!(whole, merged);
    }

    fn obs(date: &str, value: Decimal) -> IndicatorObservation {
        IndicatorObservation {
            code: "432".into(),
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            value,
            unit: "% a.a.".into(),
            periodicity: Periodicity::Daily,
        }
    }

    #[test]
    fn missing_grid_dates_are_marked_and_carried() {
        let spec = IndicatorSpec::new("432", "selic", "", "% a.a.", Periodicity::Daily);
        let unit = UnitId::indicator("sgs", "432");
        let points = aggregate_indicator(
            &spec,
            vec![(
                unit,
                vec![obs("2024-03-14", dec!(10.75)), obs("2024-03-16", dec!(10.50))],
            )],
        )
        .unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[1].observation, Observation::NoObservation);
        assert_eq!(points[1].last_observed, Some(dec!(10.75)));
        assert_eq!(points[2].observation, Observation::Observed(dec!(10.50)));
    }

    #[test]
    fn weekend_business_daily_observation_fails_the_rollup() {
        let spec = IndicatorSpec::new("432", "selic", "", "% a.a.", Periodicity::BusinessDaily);
        let unit = UnitId::indicator("sgs", "432");
        let mut saturday = obs("2024-03-16", dec!(10.50));
        saturday.periodicity = Periodicity::BusinessDaily;
        let observations = vec![obs("2024-03-15", dec!(10.75)), saturday];
        let err = aggregate_indicator(&spec, vec![(unit, observations)]).unwrap_err();
        assert!(matches!(err, AggregateError::OffGrid { .. }));
    }

    #[test]
    fn foreign_indicator_code_is_rejected() {
        let spec = IndicatorSpec::new("13522", "ipca", "", "%", Periodicity::Monthly);
        let unit = UnitId::indicator("sgs", "13522");
        let err = aggregate_indicator(&spec, vec![(unit, vec![obs("2024-03-01", dec!(1))])])
            .unwrap_err();
        assert!(matches!(err, AggregateError::ForeignRecord { .. }));
    }
}
