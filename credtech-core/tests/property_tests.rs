//! Property tests for the transformation invariants.
//!
//! Uses proptest to verify:
//! 1. Order independence: any permutation of records (and of units) yields
//!    the same Gold rows, and a later unit replaces whole groups
//! 2. Partial merges: aggregating two disjoint halves and merging equals
//!    aggregating everything at once
//! 3. Key integrity: Gold keys are non-empty and unique
//! 4. Ratio bounds: derived ratios stay within [0, 1]

use chrono::NaiveDate;
use credtech_core::data::aggregate::{aggregate_credit, aggregate_indicator, fold_credit, merge_partials};
use credtech_core::domain::{
    CreditKey, CreditRecord, Dimension, IndicatorObservation, IndicatorSpec, Periodicity,
    ReferenceMonth, UnitId,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};

fn march() -> ReferenceMonth {
    ReferenceMonth::new(2024, 3).unwrap()
}

// ── Strategies (proptest) ────────────────────────────────────────────

const MODALITIES: [&str; 3] = ["Veiculos", "Habitacional", "Capital de giro"];

fn arb_amount() -> impl Strategy<Value = Decimal> {
    (0i64..10_000_000).prop_map(|cents| Decimal::new(cents, 2))
}

fn arb_credit_record() -> impl Strategy<Value = CreditRecord> {
    (
        prop::sample::select(vec!["PF", "PJ"]),
        prop::sample::select(MODALITIES.to_vec()),
        prop::option::of(prop::sample::select(vec!["SP", "RJ", "MG"])),
        arb_amount(),
        0i64..500,
        prop::option::of(arb_amount()),
        prop::option::of(arb_amount()),
    )
        .prop_map(|(segment, modality, uf, balance, contracts, overdue, problem)| {
            let mut dimensions = BTreeMap::new();
            if let Some(uf) = uf {
                dimensions.insert(Dimension::Uf, uf.to_string());
            }
            CreditRecord {
                reference_month: march(),
                segment: segment.into(),
                modality: modality.into(),
                dimensions,
                balance,
                contracts,
                overdue_15d: overdue,
                defaulted: None,
                problem_assets: problem,
            }
        })
}

/// Records with distinct natural keys, plus a shuffled copy.
fn arb_records_and_permutation() -> impl Strategy<Value = (Vec<CreditRecord>, Vec<CreditRecord>)> {
    prop::collection::vec(arb_credit_record(), 1..30)
        .prop_map(|records| {
            let unique: BTreeMap<CreditKey, CreditRecord> =
                records.into_iter().map(|r| (r.key(), r)).collect();
            unique.into_values().collect::<Vec<_>>()
        })
        .prop_flat_map(|records| {
            let original = records.clone();
            Just(records)
                .prop_shuffle()
                .prop_map(move |shuffled| (original.clone(), shuffled))
        })
}

/// Bit index of a record's (segment, modality) group.
fn group_bit(record: &CreditRecord) -> u8 {
    let segment = u8::from(record.segment == "PJ");
    let modality = MODALITIES
        .iter()
        .position(|m| *m == record.modality)
        .unwrap_or(0) as u8;
    segment * 3 + modality
}

fn arb_observations() -> impl Strategy<Value = Vec<IndicatorObservation>> {
    prop::collection::btree_map(0u32..60, arb_amount(), 1..25).prop_map(|by_offset| {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        by_offset
            .into_iter()
            .map(|(offset, value)| IndicatorObservation {
                code: "432".into(),
                date: start + chrono::Duration::days(offset as i64),
                value,
                unit: "% a.a.".into(),
                periodicity: Periodicity::Daily,
            })
            .collect()
    })
}

// ── 1. Order independence ────────────────────────────────────────────

proptest! {
    #[test]
    fn credit_aggregation_ignores_record_order((original, shuffled) in arb_records_and_permutation()) {
        let unit = UnitId::period("scr", march());
        let a = aggregate_credit(march(), vec![(unit.clone(), original)]).unwrap();
        let b = aggregate_credit(march(), vec![(unit, shuffled)]).unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn credit_aggregation_ignores_unit_order(
        (records, _) in arb_records_and_permutation(),
        mask in any::<u8>(),
    ) {
        // units own disjoint (segment, modality) groups
        let (left, right): (Vec<_>, Vec<_>) =
            records.iter().cloned().partition(|r| mask >> group_bit(r) & 1 == 1);
        let first = UnitId::period("planilha", march());
        let second = UnitId::period("scr", march());

        let forward = aggregate_credit(
            march(),
            vec![(first.clone(), left.clone()), (second.clone(), right.clone())],
        )
        .unwrap();
        let backward = aggregate_credit(
            march(),
            vec![(second, right), (first, left)],
        )
        .unwrap();
        let whole = aggregate_credit(march(), vec![(UnitId::period("scr", march()), records.clone())])
            .unwrap();

        prop_assert_eq!(&forward, &backward);
        prop_assert_eq!(forward, whole);
    }

    #[test]
    fn later_unit_replaces_whole_groups(
        (early, _) in arb_records_and_permutation(),
        (late, _) in arb_records_and_permutation(),
    ) {
        let rows = aggregate_credit(
            march(),
            vec![
                (UnitId::period("scr", march()).with_tag("reexport"), late.clone()),
                (UnitId::period("scr", march()), early.clone()),
            ],
        )
        .unwrap();

        let replaced: Vec<u8> = late.iter().map(group_bit).collect();
        let kept = early.iter().filter(|r| !replaced.contains(&group_bit(r)));
        let expected = fold_credit(march(), kept.chain(late.iter()));
        prop_assert_eq!(rows, expected);
    }

    #[test]
    fn indicator_grid_ignores_observation_order(observations in arb_observations(), seed in any::<u64>()) {
        let spec = IndicatorSpec::new("432", "selic", "", "% a.a.", Periodicity::Daily);
        let mut rotated = observations.clone();
        let len = rotated.len();
        rotated.rotate_left((seed as usize) % len);
        rotated.reverse();

        let unit = UnitId::indicator("sgs", "432");
        let a = aggregate_indicator(&spec, vec![(unit.clone(), observations.clone())]).unwrap();
        let b = aggregate_indicator(&spec, vec![(unit, rotated)]).unwrap();
        prop_assert_eq!(&a, &b);

        // every input date is observed, grid is contiguous
        let observed = a.iter().filter(|p| p.observation.value().is_some()).count();
        prop_assert_eq!(observed, observations.len());
        prop_assert!(a.windows(2).all(|w| w[1].date - w[0].date == chrono::Duration::days(1)));
    }
}

// ── 2. Partial merges ────────────────────────────────────────────────

proptest! {
    #[test]
    fn merged_halves_equal_the_whole(
        (records, _) in arb_records_and_permutation(),
        split in 0usize..30,
    ) {
        let split = split.min(records.len());
        let (left, right) = records.split_at(split);
        let whole = fold_credit(march(), records.iter());
        let merged = merge_partials(fold_credit(march(), left.iter()), fold_credit(march(), right.iter()));
        prop_assert_eq!(whole, merged);
    }
}

// ── 3 & 4. Key integrity and ratio bounds ────────────────────────────

proptest! {
    #[test]
    fn gold_keys_unique_and_ratios_bounded((records, _) in arb_records_and_permutation()) {
        let rows = aggregate_credit(march(), vec![(UnitId::period("scr", march()), records)]).unwrap();

        let keys: BTreeSet<(String, String)> =
            rows.iter().map(|r| (r.segment.clone(), r.modality.clone())).collect();
        prop_assert_eq!(keys.len(), rows.len());
        prop_assert_eq!(rows.iter().filter(|r| r.is_total()).count(), 1);

        for row in &rows {
            prop_assert!(!row.segment.is_empty() && !row.modality.is_empty());
            for ratio in [row.default_rate(), row.problem_asset_ratio()] {
                prop_assert!(ratio >= Decimal::ZERO && ratio <= Decimal::ONE);
            }
        }
    }
}
