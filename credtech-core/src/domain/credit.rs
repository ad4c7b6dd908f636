//! Credit-portfolio family: canonical (Silver) records and monthly aggregates (Gold).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::period::ReferenceMonth;

/// Segment and modality value used for the per-month total row.
pub const TOTAL_MARKER: &str = "*";

/// Optional categorical dimensions carried by some SCR vintages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Uf,
    Tcb,
    Sr,
    Occupation,
    CnaeSection,
    CnaeSubclass,
    Size,
    Origin,
    Indexer,
}

impl Dimension {
    pub const ALL: [Dimension; 9] = [
        Dimension::Uf,
        Dimension::Tcb,
        Dimension::Sr,
        Dimension::Occupation,
        Dimension::CnaeSection,
        Dimension::CnaeSubclass,
        Dimension::Size,
        Dimension::Origin,
        Dimension::Indexer,
    ];

    /// Canonical column name in the Silver layer.
    pub fn column(&self) -> &'static str {
        match self {
            Dimension::Uf => "uf",
            Dimension::Tcb => "tcb",
            Dimension::Sr => "sr",
            Dimension::Occupation => "occupation",
            Dimension::CnaeSection => "cnae_section",
            Dimension::CnaeSubclass => "cnae_subclass",
            Dimension::Size => "size",
            Dimension::Origin => "origin",
            Dimension::Indexer => "indexer",
        }
    }
}

/// Natural key of a Silver credit record.
pub type CreditKey = (ReferenceMonth, String, String, BTreeMap<Dimension, String>);

/// One cleaned SCR row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditRecord {
    pub reference_month: ReferenceMonth,
    /// Client segment code (`PF`, `PJ`, ...).
    pub segment: String,
    pub modality: String,
    /// Dimensions present in this record's vintage.
    pub dimensions: BTreeMap<Dimension, String>,
    /// Active portfolio (`carteira_ativa`).
    pub balance: Decimal,
    /// Number of operations; the `<= 15` sentinel is stored as 15.
    pub contracts: i64,
    pub overdue_15d: Option<Decimal>,
    pub defaulted: Option<Decimal>,
    pub problem_assets: Option<Decimal>,
}

impl CreditRecord {
    pub fn key(&self) -> CreditKey {
        (
            self.reference_month,
            self.segment.clone(),
            self.modality.clone(),
            self.dimensions.clone(),
        )
    }
}

/// Monthly aggregate for one (segment, modality) pair, or the month total.
///
/// Holds sums only; ratios are derived on demand so that partial aggregates
/// can be merged in any order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditAggregate {
    pub reference_month: ReferenceMonth,
    pub segment: String,
    pub modality: String,
    pub balance: Decimal,
    pub contracts: i64,
    pub overdue_15d: Option<Decimal>,
    pub defaulted: Option<Decimal>,
    pub problem_assets: Option<Decimal>,
    pub record_count: u64,
}

impl CreditAggregate {
    /// Empty aggregate for a group.
    pub fn empty(reference_month: ReferenceMonth, segment: &str, modality: &str) -> Self {
        Self {
            reference_month,
            segment: segment.to_string(),
            modality: modality.to_string(),
            balance: Decimal::ZERO,
            contracts: 0,
            overdue_15d: None,
            defaulted: None,
            problem_assets: None,
            record_count: 0,
        }
    }

    /// Fold one record into the sums.
    pub fn add(&mut self, record: &CreditRecord) {
        self.balance += record.balance;
        self.contracts += record.contracts;
        self.overdue_15d = add_optional(self.overdue_15d, record.overdue_15d);
        self.defaulted = add_optional(self.defaulted, record.defaulted);
        self.problem_assets = add_optional(self.problem_assets, record.problem_assets);
        self.record_count += 1;
    }

    /// Merge a partial aggregate of the same group.
    pub fn merge(&mut self, other: &CreditAggregate) {
        self.balance += other.balance;
        self.contracts += other.contracts;
        self.overdue_15d = add_optional(self.overdue_15d, other.overdue_15d);
        self.defaulted = add_optional(self.defaulted, other.defaulted);
        self.problem_assets = add_optional(self.problem_assets, other.problem_assets);
        self.record_count += other.record_count;
    }

    pub fn is_total(&self) -> bool {
        self.segment == TOTAL_MARKER && self.modality == TOTAL_MARKER
    }

    /// (overdue over 15 days + defaulted carried portfolio) / balance, in [0, 1].
    pub fn default_rate(&self) -> Decimal {
        let numerator = self.overdue_15d.unwrap_or_default() + self.defaulted.unwrap_or_default();
        ratio(numerator, self.balance)
    }

    /// problem assets / balance, in [0, 1].
    pub fn problem_asset_ratio(&self) -> Decimal {
        ratio(self.problem_assets.unwrap_or_default(), self.balance)
    }
}

fn add_optional(a: Option<Decimal>, b: Option<Decimal>) -> Option<Decimal> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x + y),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    }
}

/// Ratios are stored with 8 decimal places.
pub const RATIO_SCALE: u32 = 8;

fn ratio(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let value = numerator
        .checked_div(denominator)
        .unwrap_or(Decimal::ZERO)
        .clamp(Decimal::ZERO, Decimal::ONE);
    value.round_dp(RATIO_SCALE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record(segment: &str, balance: Decimal, contracts: i64) -> CreditRecord {
        CreditRecord {
            reference_month: ReferenceMonth::new(2024, 3).unwrap(),
            segment: segment.into(),
            modality: "Veiculos".into(),
            dimensions: BTreeMap::new(),
            balance,
            contracts,
            overdue_15d: Some(dec!(10)),
            defaulted: None,
            problem_assets: Some(dec!(5)),
        }
    }

    #[test]
    fn add_and_merge_agree() {
        let month = ReferenceMonth::new(2024, 3).unwrap();
        let mut whole = CreditAggregate::empty(month, "PF", "Veiculos");
        whole.add(&record("PF", dec!(1000), 10));
        whole.add(&record("PF", dec!(500), 5));

        let mut left = CreditAggregate::empty(month, "PF", "Veiculos");
        left.add(&record("PF", dec!(1000), 10));
        let mut right = CreditAggregate::empty(month, "PF", "Veiculos");
        right.add(&record("PF", dec!(500), 5));
        right.merge(&left);

        assert_eq!(whole, right);
        assert_eq!(whole.balance, dec!(1500));
        assert_eq!(whole.contracts, 15);
        assert_eq!(whole.overdue_15d, Some(dec!(20)));
        assert_eq!(whole.defaulted, None);
        assert_eq!(whole.record_count, 2);
    }

    #[test]
    fn ratios_are_clamped_and_zero_on_empty_balance() {
        let month = ReferenceMonth::new(2024, 3).unwrap();
        let mut agg = CreditAggregate::empty(month, "PF", "Veiculos");
        assert_eq!(agg.default_rate(), Decimal::ZERO);

        agg.balance = dec!(100);
        agg.overdue_15d = Some(dec!(80));
        agg.defaulted = Some(dec!(80));
        assert_eq!(agg.default_rate(), Decimal::ONE);

        agg.problem_assets = Some(dec!(1));
        assert_eq!(agg.problem_asset_ratio(), dec!(0.01));

        agg.balance = dec!(3);
        assert_eq!(agg.problem_asset_ratio(), dec!(0.33333333));
    }
}
