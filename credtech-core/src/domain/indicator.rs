//! Indicator family: canonical observations (Silver) and gridded points (Gold).

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Declared sampling frequency of an indicator series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Periodicity {
    /// Every calendar day.
    Daily,
    /// Monday to Friday.
    BusinessDaily,
    /// One observation per calendar month.
    Monthly,
}

impl Periodicity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Periodicity::Daily => "daily",
            Periodicity::BusinessDaily => "business_daily",
            Periodicity::Monthly => "monthly",
        }
    }

    /// Expected observation slots between `first` and `last` (inclusive).
    ///
    /// Monthly slots are the first day of each month; an observation anywhere
    /// in the month fills the slot.
    pub fn grid(&self, first: NaiveDate, last: NaiveDate) -> Vec<NaiveDate> {
        let mut slots = Vec::new();
        if last < first {
            return slots;
        }
        match self {
            Periodicity::Daily | Periodicity::BusinessDaily => {
                let mut day = first;
                while day <= last {
                    if *self == Periodicity::Daily || !is_weekend(day) {
                        slots.push(day);
                    }
                    day += Duration::days(1);
                }
            }
            Periodicity::Monthly => {
                let mut month = month_start(first);
                let end = month_start(last);
                while month <= end {
                    slots.push(month);
                    month = next_month_start(month);
                }
            }
        }
        slots
    }

    /// Slot an observation date belongs to; `None` when the date falls
    /// outside the grid (a weekend for business-daily series).
    pub fn slot_of(&self, date: NaiveDate) -> Option<NaiveDate> {
        match self {
            Periodicity::Daily => Some(date),
            Periodicity::BusinessDaily if is_weekend(date) => None,
            Periodicity::BusinessDaily => Some(date),
            Periodicity::Monthly => Some(month_start(date)),
        }
    }
}

impl fmt::Display for Periodicity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Periodicity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" | "diaria" | "d" => Ok(Periodicity::Daily),
            "business_daily" | "business-daily" | "bd" => Ok(Periodicity::BusinessDaily),
            "monthly" | "mensal" | "m" => Ok(Periodicity::Monthly),
            other => Err(format!("unknown periodicity '{other}'")),
        }
    }
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn next_month_start(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date)
}

/// Catalog entry for one indicator series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorSpec {
    /// Series code, e.g. the SGS number `432`.
    pub code: String,
    /// Short column name used by the wide consolidated view.
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub unit: String,
    pub periodicity: Periodicity,
}

impl IndicatorSpec {
    pub fn new(code: &str, name: &str, label: &str, unit: &str, periodicity: Periodicity) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            label: label.to_string(),
            unit: unit.to_string(),
            periodicity,
        }
    }

    /// BACEN SGS series tracked by default.
    pub fn default_catalog() -> Vec<IndicatorSpec> {
        vec![
            IndicatorSpec::new("432", "selic", "Taxa Selic meta", "% a.a.", Periodicity::Daily),
            IndicatorSpec::new("13522", "ipca", "IPCA acumulado 12 meses", "%", Periodicity::Monthly),
            IndicatorSpec::new("24369", "desemprego", "Taxa de desocupacao", "%", Periodicity::Monthly),
            IndicatorSpec::new(
                "21082",
                "inadimplencia_pf",
                "Inadimplencia da carteira de credito PF",
                "%",
                Periodicity::Monthly,
            ),
            IndicatorSpec::new(
                "19882",
                "endividamento",
                "Endividamento das familias",
                "%",
                Periodicity::Monthly,
            ),
        ]
    }
}

/// One cleaned indicator observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorObservation {
    pub code: String,
    pub date: NaiveDate,
    pub value: Decimal,
    pub unit: String,
    pub periodicity: Periodicity,
}

impl IndicatorObservation {
    pub fn key(&self) -> (String, NaiveDate) {
        (self.code.clone(), self.date)
    }
}

/// Value slot on the Gold grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Observation {
    Observed(Decimal),
    /// The source has no value for this date; never interpolated.
    NoObservation,
}

impl Observation {
    pub fn value(&self) -> Option<Decimal> {
        match self {
            Observation::Observed(v) => Some(*v),
            Observation::NoObservation => None,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Observation::Observed(_) => "observed",
            Observation::NoObservation => "no_observation",
        }
    }
}

/// Gold row for one indicator at one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorPoint {
    pub code: String,
    pub date: NaiveDate,
    pub observation: Observation,
    /// Most recent observed value at or before `date` (forward carry).
    pub last_observed: Option<Decimal>,
    pub unit: String,
    pub periodicity: Periodicity,
}
