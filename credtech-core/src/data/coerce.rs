//! Cell coercion from raw strings to canonical types.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::domain::ReferenceMonth;

/// Raw values that mean "no value".
const NULL_SENTINELS: [&str; 7] = ["", "-", "na", "n/a", "nan", "null", "none"];

/// Number formatting declared by a source vintage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberLocale {
    /// `1.234,56`
    PtBr,
    /// `1,234.56`
    Dot,
}

/// A raw cell that could not be coerced to its canonical type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("record coercion error in '{column}': cannot read '{value}' as {expected}")]
pub struct CoercionError {
    pub column: String,
    pub value: String,
    pub expected: &'static str,
}

impl CoercionError {
    fn new(column: &str, value: &str, expected: &'static str) -> Self {
        Self {
            column: column.to_string(),
            value: value.to_string(),
            expected,
        }
    }
}

pub fn is_null(raw: &str) -> bool {
    let trimmed = raw.trim();
    NULL_SENTINELS
        .iter()
        .any(|s| trimmed.eq_ignore_ascii_case(s))
}

/// Trimmed text, or `None` for a null sentinel.
pub fn text(raw: &str) -> Option<String> {
    if is_null(raw) {
        None
    } else {
        Some(raw.trim().to_string())
    }
}

pub fn decimal(column: &str, raw: &str, locale: NumberLocale) -> Result<Option<Decimal>, CoercionError> {
    if is_null(raw) {
        return Ok(None);
    }
    let mut cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}')
        .collect();
    match locale {
        NumberLocale::PtBr => {
            cleaned = cleaned.replace('.', "").replace(',', ".");
        }
        NumberLocale::Dot => {
            cleaned = cleaned.replace(',', "");
        }
    }
    let parsed = if cleaned.contains(['e', 'E']) {
        Decimal::from_scientific(&cleaned)
    } else {
        Decimal::from_str(&cleaned)
    };
    parsed
        .map(Some)
        .map_err(|_| CoercionError::new(column, raw, "decimal"))
}

/// Contract counts; the SCR privacy sentinel `<= 15` reads as 15.
pub fn count(column: &str, raw: &str, locale: NumberLocale) -> Result<Option<i64>, CoercionError> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact == "<=15" {
        return Ok(Some(15));
    }
    let Some(value) = decimal(column, raw, locale)? else {
        return Ok(None);
    };
    if !value.fract().is_zero() {
        return Err(CoercionError::new(column, raw, "integer"));
    }
    i64::try_from(value)
        .map(Some)
        .map_err(|_| CoercionError::new(column, raw, "integer"))
}

/// Day-first date parsing over the layouts seen in raw extracts.
pub fn date(column: &str, raw: &str) -> Result<Option<NaiveDate>, CoercionError> {
    if is_null(raw) {
        return Ok(None);
    }
    let trimmed = raw.trim();
    let date_part = trimmed.split([' ', 'T']).next().unwrap_or(trimmed);
    for format in ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%Y%m%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(date_part, format) {
            return Ok(Some(date));
        }
    }
    Err(CoercionError::new(column, raw, "date"))
}

pub fn month(column: &str, raw: &str) -> Result<Option<ReferenceMonth>, CoercionError> {
    if is_null(raw) {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|_| CoercionError::new(column, raw, "reference month"))
}
