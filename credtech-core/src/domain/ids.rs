use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::period::ReferenceMonth;

/// Source family: decides the canonical schema and the rollup rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    /// Bank credit-portfolio extracts (SCR), one file per month.
    Credit,
    /// Economic indicator series, one file per indicator.
    Indicator,
}

impl Family {
    pub const ALL: [Family; 2] = [Family::Credit, Family::Indicator];

    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Credit => "credit",
            Family::Indicator => "indicator",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Family {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "credit" | "scr" => Ok(Family::Credit),
            "indicator" | "indicators" | "sgs" => Ok(Family::Indicator),
            other => Err(format!("unknown family '{other}' (expected credit or indicator)")),
        }
    }
}

/// The per-unit part of a raw file name: a period for credit extracts,
/// an indicator code for indicator series.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum UnitKey {
    Period(ReferenceMonth),
    Indicator(String),
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitKey::Period(month) => write!(f, "{month}"),
            UnitKey::Indicator(code) => f.write_str(code),
        }
    }
}

/// Identity of one processing unit (source × period, or source × indicator).
///
/// Ordering is (source, key, tag); "later file wins" across units of the same
/// rollup key follows this ordering. The tag is the optional free-text suffix
/// of the raw file name (`scr_202403_reexport.csv`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitId {
    pub source: String,
    pub key: UnitKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl UnitId {
    pub fn period(source: impl Into<String>, month: ReferenceMonth) -> Self {
        Self {
            source: source.into(),
            key: UnitKey::Period(month),
            tag: None,
        }
    }

    pub fn indicator(source: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            key: UnitKey::Indicator(code.into()),
            tag: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Rollup key this unit contributes to.
    pub fn rollup(&self) -> RollupKey {
        match &self.key {
            UnitKey::Period(month) => RollupKey::Month(*month),
            UnitKey::Indicator(code) => RollupKey::Indicator(code.clone()),
        }
    }

    /// File-name-safe form used for Silver artifacts: `scr-2024-03`.
    pub fn artifact_key(&self) -> String {
        match &self.tag {
            Some(tag) => format!("{}-{}-{}", self.source, self.key, tag),
            None => format!("{}-{}", self.source, self.key),
        }
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.key)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        Ok(())
    }
}

/// Grouping key used by the Aggregator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RollupKey {
    Month(ReferenceMonth),
    Indicator(String),
}

impl RollupKey {
    pub fn family(&self) -> Family {
        match self {
            RollupKey::Month(_) => Family::Credit,
            RollupKey::Indicator(_) => Family::Indicator,
        }
    }
}

impl fmt::Display for RollupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollupKey::Month(month) => write!(f, "{month}"),
            RollupKey::Indicator(code) => f.write_str(code),
        }
    }
}

/// BLAKE3 content fingerprint of a raw input, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).to_hex().to_string())
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
