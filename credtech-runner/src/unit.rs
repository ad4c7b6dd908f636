//! Unit lifecycle and unit-scoped errors.
//!
//! `Pending → Extracted → Canonicalized → Aggregated → Loaded`, or
//! `Failed { stage, reason }` from any of them.

use serde::{Deserialize, Serialize};
use std::fmt;

use credtech_core::data::{AggregateError, CanonicalizeError, LayerError, ReadError, SchemaError};
use credtech_core::domain::Family;

use crate::loader::LoadError;

/// Pipeline step a unit can fail in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    Canonicalize,
    Aggregate,
    Load,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Canonicalize => "canonicalize",
            Stage::Aggregate => "aggregate",
            Stage::Load => "load",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    Extracted,
    Canonicalized,
    Aggregated,
    Loaded,
    Failed { stage: Stage, reason: String },
}

impl UnitState {
    fn rank(&self) -> u8 {
        match self {
            UnitState::Pending | UnitState::Failed { .. } => 0,
            UnitState::Extracted => 1,
            UnitState::Canonicalized => 2,
            UnitState::Aggregated => 3,
            UnitState::Loaded => 4,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, UnitState::Failed { .. })
    }

    /// True when the unit has progressed at least as far as `other`.
    /// A failed unit has reached nothing.
    pub fn reached(&self, other: &UnitState) -> bool {
        !self.is_failed() && self.rank() >= other.rank()
    }

    /// Where the unit resumes from. Aggregate and load failures leave valid
    /// upstream artifacts behind; extract and canonicalize failures do not.
    pub fn resume_point(&self) -> Option<UnitState> {
        match self {
            UnitState::Failed {
                stage: Stage::Aggregate,
                ..
            } => Some(UnitState::Canonicalized),
            UnitState::Failed {
                stage: Stage::Load, ..
            } => Some(UnitState::Aggregated),
            UnitState::Failed { .. } => None,
            other => Some(other.clone()),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            UnitState::Pending => "pending",
            UnitState::Extracted => "extracted",
            UnitState::Canonicalized => "canonicalized",
            UnitState::Aggregated => "aggregated",
            UnitState::Loaded => "loaded",
            UnitState::Failed { .. } => "failed",
        }
    }

    pub fn failed(stage: Stage, error: &UnitError) -> Self {
        UnitState::Failed {
            stage,
            reason: error.to_string(),
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitState::Failed { stage, reason } => write!(f, "failed at {stage}: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Anything that stops one unit. Never aborts the run.
#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    #[error(transparent)]
    Read(#[from] ReadError),

    #[error(transparent)]
    Canonicalize(#[from] CanonicalizeError),

    #[error("indicator code '{0}' is not in the catalog")]
    UnknownIndicator(String),

    #[error("unit {unit} does not carry a {family} key")]
    KeyMismatch { unit: String, family: Family },

    #[error(transparent)]
    Layer(#[from] LayerError),

    #[error("silver artifact does not match its schema: {0}")]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("rollup blocked by failed unit {0}")]
    BlockedBy(String),
}
