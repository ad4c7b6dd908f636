//! Per-invocation outcome report.

use std::collections::BTreeMap;

use credtech_core::data::WriteOutcome;
use credtech_core::domain::UnitId;

use crate::loader::LoadCounts;
use crate::unit::UnitState;

/// What one stage (or a chained run) did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Latest state of every unit the invocation touched.
    pub units: BTreeMap<UnitId, UnitState>,
    /// Unit steps skipped because their raw content was unchanged.
    pub unchanged: usize,
    /// Rows dropped during canonicalization, summed over units.
    pub rejected_rows: u64,
    pub loads: LoadCounts,
    pub artifacts_written: usize,
    pub artifacts_unchanged: usize,
    pub consolidation_error: Option<String>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.units.len()
    }

    pub fn failed(&self) -> impl Iterator<Item = (&UnitId, &UnitState)> {
        self.units.iter().filter(|(_, state)| state.is_failed())
    }

    pub fn succeeded(&self) -> usize {
        self.total() - self.failed().count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed().next().is_none() && self.consolidation_error.is_none()
    }

    /// Fold a later report into this one; later unit states win.
    pub fn merge(&mut self, other: RunSummary) {
        self.units.extend(other.units);
        self.unchanged += other.unchanged;
        self.rejected_rows += other.rejected_rows;
        self.loads += other.loads;
        self.artifacts_written += other.artifacts_written;
        self.artifacts_unchanged += other.artifacts_unchanged;
        if other.consolidation_error.is_some() {
            self.consolidation_error = other.consolidation_error;
        }
        self.cancelled |= other.cancelled;
    }

    pub(crate) fn note_artifact(&mut self, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Written => self.artifacts_written += 1,
            WriteOutcome::Unchanged => self.artifacts_unchanged += 1,
        }
    }
}
