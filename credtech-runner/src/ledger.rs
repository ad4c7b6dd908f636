//! Unit-state ledger: JSONL, append-only.
//!
//! Every state transition appends one line; the latest line per unit is its
//! current state. Malformed lines (a torn final write, hand edits) are
//! skipped.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use credtech_core::domain::{Family, Fingerprint, UnitId};

use crate::unit::UnitState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub unit: UnitId,
    pub family: Family,
    pub raw_file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
    #[serde(flatten)]
    pub state: UnitState,
    #[serde(default)]
    pub rejected: u64,
    pub recorded_at: DateTime<Utc>,
}

impl UnitRecord {
    pub fn new(unit: UnitId, family: Family, raw_file: PathBuf, state: UnitState) -> Self {
        Self {
            unit,
            family,
            raw_file,
            fingerprint: None,
            state,
            rejected: 0,
            recorded_at: Utc::now(),
        }
    }

    /// Same unit, file, fingerprint and reject count in a new state.
    pub fn advance(&self, state: UnitState) -> Self {
        Self {
            state,
            recorded_at: Utc::now(),
            ..self.clone()
        }
    }
}

/// JSONL ledger file. Appends from worker threads are serialized.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &UnitRecord) -> io::Result<()> {
        let json = serde_json::to_string(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{json}")?;
        file.flush()?;

        tracing::debug!(unit = %record.unit, state = record.state.label(), "ledger entry");
        Ok(())
    }

    /// All entries in file order.
    pub fn read_all(&self) -> io::Result<Vec<UnitRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = io::BufReader::new(fs::File::open(&self.path)?);
        let mut entries = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<UnitRecord>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    line = index + 1,
                    error = %e,
                    "skipping malformed ledger line"
                ),
            }
        }
        Ok(entries)
    }

    /// Current state per unit: the last entry written for it.
    pub fn latest(&self) -> io::Result<BTreeMap<UnitId, UnitRecord>> {
        Ok(self
            .read_all()?
            .into_iter()
            .map(|entry| (entry.unit.clone(), entry))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::Stage;
    use credtech_core::domain::ReferenceMonth;

    fn unit() -> UnitId {
        UnitId::period("scr", ReferenceMonth::new(2024, 3).unwrap())
    }

    #[test]
    fn latest_entry_wins() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("state/units.jsonl"));
        let mut record = UnitRecord::new(unit(), Family::Credit, "scr_202403.csv".into(), UnitState::Extracted);
        record.fingerprint = Some(Fingerprint::of_bytes(b"abc"));
        ledger.append(&record).unwrap();
        ledger.append(&record.advance(UnitState::Canonicalized)).unwrap();

        let other = UnitRecord::new(
            UnitId::indicator("sgs", "432"),
            Family::Indicator,
            "sgs_432.csv".into(),
            UnitState::Failed {
                stage: Stage::Extract,
                reason: "gone".into(),
            },
        );
        ledger.append(&other).unwrap();

        assert_eq!(ledger.read_all().unwrap().len(), 3);
        let latest = ledger.latest().unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[&unit()].state, UnitState::Canonicalized);
        assert_eq!(latest[&unit()].fingerprint, record.fingerprint);
        assert!(latest[&other.unit].state.is_failed());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("units.jsonl");
        let ledger = Ledger::new(&path);
        ledger
            .append(&UnitRecord::new(unit(), Family::Credit, "a.csv".into(), UnitState::Loaded))
            .unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{\"unit\": truncated").unwrap();
        writeln!(file).unwrap();

        let entries = ledger.read_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].state, UnitState::Loaded);
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("none.jsonl"));
        assert!(ledger.latest().unwrap().is_empty());
    }
}
