//! Run orchestration: discover units and drive them through
//! Bronze → Silver → Gold → DB.
//!
//! Each stage is callable on its own; `run` chains them. Units are processed
//! on a private rayon pool. A unit's failure is recorded in the ledger and
//! never stops the other units. Rollups wait until every contributing unit
//! is canonicalized; a rollup with a failed contributor is not aggregated
//! and its waiting siblings are failed with the blocker named.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

use credtech_core::data::{
    aggregate_credit, aggregate_indicator, canonicalize_credit, canonicalize_indicator,
    consolidate, Cell, from_table, to_table, wide_view, CanonicalReport, LayerFormat, LayerStore,
    MappingTable, RawSource, SourceReader, TableRecord, WriteOutcome,
};
use credtech_core::domain::{
    CreditAggregate, CreditRecord, Family, IndicatorObservation, IndicatorPoint, ReferenceMonth,
    RollupKey, UnitId, UnitKey,
};

use crate::config::{ConfigError, PipelineConfig};
use crate::discover::{discover, DiscoverError, RawUnit, UnitFilter};
use crate::ledger::{Ledger, UnitRecord};
use crate::loader::{LoadBatch, LoadCounts, Loader};
use crate::summary::RunSummary;
use crate::unit::{Stage, UnitError, UnitState};

/// Gold key of the long consolidated indicator table.
pub const CONSOLIDATED_KEY: &str = "consolidated";
/// Gold key of the one-column-per-indicator view (always CSV).
pub const CONSOLIDATED_WIDE_KEY: &str = "consolidated_wide";

/// Failures that stop a stage as a whole (unit failures never do).
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Discover(#[from] DiscoverError),

    #[error("state ledger {path}: {source}")]
    Ledger {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot build worker pool: {0}")]
    Pool(String),
}

/// Latest ledger state of every unit, plus what is in the store.
#[derive(Debug, Clone, Default)]
pub struct StatusReport {
    pub units: Vec<UnitRecord>,
    pub stored_rows: BTreeMap<Family, usize>,
    pub store_error: Option<String>,
}

pub struct Orchestrator {
    config: PipelineConfig,
    mappings: MappingTable,
    silver: LayerStore,
    gold: LayerStore,
    ledger: Ledger,
    loader: Loader,
    pool: rayon::ThreadPool,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.runner.concurrency)
            .thread_name(|i| format!("credtech-unit-{i}"))
            .build()
            .map_err(|e| OrchestratorError::Pool(e.to_string()))?;
        Ok(Self {
            mappings: MappingTable::builtin(),
            silver: LayerStore::new(&config.paths.silver_dir, config.layers.format),
            gold: LayerStore::new(&config.paths.gold_dir, config.layers.format),
            ledger: Ledger::new(&config.paths.ledger),
            loader: Loader::from_config(&config.database, &config.retry),
            pool,
            cancel: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    /// Flag checked between units; committed loads stay committed.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    fn ledger_err(&self) -> impl FnOnce(io::Error) -> OrchestratorError + '_ {
        move |source| OrchestratorError::Ledger {
            path: self.ledger.path().to_path_buf(),
            source,
        }
    }

    fn latest(&self) -> Result<BTreeMap<UnitId, UnitRecord>, OrchestratorError> {
        self.ledger.latest().map_err(self.ledger_err())
    }

    fn record(&self, record: &UnitRecord, summary: &mut RunSummary) -> Result<(), OrchestratorError> {
        self.ledger.append(record).map_err(self.ledger_err())?;
        summary.units.insert(record.unit.clone(), record.state.clone());
        Ok(())
    }

    fn fail(
        &self,
        record: &UnitRecord,
        stage: Stage,
        error: &UnitError,
        summary: &mut RunSummary,
    ) -> Result<(), OrchestratorError> {
        tracing::warn!(unit = %record.unit, stage = %stage, error = %error, "unit failed");
        self.record(&record.advance(UnitState::failed(stage, error)), summary)
    }

    /// Run `work` for every item on the pool and fold the reports.
    fn fan_out<T, F>(&self, items: &[T], work: F) -> Result<RunSummary, OrchestratorError>
    where
        T: Sync,
        F: Fn(&T) -> Result<RunSummary, OrchestratorError> + Sync,
    {
        let reports: Vec<Result<RunSummary, OrchestratorError>> = self.pool.install(|| {
            items
                .par_iter()
                .map(|item| {
                    if self.cancelled() {
                        return Ok(RunSummary {
                            cancelled: true,
                            ..RunSummary::default()
                        });
                    }
                    work(item)
                })
                .collect()
        });
        let mut summary = RunSummary::default();
        for report in reports {
            summary.merge(report?);
        }
        Ok(summary)
    }

    // ── extract ─────────────────────────────────────────────────────

    /// Discover raw units, read them and record `Extracted` for new or
    /// changed content.
    pub fn extract(&self, filter: &UnitFilter) -> Result<RunSummary, OrchestratorError> {
        let units = discover(&self.config.paths.raw_dir, &self.config, filter)?;
        let latest = self.latest()?;
        tracing::info!(units = units.len(), "extract");
        self.fan_out(&units, |unit| self.extract_unit(unit, latest.get(&unit.id)))
    }

    fn extract_unit(
        &self,
        unit: &RawUnit,
        previous: Option<&UnitRecord>,
    ) -> Result<RunSummary, OrchestratorError> {
        let mut summary = RunSummary::default();
        let mut record = UnitRecord::new(
            unit.id.clone(),
            unit.family,
            unit.path.clone(),
            UnitState::Pending,
        );
        let source = match SourceReader::open(&unit.path) {
            Ok(source) => source,
            Err(e) => {
                self.fail(&record, Stage::Extract, &e.into(), &mut summary)?;
                return Ok(summary);
            }
        };
        let fingerprint = source.provenance().fingerprint.clone();

        if let Some(prev) = previous {
            if prev.fingerprint.as_ref() == Some(&fingerprint)
                && resumes_at_or_after(&prev.state, &UnitState::Extracted)
            {
                summary.unchanged += 1;
                summary.units.insert(unit.id.clone(), prev.state.clone());
                return Ok(summary);
            }
        }

        tracing::info!(
            unit = %unit.id,
            fingerprint = fingerprint.short(),
            format = %source.provenance().format,
            "extracted"
        );
        record.fingerprint = Some(fingerprint);
        self.record(&record.advance(UnitState::Extracted), &mut summary)?;
        Ok(summary)
    }

    // ── bronze → silver ─────────────────────────────────────────────

    /// Canonicalize new or changed units and write their Silver artifacts.
    /// "Changed" is decided by content fingerprint only.
    pub fn bronze_to_silver(&self, filter: &UnitFilter) -> Result<RunSummary, OrchestratorError> {
        let units = discover(&self.config.paths.raw_dir, &self.config, filter)?;
        let latest = self.latest()?;
        tracing::info!(units = units.len(), "bronze to silver");
        self.fan_out(&units, |unit| self.canonicalize_unit(unit, latest.get(&unit.id)))
    }

    fn canonicalize_unit(
        &self,
        unit: &RawUnit,
        previous: Option<&UnitRecord>,
    ) -> Result<RunSummary, OrchestratorError> {
        let mut summary = RunSummary::default();
        let mut record = UnitRecord::new(
            unit.id.clone(),
            unit.family,
            unit.path.clone(),
            UnitState::Pending,
        );
        let source = match SourceReader::open(&unit.path) {
            Ok(source) => source,
            Err(e) => {
                self.fail(&record, Stage::Extract, &e.into(), &mut summary)?;
                return Ok(summary);
            }
        };
        let fingerprint = source.provenance().fingerprint.clone();

        if let Some(prev) = previous {
            if prev.fingerprint.as_ref() == Some(&fingerprint)
                && resumes_at_or_after(&prev.state, &UnitState::Canonicalized)
                && self.silver.exists(unit.family, &unit.id.artifact_key())
            {
                summary.unchanged += 1;
                summary.units.insert(unit.id.clone(), prev.state.clone());
                return Ok(summary);
            }
        }
        record.fingerprint = Some(fingerprint);

        let result = match unit.family {
            Family::Credit => self.canonicalize_credit_unit(unit, source),
            Family::Indicator => self.canonicalize_indicator_unit(unit, source),
        };
        match result {
            Ok((report, outcome)) => {
                tracing::info!(
                    unit = %unit.id,
                    vintage = %report.vintage,
                    rows_read = report.rows_read,
                    rejected = report.rejected,
                    superseded = report.superseded,
                    "canonicalized"
                );
                for sample in &report.samples {
                    tracing::debug!(unit = %unit.id, line = sample.line, reason = %sample.reason, "row rejected");
                }
                summary.rejected_rows += report.rejected;
                summary.note_artifact(outcome);
                record.rejected = report.rejected;
                self.record(&record.advance(UnitState::Canonicalized), &mut summary)?;
            }
            Err(e) => self.fail(&record, Stage::Canonicalize, &e, &mut summary)?,
        }
        Ok(summary)
    }

    fn canonicalize_credit_unit(
        &self,
        unit: &RawUnit,
        source: RawSource,
    ) -> Result<(CanonicalReport, WriteOutcome), UnitError> {
        let month = credit_month(&unit.id)?;
        let batch = canonicalize_credit(source, month, &self.mappings)?;
        let outcome = self.silver.write(
            Family::Credit,
            &unit.id.artifact_key(),
            &to_table(&batch.records),
        )?;
        Ok((batch.report, outcome))
    }

    fn canonicalize_indicator_unit(
        &self,
        unit: &RawUnit,
        source: RawSource,
    ) -> Result<(CanonicalReport, WriteOutcome), UnitError> {
        let code = indicator_code(&unit.id)?;
        let spec = self
            .config
            .indicator(code)
            .ok_or_else(|| UnitError::UnknownIndicator(code.to_string()))?;
        let batch = canonicalize_indicator(source, spec, &self.mappings)?;
        let outcome = self.silver.write(
            Family::Indicator,
            &unit.id.artifact_key(),
            &to_table(&batch.records),
        )?;
        Ok((batch.report, outcome))
    }

    // ── silver → gold ───────────────────────────────────────────────

    /// Aggregate every rollup key with freshly canonicalized units, then
    /// consolidate the indicators.
    pub fn silver_to_gold(&self, filter: &UnitFilter) -> Result<RunSummary, OrchestratorError> {
        let groups = self.rollup_groups(filter)?;
        tracing::info!(rollups = groups.len(), "silver to gold");
        let mut summary =
            self.fan_out(&groups, |(rollup, members)| self.aggregate_group(rollup, members))?;

        if filter.includes(Family::Indicator) && !self.cancelled() {
            self.consolidate_indicators(&mut summary)?;
        }
        Ok(summary)
    }

    /// Rollup keys touched by `filter`, each with all of its units (a
    /// filter narrows which rollups run, never which units feed them).
    fn rollup_groups(
        &self,
        filter: &UnitFilter,
    ) -> Result<Vec<(RollupKey, Vec<UnitRecord>)>, OrchestratorError> {
        let latest = self.latest()?;
        let selected: BTreeSet<RollupKey> = latest
            .values()
            .filter(|r| filter.matches(&r.unit, r.family))
            .map(|r| r.unit.rollup())
            .collect();
        let mut groups: BTreeMap<RollupKey, Vec<UnitRecord>> = BTreeMap::new();
        for record in latest.into_values() {
            let key = record.unit.rollup();
            if selected.contains(&key) {
                groups.entry(key).or_default().push(record);
            }
        }
        Ok(groups.into_iter().collect())
    }

    fn aggregate_group(
        &self,
        rollup: &RollupKey,
        members: &[UnitRecord],
    ) -> Result<RunSummary, OrchestratorError> {
        let mut summary = RunSummary::default();
        let group = GroupView::new(members);

        if !group.any_at(&UnitState::Canonicalized) {
            return Ok(summary);
        }
        if let Some(waiting) = group.first_short_of(&UnitState::Canonicalized) {
            tracing::info!(rollup = %rollup, waiting_on = %waiting.unit, "rollup waiting");
            return Ok(summary);
        }
        if let Some(blocker) = group.blocker {
            let error = UnitError::BlockedBy(blocker.unit.to_string());
            for member in group.at(&UnitState::Canonicalized) {
                self.fail(member, Stage::Aggregate, &error, &mut summary)?;
            }
            return Ok(summary);
        }

        match self.build_gold(rollup, &group.usable) {
            Ok((rows, outcome)) => {
                tracing::info!(rollup = %rollup, rows, units = group.usable.len(), "aggregated");
                summary.note_artifact(outcome);
                for member in &group.usable {
                    self.record(&member.advance(UnitState::Aggregated), &mut summary)?;
                }
            }
            Err(e) => {
                for member in &group.usable {
                    self.fail(member, Stage::Aggregate, &e, &mut summary)?;
                }
            }
        }
        Ok(summary)
    }

    /// Aggregate one rollup from the Silver artifacts of its units.
    fn build_gold(
        &self,
        rollup: &RollupKey,
        members: &[&UnitRecord],
    ) -> Result<(usize, WriteOutcome), UnitError> {
        match rollup {
            RollupKey::Month(month) => {
                let mut units = Vec::with_capacity(members.len());
                for member in members {
                    let table = self.silver.read(
                        Family::Credit,
                        &member.unit.artifact_key(),
                        &CreditRecord::schema(),
                    )?;
                    units.push((member.unit.clone(), from_table::<CreditRecord>(&table)?));
                }
                let rows = aggregate_credit(*month, units)?;
                let outcome = self
                    .gold
                    .write(Family::Credit, &month.to_string(), &to_table(&rows))?;
                Ok((rows.len(), outcome))
            }
            RollupKey::Indicator(code) => {
                let spec = self
                    .config
                    .indicator(code)
                    .ok_or_else(|| UnitError::UnknownIndicator(code.clone()))?;
                let mut units = Vec::with_capacity(members.len());
                for member in members {
                    let table = self.silver.read(
                        Family::Indicator,
                        &member.unit.artifact_key(),
                        &IndicatorObservation::schema(),
                    )?;
                    units.push((
                        member.unit.clone(),
                        from_table::<IndicatorObservation>(&table)?,
                    ));
                }
                let points = aggregate_indicator(spec, units)?;
                let outcome = self
                    .gold
                    .write(Family::Indicator, code, &to_table(&points))?;
                Ok((points.len(), outcome))
            }
        }
    }

    /// Merge the Gold series of every indicator that made it through
    /// aggregation. Failures are reported, not fatal.
    fn consolidate_indicators(&self, summary: &mut RunSummary) -> Result<(), OrchestratorError> {
        let groups = self.rollup_groups(&UnitFilter::family(Family::Indicator))?;
        let codes: Vec<String> = groups
            .iter()
            .filter_map(|(rollup, members)| {
                let group = GroupView::new(members);
                let ready = group.blocker.is_none()
                    && !group.usable.is_empty()
                    && group.first_short_of(&UnitState::Aggregated).is_none();
                match rollup {
                    RollupKey::Indicator(code) if ready => Some(code.clone()),
                    _ => None,
                }
            })
            .collect();
        if codes.is_empty() {
            return Ok(());
        }

        match self.write_consolidated(&codes) {
            Ok((rows, outcomes)) => {
                tracing::info!(indicators = codes.len(), rows, "indicators consolidated");
                for outcome in outcomes {
                    summary.note_artifact(outcome);
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "consolidation failed");
                summary.consolidation_error = Some(e.to_string());
            }
        }
        Ok(())
    }

    /// Long table in the layer format plus the wide view as CSV.
    fn write_consolidated(&self, codes: &[String]) -> Result<(usize, [WriteOutcome; 2]), UnitError> {
        let mut series = Vec::with_capacity(codes.len());
        for code in codes {
            let table = self
                .gold
                .read(Family::Indicator, code, &IndicatorPoint::schema())?;
            series.push(from_table::<IndicatorPoint>(&table)?);
        }
        let points = consolidate(&series, self.config.consolidation);
        let long = self
            .gold
            .write(Family::Indicator, CONSOLIDATED_KEY, &to_table(&points))?;
        let wide = self.gold.write_as(
            Family::Indicator,
            CONSOLIDATED_WIDE_KEY,
            &wide_view(&points, &self.config.indicators),
            LayerFormat::Csv,
        )?;
        Ok((points.len(), [long, wide]))
    }

    // ── gold → db ───────────────────────────────────────────────────

    /// Load every rollup whose units are aggregated and not yet loaded.
    pub fn gold_to_db(&self, filter: &UnitFilter) -> Result<RunSummary, OrchestratorError> {
        let groups = self.rollup_groups(filter)?;
        tracing::info!(rollups = groups.len(), "gold to db");
        self.fan_out(&groups, |(rollup, members)| self.load_group(rollup, members))
    }

    fn load_group(
        &self,
        rollup: &RollupKey,
        members: &[UnitRecord],
    ) -> Result<RunSummary, OrchestratorError> {
        let mut summary = RunSummary::default();
        let group = GroupView::new(members);

        if !group.any_at(&UnitState::Aggregated) {
            return Ok(summary);
        }
        if let Some(blocker) = group.blocker {
            tracing::warn!(rollup = %rollup, blocker = %blocker.unit, "load skipped, rollup has a failed unit");
            return Ok(summary);
        }
        if let Some(waiting) = group.first_short_of(&UnitState::Aggregated) {
            tracing::info!(rollup = %rollup, waiting_on = %waiting.unit, "load waiting");
            return Ok(summary);
        }

        match self.load_rollup(rollup) {
            Ok(counts) => {
                summary.loads += counts;
                for member in &group.usable {
                    self.record(&member.advance(UnitState::Loaded), &mut summary)?;
                }
            }
            Err(e) => {
                for member in &group.usable {
                    self.fail(member, Stage::Load, &e, &mut summary)?;
                }
            }
        }
        Ok(summary)
    }

    fn load_rollup(&self, rollup: &RollupKey) -> Result<LoadCounts, UnitError> {
        let family = rollup.family();
        // the Gold table is the whole month (or series), so it replaces it in the store
        let (key, schema, partition) = match rollup {
            RollupKey::Month(month) => (
                month.to_string(),
                CreditAggregate::schema(),
                "reference_month",
            ),
            RollupKey::Indicator(code) => {
                (code.clone(), IndicatorPoint::schema(), "indicator_code")
            }
        };
        let table = self.gold.read(family, &key, &schema)?;
        let batch = LoadBatch::new(self.config.database.table_for(family), table)
            .replacing(partition, Cell::text(key));
        Ok(self.loader.load(&batch)?)
    }

    // ── chained ─────────────────────────────────────────────────────

    /// All four stages in order. The summary reports the final state of
    /// every unit in scope.
    pub fn run(&self, filter: &UnitFilter) -> Result<RunSummary, OrchestratorError> {
        let mut summary = self.extract(filter)?;
        type StageFn = fn(&Orchestrator, &UnitFilter) -> Result<RunSummary, OrchestratorError>;
        let stages: [StageFn; 3] = [
            Orchestrator::bronze_to_silver,
            Orchestrator::silver_to_gold,
            Orchestrator::gold_to_db,
        ];
        for stage in stages {
            if self.cancelled() {
                summary.cancelled = true;
                break;
            }
            summary.merge(stage(self, filter)?);
        }

        for (unit, record) in self.latest()? {
            if filter.matches(&unit, record.family) {
                summary.units.insert(unit, record.state);
            }
        }
        tracing::info!(
            units = summary.total(),
            failed = summary.total() - summary.succeeded(),
            rejected_rows = summary.rejected_rows,
            inserted = summary.loads.inserted,
            updated = summary.loads.updated,
            unchanged = summary.loads.unchanged,
            deleted = summary.loads.deleted,
            "run finished"
        );
        Ok(summary)
    }

    /// Ledger state of the units in scope and row counts in the store.
    pub fn status(&self, filter: &UnitFilter) -> Result<StatusReport, OrchestratorError> {
        let mut report = StatusReport {
            units: self
                .latest()?
                .into_values()
                .filter(|r| filter.matches(&r.unit, r.family))
                .collect(),
            ..StatusReport::default()
        };
        for family in Family::ALL {
            if !filter.includes(family) {
                continue;
            }
            let schema = match family {
                Family::Credit => CreditAggregate::schema(),
                Family::Indicator => IndicatorPoint::schema(),
            };
            match self
                .loader
                .read_back(self.config.database.table_for(family), &schema)
            {
                Ok(table) => {
                    report.stored_rows.insert(family, table.len());
                }
                Err(e) => report.store_error = Some(e.to_string()),
            }
        }
        Ok(report)
    }
}

/// A rollup's units split by what they can contribute.
struct GroupView<'a> {
    /// Units with valid Silver (or later) artifacts, at their resume point.
    usable: Vec<&'a UnitRecord>,
    resume: Vec<UnitState>,
    /// A unit whose own raw input failed and whose file is still there.
    blocker: Option<&'a UnitRecord>,
}

impl<'a> GroupView<'a> {
    fn new(members: &'a [UnitRecord]) -> Self {
        let mut usable = Vec::new();
        let mut resume = Vec::new();
        let mut blocker = None;
        for member in members {
            match member.state.resume_point() {
                Some(state) => {
                    usable.push(member);
                    resume.push(state);
                }
                None if member.raw_file.exists() => {
                    blocker = blocker.or(Some(member));
                }
                None => {}
            }
        }
        Self {
            usable,
            resume,
            blocker,
        }
    }

    fn any_at(&self, state: &UnitState) -> bool {
        self.resume.iter().any(|s| s == state)
    }

    fn at(&self, state: &UnitState) -> impl Iterator<Item = &'a UnitRecord> + '_ {
        let state = state.clone();
        self.usable
            .iter()
            .zip(&self.resume)
            .filter(move |(_, s)| **s == state)
            .map(|(m, _)| *m)
    }

    fn first_short_of(&self, state: &UnitState) -> Option<&'a UnitRecord> {
        self.usable
            .iter()
            .zip(&self.resume)
            .find(|(_, s)| !s.reached(state))
            .map(|(m, _)| *m)
    }
}

/// Aggregate and load failures keep their upstream artifacts, so the unit
/// does not need to be read again.
fn resumes_at_or_after(state: &UnitState, step: &UnitState) -> bool {
    state.resume_point().is_some_and(|s| s.reached(step))
}

fn credit_month(id: &UnitId) -> Result<ReferenceMonth, UnitError> {
    match &id.key {
        UnitKey::Period(month) => Ok(*month),
        UnitKey::Indicator(_) => Err(UnitError::KeyMismatch {
            unit: id.to_string(),
            family: Family::Credit,
        }),
    }
}

fn indicator_code(id: &UnitId) -> Result<&str, UnitError> {
    match &id.key {
        UnitKey::Indicator(code) => Ok(code),
        UnitKey::Period(_) => Err(UnitError::KeyMismatch {
            unit: id.to_string(),
            family: Family::Indicator,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn record(unit: UnitId, file: &Path, state: UnitState) -> UnitRecord {
        UnitRecord::new(unit, Family::Credit, file.to_path_buf(), state)
    }

    fn march() -> ReferenceMonth {
        ReferenceMonth::new(2024, 3).unwrap()
    }

    #[test]
    fn group_view_blocks_only_on_present_raw_failures() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("scr_202403_x.xlsx");
        std::fs::write(&present, b"PK").unwrap();
        let gone = dir.path().join("scr_202403_gone.csv");

        let members = vec![
            record(UnitId::period("scr", march()), &present, UnitState::Canonicalized),
            record(
                UnitId::period("scr", march()).with_tag("gone"),
                &gone,
                UnitState::Failed {
                    stage: Stage::Canonicalize,
                    reason: "x".into(),
                },
            ),
        ];
        let view = GroupView::new(&members);
        assert!(view.blocker.is_none());
        assert_eq!(view.usable.len(), 1);

        let mut members = members;
        members.push(record(
            UnitId::period("scr", march()).with_tag("x"),
            &present,
            UnitState::Failed {
                stage: Stage::Extract,
                reason: "spreadsheet".into(),
            },
        ));
        let view = GroupView::new(&members);
        assert_eq!(view.blocker.map(|b| b.unit.tag.clone()), Some(Some("x".into())));
    }

    #[test]
    fn aggregate_failures_resume_from_silver() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("scr_202403.csv");
        let members = vec![
            record(
                UnitId::period("scr", march()),
                &file,
                UnitState::Failed {
                    stage: Stage::Aggregate,
                    reason: "blocked".into(),
                },
            ),
            record(UnitId::period("planilha", march()), &file, UnitState::Extracted),
        ];
        let view = GroupView::new(&members);
        assert!(view.any_at(&UnitState::Canonicalized));
        assert_eq!(
            view.first_short_of(&UnitState::Canonicalized).map(|m| m.unit.source.as_str()),
            Some("planilha")
        );
        assert_eq!(view.at(&UnitState::Canonicalized).count(), 1);
    }

    #[test]
    fn unit_keys_match_their_family() {
        assert_eq!(credit_month(&UnitId::period("scr", march())).unwrap(), march());
        assert!(credit_month(&UnitId::indicator("sgs", "432")).is_err());
        assert_eq!(indicator_code(&UnitId::indicator("sgs", "432")).unwrap(), "432");
        assert!(indicator_code(&UnitId::period("scr", march())).is_err());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::rooted(dir.path());
        config.runner.concurrency = 0;
        assert!(matches!(
            Orchestrator::new(config),
            Err(OrchestratorError::Config(ConfigError::ZeroConcurrency))
        ));
    }
}
