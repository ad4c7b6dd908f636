//! Raw unit discovery.
//!
//! Bronze files are named `<source>_<period|indicator-code>[_<free text>].<ext>`.
//! The source prefix selects the family through the `sources` config table;
//! credit files carry a `YYYYMM` or `YYYY-MM` period, indicator files the
//! series code.

use std::path::{Path, PathBuf};

use credtech_core::domain::{Family, ReferenceMonth, UnitId, UnitKey};

use crate::config::PipelineConfig;

/// Extensions treated as raw extracts. Spreadsheets are discovered so that
/// they fail visibly instead of being ignored.
const RAW_EXTENSIONS: &[&str] = &["csv", "txt", "tsv", "xlsx", "xls", "xlsm", "ods"];

#[derive(Debug, thiserror::Error)]
#[error("cannot list raw directory {path}: {source}")]
pub struct DiscoverError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// One raw file and the unit it feeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawUnit {
    pub id: UnitId,
    pub family: Family,
    pub path: PathBuf,
}

/// Optional narrowing of the units a stage works on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitFilter {
    pub family: Option<Family>,
    /// Applies to credit units only; indicator units have no period.
    pub period: Option<ReferenceMonth>,
    pub source: Option<String>,
}

impl UnitFilter {
    pub fn family(family: Family) -> Self {
        Self {
            family: Some(family),
            ..Self::default()
        }
    }

    pub fn matches(&self, id: &UnitId, family: Family) -> bool {
        if self.family.is_some_and(|f| f != family) {
            return false;
        }
        if let (Some(period), UnitKey::Period(month)) = (self.period, &id.key) {
            if *month != period {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if !source.eq_ignore_ascii_case(&id.source) {
                return false;
            }
        }
        true
    }

    pub fn includes(&self, family: Family) -> bool {
        self.family.map_or(true, |f| f == family)
    }
}

/// Parse a raw file name into its unit. `None` for names outside the
/// naming convention or with an unmapped source prefix.
pub fn parse_file_name(name: &str, config: &PipelineConfig) -> Option<(UnitId, Family)> {
    let (stem, ext) = name.rsplit_once('.')?;
    if !RAW_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
        return None;
    }
    let mut parts = stem.splitn(3, '_');
    let source = parts.next()?.to_ascii_lowercase();
    let key = parts.next()?;
    let tag = parts.next().filter(|t| !t.is_empty());
    let family = config.family_of(&source)?;

    let id = match family {
        Family::Credit => UnitId::period(source, parse_period(key)?),
        Family::Indicator => {
            if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric()) {
                return None;
            }
            UnitId::indicator(source, key)
        }
    };
    Some(match tag {
        Some(tag) => (id.with_tag(tag), family),
        None => (id, family),
    })
}

/// `YYYYMM` or `YYYY-MM` only; file names never carry days.
fn parse_period(key: &str) -> Option<ReferenceMonth> {
    let digits = key.len() == 6 && key.chars().all(|c| c.is_ascii_digit());
    let dashed = key.len() == 7 && key.as_bytes()[4] == b'-';
    if digits || dashed {
        key.parse().ok()
    } else {
        None
    }
}

/// List the raw units under `raw_dir` that pass `filter`, sorted by unit id.
///
/// Files that do not follow the naming convention are logged and skipped.
pub fn discover(
    raw_dir: &Path,
    config: &PipelineConfig,
    filter: &UnitFilter,
) -> Result<Vec<RawUnit>, DiscoverError> {
    let io_err = |source| DiscoverError {
        path: raw_dir.to_path_buf(),
        source,
    };
    if !raw_dir.exists() {
        tracing::warn!(path = %raw_dir.display(), "raw directory does not exist");
        return Ok(Vec::new());
    }

    let mut units = Vec::new();
    for entry in std::fs::read_dir(raw_dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if !entry.file_type().map_err(io_err)?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        match parse_file_name(&name, config) {
            Some((id, family)) if filter.matches(&id, family) => units.push(RawUnit {
                id,
                family,
                path: entry.path(),
            }),
            Some(_) => {}
            None => tracing::warn!(file = %name, "skipping file outside the naming convention"),
        }
    }
    units.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(units)
}
