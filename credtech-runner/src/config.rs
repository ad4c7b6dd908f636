//! Pipeline configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration rooted in the current directory. The value is built
//! once by the binary and threaded into the orchestrator. Only
//! [`PipelineConfig::load`] looks at the environment, for the database
//! connection variables listed in [`DB_ENV_VARS`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use credtech_core::data::{ConsolidationWindow, LayerFormat};
use credtech_core::domain::{Family, IndicatorSpec};

use crate::orchestrator::{CONSOLIDATED_KEY, CONSOLIDATED_WIDE_KEY};

/// File picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "credtech.toml";

/// Environment overrides for the database connection, applied after the file.
pub const DB_ENV_VARS: [&str; 5] = [
    "CREDTECH_DB_HOST",
    "CREDTECH_DB_PORT",
    "CREDTECH_DB_NAME",
    "CREDTECH_DB_USER",
    "CREDTECH_DB_PASSWORD",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("runner.concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("retry.max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("source '{source_prefix}' maps to unknown family '{family}'")]
    UnknownFamily {
        source_prefix: String,
        family: String,
    },

    #[error("indicator code '{0}' is listed more than once")]
    DuplicateIndicator(String),

    #[error("indicator code '{0}' is reserved for the consolidated tables")]
    ReservedIndicatorCode(String),

    #[error("consolidation window starts after it ends")]
    InvertedWindow,

    #[error("database.{0} must not be empty")]
    EmptyDatabaseField(&'static str),

    #[error("{var}={value} is not a valid port")]
    InvalidPort { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub raw_dir: PathBuf,
    pub silver_dir: PathBuf,
    pub gold_dir: PathBuf,
    pub log_dir: PathBuf,
    /// JSONL unit-state ledger.
    pub ledger: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            raw_dir: PathBuf::from("data/raw"),
            silver_dir: PathBuf::from("data/silver"),
            gold_dir: PathBuf::from("data/gold"),
            log_dir: PathBuf::from("logs"),
            ledger: PathBuf::from("data/state/units.jsonl"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayersConfig {
    pub format: LayerFormat,
}

/// Relational store the Gold tables are loaded into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    #[default]
    Postgres,
    /// Single-file store for local runs and tests.
    Sqlite,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    /// Usually left out of the file and supplied as `CREDTECH_DB_PASSWORD`.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,
    pub connect_timeout_ms: u64,
    /// Store file for the sqlite backend.
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
    pub credit_table: String,
    pub indicator_table: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::Postgres,
            host: "localhost".into(),
            port: 5432,
            database: "credtech".into(),
            user: "postgres".into(),
            password: String::new(),
            connect_timeout_ms: 10_000,
            path: PathBuf::from("data/credtech.db"),
            busy_timeout_ms: 5_000,
            credit_table: "ft_scr_agregado_mensal".into(),
            indicator_table: "ft_indicadores_economicos".into(),
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("backend", &self.backend)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("path", &self.path)
            .field("busy_timeout_ms", &self.busy_timeout_ms)
            .field("credit_table", &self.credit_table)
            .field("indicator_table", &self.indicator_table)
            .finish()
    }
}

impl DatabaseConfig {
    pub fn table_for(&self, family: Family) -> &str {
        match family {
            Family::Credit => &self.credit_table,
            Family::Indicator => &self.indicator_table,
        }
    }

    /// Where rows go, without credentials: `postgres://user@host:5432/credtech`.
    pub fn describe(&self) -> String {
        match self.backend {
            DatabaseBackend::Postgres => format!(
                "postgres://{}@{}:{}/{}",
                self.user, self.host, self.port, self.database
            ),
            DatabaseBackend::Sqlite => format!("sqlite://{}", self.path.display()),
        }
    }

    /// Apply `CREDTECH_DB_*` overrides from `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let [host, port, name, user, password] = DB_ENV_VARS;
        if let Some(value) = lookup(host) {
            self.host = value;
        }
        if let Some(value) = lookup(port) {
            self.port = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidPort { var: port, value })?;
        }
        if let Some(value) = lookup(name) {
            self.database = value;
        }
        if let Some(value) = lookup(user) {
            self.user = value;
        }
        if let Some(value) = lookup(password) {
            self.password = value;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.credit_table.trim().is_empty() {
            return Err(ConfigError::EmptyDatabaseField("credit_table"));
        }
        if self.indicator_table.trim().is_empty() {
            return Err(ConfigError::EmptyDatabaseField("indicator_table"));
        }
        if self.backend == DatabaseBackend::Postgres {
            for (field, value) in [
                ("host", &self.host),
                ("database", &self.database),
                ("user", &self.user),
            ] {
                if value.trim().is_empty() {
                    return Err(ConfigError::EmptyDatabaseField(field));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Worker threads in the unit pool.
    pub concurrency: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self { concurrency: 4 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

/// Full pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub paths: PathsConfig,
    pub layers: LayersConfig,
    pub database: DatabaseConfig,
    pub runner: RunnerConfig,
    pub retry: RetryConfig,
    /// Raw file prefix → family name.
    pub sources: BTreeMap<String, String>,
    /// Indicator catalog; series without an entry here are rejected.
    pub indicators: Vec<IndicatorSpec>,
    pub consolidation: ConsolidationWindow,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let sources = [("scr", "credit"), ("planilha", "credit"), ("sgs", "indicator")]
            .into_iter()
            .map(|(prefix, family)| (prefix.to_string(), family.to_string()))
            .collect();
        Self {
            paths: PathsConfig::default(),
            layers: LayersConfig::default(),
            database: DatabaseConfig::default(),
            runner: RunnerConfig::default(),
            retry: RetryConfig::default(),
            sources,
            indicators: IndicatorSpec::default_catalog(),
            consolidation: ConsolidationWindow::default(),
        }
    }
}

impl PipelineConfig {
    /// Resolve the configuration: an explicit file, else `credtech.toml` in
    /// the working directory when present, else defaults.
    /// `CREDTECH_DB_*` variables then override the database section.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::read_file(path)?,
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.exists() {
                    Self::read_file(fallback)?
                } else {
                    Self::default()
                }
            }
        };
        config.database.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::read_file(path)?;
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Defaults with every path placed under `root`.
    pub fn rooted(root: &Path) -> Self {
        let mut config = Self::default();
        config.paths = PathsConfig {
            raw_dir: root.join("raw"),
            silver_dir: root.join("silver"),
            gold_dir: root.join("gold"),
            log_dir: root.join("logs"),
            ledger: root.join("state/units.jsonl"),
        };
        config.database.backend = DatabaseBackend::Sqlite;
        config.database.path = root.join("credtech.db");
        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runner.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        for (prefix, family) in &self.sources {
            if family.parse::<Family>().is_err() {
                return Err(ConfigError::UnknownFamily {
                    source_prefix: prefix.clone(),
                    family: family.clone(),
                });
            }
        }
        let mut seen = BTreeSet::new();
        for spec in &self.indicators {
            if !seen.insert(spec.code.as_str()) {
                return Err(ConfigError::DuplicateIndicator(spec.code.clone()));
            }
            // indicator Gold artifacts are keyed by code
            if [CONSOLIDATED_KEY, CONSOLIDATED_WIDE_KEY]
                .iter()
                .any(|key| spec.code.eq_ignore_ascii_case(key))
            {
                return Err(ConfigError::ReservedIndicatorCode(spec.code.clone()));
            }
        }
        if let (Some(start), Some(end)) = (self.consolidation.start, self.consolidation.end) {
            if start > end {
                return Err(ConfigError::InvertedWindow);
            }
        }
        self.database.validate()
    }

    /// Family of a raw file prefix, matched case-insensitively.
    pub fn family_of(&self, source: &str) -> Option<Family> {
        let source = source.to_ascii_lowercase();
        self.sources
            .iter()
            .find(|(prefix, _)| prefix.to_ascii_lowercase() == source)
            .and_then(|(_, family)| family.parse().ok())
    }

    pub fn indicator(&self, code: &str) -> Option<&IndicatorSpec> {
        self.indicators.iter().find(|spec| spec.code == code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credtech_core::domain::Periodicity;

    #[test]
    fn empty_file_yields_defaults() {
        let config: PipelineConfig = toml::from_str("").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.database.credit_table, "ft_scr_agregado_mensal");
        assert_eq!(config.database.backend, DatabaseBackend::Postgres);
        assert_eq!(config.database.describe(), "postgres://postgres@localhost:5432/credtech");
        assert_eq!(config.indicators.len(), 5);
    }

    #[test]
    fn database_section_selects_the_backend() {
        let config: PipelineConfig = toml::from_str(
            r#"
            [database]
            host = "db.internal"
            port = 6543
            user = "etl"
            "#,
        )
        .unwrap();
        assert_eq!(config.database.backend, DatabaseBackend::Postgres);
        assert_eq!(config.database.describe(), "postgres://etl@db.internal:6543/credtech");

        let config: PipelineConfig = toml::from_str(
            r#"
            [database]
            backend = "sqlite"
            path = "/tmp/credtech.db"
            "#,
        )
        .unwrap();
        assert_eq!(config.database.backend, DatabaseBackend::Sqlite);
        assert_eq!(config.database.describe(), "sqlite:///tmp/credtech.db");
    }

    #[test]
    fn environment_overrides_connection_settings() {
        let mut database = DatabaseConfig::default();
        database
            .apply_env(|var| match var {
                "CREDTECH_DB_HOST" => Some("pg.example".into()),
                "CREDTECH_DB_PORT" => Some("5433".into()),
                "CREDTECH_DB_PASSWORD" => Some("s3cret".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(database.host, "pg.example");
        assert_eq!(database.port, 5433);
        assert_eq!(database.password, "s3cret");
        assert_eq!(database.user, "postgres");
        assert!(!format!("{database:?}").contains("s3cret"));

        let err = DatabaseConfig::default()
            .apply_env(|var| (var == "CREDTECH_DB_PORT").then(|| "pg".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort { .. }));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: PipelineConfig = toml::from_str(
            r#"
            [layers]
            format = "parquet"

            [runner]
            concurrency = 2

            [consolidation]
            start = "2024-01-01"
            "#,
        )
        .unwrap();
        assert_eq!(config.layers.format, LayerFormat::Parquet);
        assert_eq!(config.runner.concurrency, 2);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.consolidation.start.is_some());
        assert!(config.consolidation.end.is_none());
    }

    #[test]
    fn custom_indicator_catalog() {
        let config: PipelineConfig = toml::from_str(
            r#"
            [[indicators]]
            code = "4390"
            name = "selic_mensal"
            periodicity = "monthly"
            "#,
        )
        .unwrap();
        assert_eq!(config.indicators.len(), 1);
        assert_eq!(config.indicator("4390").unwrap().name, "selic_mensal");
        assert!(config.indicator("432").is_none());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.runner.concurrency = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroConcurrency)));

        let mut config = PipelineConfig::default();
        config.retry.max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroAttempts)));

        let mut config = PipelineConfig::default();
        config.sources.insert("bolsa".into(), "equities".into());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownFamily { .. })
        ));

        let mut config = PipelineConfig::default();
        let dup = config.indicators[0].clone();
        config.indicators.push(dup);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateIndicator(code)) if code == "432"
        ));

        let mut config = PipelineConfig::default();
        config.database.host = " ".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptyDatabaseField("host"))
        ));
    }

    #[test]
    fn consolidated_keys_are_not_indicator_codes() {
        for code in ["consolidated", "Consolidated_Wide"] {
            let mut config = PipelineConfig::default();
            config
                .indicators
                .push(IndicatorSpec::new(code, "x", "", "", Periodicity::Monthly));
            assert!(matches!(
                config.validate(),
                Err(ConfigError::ReservedIndicatorCode(c)) if c == code
            ));
        }
    }

    #[test]
    fn source_prefixes_map_to_families() {
        let config = PipelineConfig::default();
        assert_eq!(config.family_of("SCR"), Some(Family::Credit));
        assert_eq!(config.family_of("planilha"), Some(Family::Credit));
        assert_eq!(config.family_of("sgs"), Some(Family::Indicator));
        assert_eq!(config.family_of("ibge"), None);
    }

    #[test]
    fn missing_explicit_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = PipelineConfig::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credtech.toml");
        let config = PipelineConfig::rooted(dir.path());
        std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();
        assert_eq!(PipelineConfig::from_file(&path).unwrap(), config);
    }
}
