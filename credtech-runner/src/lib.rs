//! credtech runner: configuration, unit ledger, loader and stage orchestration.
//!
//! This crate builds on `credtech-core` to provide:
//! - TOML pipeline configuration
//! - Raw unit discovery from file names
//! - JSONL unit-state ledger
//! - Idempotent PostgreSQL / SQLite loader with bounded retry
//! - The run orchestrator (extract, bronze→silver, silver→gold, gold→db)
//! - Console and per-stage file logging

pub mod config;
pub mod discover;
pub mod ledger;
pub mod loader;
pub mod logging;
pub mod orchestrator;
pub mod retry;
pub mod summary;
pub mod unit;

pub use config::{
    ConfigError, DatabaseBackend, DatabaseConfig, PipelineConfig, DEFAULT_CONFIG_FILE,
};
pub use discover::{discover, parse_file_name, DiscoverError, RawUnit, UnitFilter};
pub use ledger::{Ledger, UnitRecord};
pub use loader::{
    LoadBatch, LoadCounts, LoadError, Loader, Partition, PostgresStore, SqliteStore, Store,
};
pub use logging::LoggingError;
pub use orchestrator::{Orchestrator, OrchestratorError, StatusReport};
pub use retry::{RetryPolicy, Retryable};
pub use summary::RunSummary;
pub use unit::{Stage, UnitError, UnitState};
