//! credtech core: domain types and the Bronze→Silver→Gold transformations.
//!
//! - Domain types for the credit (SCR) and indicator (SGS) families
//! - Source Reader with encoding and delimiter detection
//! - Versioned schema mapping and the Canonicalizer
//! - Aggregator and indicator Consolidator
//! - Typed tables and the persisted layer store (CSV or Parquet)

pub mod data;
pub mod domain;
