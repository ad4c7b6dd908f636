//! Layer transformations: reading raw extracts, canonicalizing, aggregating,
//! consolidating and persisting Silver/Gold artifacts.

pub mod aggregate;
pub mod canonicalize;
pub mod coerce;
pub mod consolidate;
pub mod layer;
pub mod mapping;
pub mod reader;
pub mod records;
pub mod schema;

pub use aggregate::{aggregate_credit, aggregate_indicator, merge_partials, AggregateError};
pub use canonicalize::{
    canonicalize_credit, canonicalize_indicator, CanonicalBatch, CanonicalReport,
    CanonicalizeError, RowRejection,
};
pub use coerce::{CoercionError, NumberLocale};
pub use consolidate::{consolidate, wide_view, ConsolidationWindow};
pub use layer::{ArtifactMeta, LayerError, LayerFormat, LayerStore, WriteOutcome};
pub use mapping::{MappingTable, ResolvedMapping, UnknownSourceSchema, Vintage};
pub use reader::{
    MalformedRow, Provenance, RawRecord, RawSource, ReadError, SourceFormat, SourceReader,
};
pub use schema::{
    from_table, to_table, Cell, ColumnKind, ColumnSpec, SchemaError, Table, TableRecord,
    TableSchema,
};
