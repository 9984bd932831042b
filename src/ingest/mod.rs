//! Mapping-driven ingestion of inbox submissions.
//!
//! A submission names its own target table and describes, per column, how to
//! derive a value from each source record. Nothing here knows a table schema
//! at compile time.

mod engine;
pub mod mapping;

pub use engine::{IngestError, IngestReport, IngestionEngine, Submission};
pub use mapping::{Expression, FieldMapping, MappingError, FRESH_ID_TOKEN};
