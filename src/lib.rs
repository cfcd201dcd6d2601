//! clean-db-structure: deterministic PostgreSQL schema dumps
//!
//! This library rewrites a schema dump (such as a Rails `db/structure.sql`)
//! so that dumping an unchanged schema twice yields byte-identical text.
//! It reorders the `schema_migrations` seed block and moves index statements
//! next to the table they belong to, leaving every other byte untouched.

pub mod config;
pub mod dump;
pub mod indexes;
pub mod migrations;
pub mod pipeline;

// Re-export commonly used types
pub use config::{CleanOptions, Config, MigrationsOrder};
pub use dump::{DumpBuffer, DumpError, SpanEdit};
pub use indexes::IndexRelocator;
pub use migrations::MigrationsNormalizer;
pub use pipeline::{CleanOutcome, CleanPipeline, DumpPass, PassReport, clean_dump};
