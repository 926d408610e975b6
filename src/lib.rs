//! Medallion ETL Library
//!
//! Batch pipeline over a single SQLite store, in three layers:
//! raw (append-only, as-ingested), staging (deduplicated, validated,
//! referentially closed), prod (fully derived aggregates). Re-running any
//! layer over the same inputs converges to the same state.
//!
//! Exposes the engine modules for the `medallion` binary and tests.

pub mod aggregator;
pub mod cleaner;
pub mod config;
pub mod context;
pub mod db;
pub mod model;
pub mod orchestrator;
pub mod quality;
pub mod raw_store;
pub mod rules;

pub use config::PipelineConfig;
pub use context::{DateRange, Layer, RunContext, RunMode};
pub use orchestrator::{RunReport, RunState};
