//! Granary: a bulk-ingest pipeline for delimited files.
//!
//! The orchestrator drives each file through analyze → validate →
//! compress+stage → COPY → post-load validation with bounded parallelism
//! and partial-failure isolation. Everything warehouse-shaped arrives
//! through the session pool injected at construction.

pub mod orchestrator;

pub use orchestrator::{Job, LoadOrchestrator};
