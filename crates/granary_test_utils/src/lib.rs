//! Granary Test Utilities
//!
//! A scripted warehouse double ([`MockWarehouse`]), fixture file builders,
//! and a collecting progress sink. The mock answers the loader's
//! stage-and-copy calls and the completeness validator's aggregate queries
//! from an in-memory table, so end-to-end paths run without a warehouse.

pub mod fixtures;
pub mod mock;
pub mod sink;

pub use fixtures::{gzip_file, write_delimited};
pub use mock::{MockConnector, MockWarehouse};
pub use sink::{CollectingSink, SinkEvent};
