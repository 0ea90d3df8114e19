//! lifter-ctl library: the process-level adapters around the engine.
//!
//! - **Config**: environment-driven settings
//! - **HttpEventSource**: endpoint feed client (snapshot + incremental events)
//! - **SqliteTable**: durable fixed-capacity service table
//! - **API**: `/metrics` and `/healthz`
//! - **MetricsExporter**: Prometheus rendering of engine counters

pub mod api;
pub mod config;
pub mod exporter;
pub mod http_source;
pub mod sqlite_table;

pub use config::Config;
pub use exporter::MetricsExporter;
pub use http_source::{HttpEventSource, HttpSourceConfig};
pub use sqlite_table::{SqliteTable, TableStoreError};
