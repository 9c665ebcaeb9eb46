//! GPS Refinery: windowed outlier filtering for vehicle telemetry
//!
//! Raw pings land in a time-series table; this crate turns them into a
//! filtered table in bounded time windows, tracked as batches with
//! heartbeat locks so concurrent workers never process the same scope.
//!
//! ## Architecture
//!
//! - **Filter**: per-vehicle plausibility check (implied speed ceiling)
//! - **Storage**: `PingStore` / `BatchStore` traits, PostgreSQL and in-memory backends
//! - **Pipeline**: window scheduler, batch executor, per-vehicle fan-out, retry manager
//! - **Status**: batch rollup, queue, lock freshness and health checks

pub mod config;
pub mod filter;
pub mod pipeline;
pub mod status;
pub mod storage;
pub mod types;

// Re-export configuration
pub use config::{ConfigError, ProcessorConfig};

// Re-export commonly used types
pub use types::{
    BatchResult, BatchStatus, FilteredPing, OutlierKind, ProcessingBatch, RawPing, TimeWindow,
};

// Re-export pipeline entry points
pub use pipeline::{Pipeline, PipelineError};

// Re-export storage
pub use storage::{BatchStore, InMemoryStore, PingStore, Store, StoreError};

pub use status::{StatusReport, StatusReporter};
