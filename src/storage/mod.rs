//! Storage layer
//!
//! Two traits split the database along ownership lines:
//! - `PingStore`: raw pings and the vehicle registry (read), filtered pings (write)
//! - `BatchStore`: the processing batch table, including the row lock
//!
//! Backends:
//! - `InMemoryStore`: tests and dry runs
//! - `PgStore`: PostgreSQL / TimescaleDB via `sqlx` (feature `timescale`)

mod memory;
#[cfg(feature = "timescale")]
pub mod db;
#[cfg(feature = "timescale")]
mod postgres;

pub use memory::InMemoryStore;
#[cfg(feature = "timescale")]
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;
use crate::types::{FilteredPing, Fix, ProcessingBatch, RawPing, TimeWindow, VehicleToProcess};

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[cfg(feature = "timescale")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("batch {0} not found")]
    BatchNotFound(i64),

    #[error("unknown vehicle id {0}")]
    UnknownVehicle(i32),

    #[error("invalid row: {0}")]
    InvalidRow(String),

    #[error("storage error: {0}")]
    Backend(String),
}

/// Raw and filtered pings plus the vehicle registry.
#[async_trait]
pub trait PingStore: Send + Sync {
    /// Raw pings inside `window`, ordered by garage number then time.
    /// `garage_no` narrows to one vehicle.
    async fn raw_pings(
        &self,
        window: &TimeWindow,
        garage_no: Option<&str>,
    ) -> Result<Vec<RawPing>, StoreError>;

    async fn count_pings(&self, window: &TimeWindow) -> Result<i64, StoreError>;

    /// Earliest raw ping at or after `from` (or overall when `None`).
    async fn earliest_ping_at_or_after(
        &self,
        from: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn latest_ping_time(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Registry lookup: `vehicle_id → garage_no`.
    async fn garage_no_for(&self, vehicle_id: i32) -> Result<Option<String>, StoreError>;

    /// Registered vehicles with raw pings inside `window`, with row counts.
    async fn vehicles_in_window(
        &self,
        window: &TimeWindow,
    ) -> Result<Vec<VehicleToProcess>, StoreError>;

    /// Last non-outlier filtered fix for a vehicle strictly before `before`,
    /// no older than `lookback`.
    async fn last_accepted_before(
        &self,
        garage_no: &str,
        before: DateTime<Utc>,
        lookback: Duration,
    ) -> Result<Option<Fix>, StoreError>;

    /// Insert or overwrite filtered rows keyed by `(time, garage_no)`,
    /// atomically. Returns rows written.
    async fn upsert_filtered(&self, batch_id: i64, rows: &[FilteredPing]) -> Result<u64, StoreError>;

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}

/// Processing batch rows and their lock columns.
///
/// Mutating calls that take `owner` only touch a row whose `lock_owner`
/// still matches; they return `false` when the lock has been lost.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Store clock; lock freshness and backoff are measured against it.
    async fn server_time(&self) -> Result<DateTime<Utc>, StoreError>;

    /// Id of the row for `(window, vehicle_id)`, created `pending` if absent.
    async fn create_pending(
        &self,
        window: &TimeWindow,
        vehicle_id: Option<i32>,
    ) -> Result<i64, StoreError>;

    /// Atomically take the lock unless a fresh one is held by someone else.
    /// `None` means the lock is held.
    async fn try_lock(
        &self,
        batch_id: i64,
        owner: &str,
        stale_after: Duration,
    ) -> Result<Option<ProcessingBatch>, StoreError>;

    async fn heartbeat(&self, batch_id: i64, owner: &str) -> Result<bool, StoreError>;

    async fn complete(
        &self,
        batch_id: i64,
        owner: &str,
        rows_processed: i64,
        rows_filtered: i64,
        duration_seconds: f64,
    ) -> Result<bool, StoreError>;

    async fn fail(
        &self,
        batch_id: i64,
        owner: &str,
        error_message: &str,
        duration_seconds: f64,
    ) -> Result<bool, StoreError>;

    async fn get_batch(&self, batch_id: i64) -> Result<Option<ProcessingBatch>, StoreError>;

    /// Latest `window_end` over batches that are not `pending`.
    async fn high_water_mark(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Pending batches, oldest window first.
    async fn pending_batches(&self, limit: u32) -> Result<Vec<ProcessingBatch>, StoreError>;

    /// Vehicle ids with a completed batch for exactly `window`.
    async fn completed_vehicle_ids(&self, window: &TimeWindow) -> Result<Vec<i32>, StoreError>;

    /// `failed → pending` for rows below `max_retries` whose backoff elapsed.
    async fn retry_failed(&self, policy: &RetryPolicy) -> Result<u64, StoreError>;

    /// `processing → failed` for rows whose heartbeat is older than `stale_after`.
    async fn reclaim_stale(&self, stale_after: Duration) -> Result<u64, StoreError>;

    async fn summary(&self, max_retries: i32) -> Result<BatchSummary, StoreError>;

    /// Per-window totals for windows starting at or after `since`, newest first.
    async fn queue(&self, since: DateTime<Utc>) -> Result<Vec<QueueEntry>, StoreError>;

    /// Pending and processing batches, most recently started first.
    async fn active_batches(&self, limit: u32) -> Result<Vec<ProcessingBatch>, StoreError>;
}

/// Full store used by the pipeline.
pub trait Store: PingStore + BatchStore {}

impl<T: PingStore + BatchStore> Store for T {}

/// Backoff schedule for the retry manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: i32,
    pub base_delay: Duration,
    pub max_backoff_exponent: u32,
}

impl RetryPolicy {
    /// Delay before a row that has already been tried `attempt` extra times
    /// may run again: `base * 2^min(attempt, max_exp)`.
    pub fn backoff(&self, attempt: i32) -> Duration {
        let exp = u32::try_from(attempt.max(0))
            .unwrap_or(0)
            .min(self.max_backoff_exponent)
            .min(30);
        self.base_delay
            .checked_mul(1_i32 << exp)
            .unwrap_or(Duration::MAX)
    }

    /// Whether a failed row is eligible to be re-queued at `now`.
    pub fn is_due(&self, batch: &ProcessingBatch, now: DateTime<Utc>) -> bool {
        if batch.attempt >= self.max_retries {
            return false;
        }
        batch
            .finished_at
            .map_or(true, |finished| now - finished >= self.backoff(batch.attempt))
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::seconds(config.base_delay_secs),
            max_backoff_exponent: config.max_backoff_exponent,
        }
    }
}

/// Whole-table rollup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    /// Failed rows that reached the retry ceiling
    pub exhausted: i64,
    pub total_rows_processed: i64,
    pub total_rows_filtered: i64,
    /// Latest completed `window_end`
    pub last_processed_time: Option<DateTime<Utc>>,
    pub avg_duration_seconds: Option<f64>,
}

impl BatchSummary {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// Batches grouped by window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub window: TimeWindow,
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub rows_processed: i64,
}

/// Identity written into `lock_owner`: `host:pid:nonce`.
pub fn lock_owner_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("{}:{}:{}", host, std::process::id(), &nonce[..8])
}
