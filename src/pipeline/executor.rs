//! Batch Executor
//!
//! Runs one batch end to end: ensure the row, take the lock, keep it alive,
//! filter every vehicle in scope, write the results in one transaction and
//! record the outcome on the row.

use std::sync::Arc;
use std::time::Instant;

use chrono::Duration;
use tracing::{debug, info, warn};

use super::heartbeat::Heartbeat;
use crate::config::{FilterConfig, LockingConfig};
use crate::filter::geo::is_valid_position;
use crate::filter::{FilterError, PlausibilityFilter};
use crate::storage::{Store, StoreError};
use crate::types::{scope_label, BatchResult, BatchStatus, FilteredPing, RawPing, TimeWindow};

/// Errors that end an executor call without a terminal batch status.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    /// Another live worker holds the lock; skip, not a failure
    #[error("batch {batch_id} is locked by another worker")]
    LockHeld { batch_id: i64 },

    #[error("lock on batch {batch_id} was lost while processing")]
    LockLost { batch_id: i64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure inside a locked batch; persisted on the row.
#[derive(Debug, thiserror::Error)]
enum BatchFailure {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("row count out of range: {0}")]
    RowCount(#[from] std::num::TryFromIntError),
}

#[derive(Debug, Clone, Copy, Default)]
struct Counts {
    rows_processed: i64,
    rows_filtered: i64,
}

pub struct BatchExecutor {
    store: Arc<dyn Store>,
    filter: PlausibilityFilter,
    locking: LockingConfig,
    seed_lookback: Duration,
    owner: String,
}

impl BatchExecutor {
    pub fn new(
        store: Arc<dyn Store>,
        filter_config: FilterConfig,
        locking: LockingConfig,
        owner: String,
    ) -> Self {
        let seed_lookback = filter_config.seed_lookback();
        Self {
            store,
            filter: PlausibilityFilter::new(filter_config),
            locking,
            seed_lookback,
            owner,
        }
    }

    /// Lock identity written by this executor
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Process `window` for one vehicle, or all vehicles when `vehicle_id`
    /// is `None`.
    ///
    /// Filtering or write failures come back as `Ok` with status `failed`;
    /// they are already recorded on the batch row.
    pub async fn execute(
        &self,
        window: TimeWindow,
        vehicle_id: Option<i32>,
    ) -> Result<BatchResult, ExecuteError> {
        let scope = scope_label(vehicle_id);
        let batch_id = self.store.create_pending(&window, vehicle_id).await?;

        let Some(batch) = self
            .store
            .try_lock(batch_id, &self.owner, self.locking.stale_after())
            .await?
        else {
            debug!(batch_id, scope = %scope, window = %window, "[Executor] lock held elsewhere, skipping");
            return Err(ExecuteError::LockHeld { batch_id });
        };

        debug!(
            batch_id,
            scope = %scope,
            window = %window,
            attempt = batch.attempt,
            "[Executor] lock acquired"
        );

        let heartbeat = Heartbeat::spawn(
            Arc::clone(&self.store),
            batch_id,
            self.owner.clone(),
            self.locking.heartbeat_interval(),
        );
        let started = Instant::now();
        let outcome = self.process(batch_id, &window, vehicle_id).await;
        let lost = heartbeat.stop().await;
        let duration_seconds = started.elapsed().as_secs_f64();

        if lost {
            warn!(batch_id, scope = %scope, "[Executor] heartbeat saw the lock taken over");
        }

        match outcome {
            Ok(counts) => {
                let recorded = self
                    .store
                    .complete(
                        batch_id,
                        &self.owner,
                        counts.rows_processed,
                        counts.rows_filtered,
                        duration_seconds,
                    )
                    .await?;
                if !recorded {
                    return Err(ExecuteError::LockLost { batch_id });
                }

                info!(
                    batch_id,
                    scope = %scope,
                    window = %window,
                    rows = counts.rows_processed,
                    outliers = counts.rows_filtered,
                    duration_secs = duration_seconds,
                    "[Executor] batch completed"
                );

                Ok(BatchResult {
                    batch_id,
                    vehicle_id,
                    window,
                    status: BatchStatus::Completed,
                    rows_processed: counts.rows_processed,
                    rows_filtered: counts.rows_filtered,
                    duration_seconds,
                    error_message: None,
                })
            }
            Err(failure) => {
                let message = failure.to_string();
                let recorded = self
                    .store
                    .fail(batch_id, &self.owner, &message, duration_seconds)
                    .await?;
                if !recorded {
                    return Err(ExecuteError::LockLost { batch_id });
                }

                warn!(
                    batch_id,
                    scope = %scope,
                    window = %window,
                    error = %message,
                    "[Executor] batch failed"
                );

                Ok(BatchResult {
                    batch_id,
                    vehicle_id,
                    window,
                    status: BatchStatus::Failed,
                    rows_processed: 0,
                    rows_filtered: 0,
                    duration_seconds,
                    error_message: Some(message),
                })
            }
        }
    }

    async fn process(
        &self,
        batch_id: i64,
        window: &TimeWindow,
        vehicle_id: Option<i32>,
    ) -> Result<Counts, BatchFailure> {
        let pings = match vehicle_id {
            Some(id) => {
                let garage_no = self
                    .store
                    .garage_no_for(id)
                    .await?
                    .ok_or(StoreError::UnknownVehicle(id))?;
                self.store.raw_pings(window, Some(&garage_no)).await?
            }
            None => self.store.raw_pings(window, None).await?,
        };

        let mut rows: Vec<FilteredPing> = Vec::with_capacity(pings.len());
        let mut counts = Counts::default();

        for group in by_vehicle(&pings) {
            let group = collapse_duplicates(group);
            let garage_no = &group[0].garage_no;
            let seed = self
                .store
                .last_accepted_before(garage_no, window.start, self.seed_lookback)
                .await?;
            let outcome = self.filter.run(&group, seed, vehicle_id)?;
            counts.rows_processed += i64::try_from(group.len())?;
            counts.rows_filtered += outcome.outliers;
            rows.extend(outcome.pings);
        }

        if pings.len() > rows.len() {
            debug!(
                batch_id,
                duplicates = pings.len() - rows.len(),
                "[Executor] collapsed duplicate raw rows"
            );
        }

        if !rows.is_empty() {
            let written = self.store.upsert_filtered(batch_id, &rows).await?;
            debug!(batch_id, written, "[Executor] filtered rows upserted");
        }

        Ok(counts)
    }
}

/// Split pings (ordered by garage number, then time) into per-vehicle runs.
fn by_vehicle(pings: &[RawPing]) -> impl Iterator<Item = &[RawPing]> {
    pings.chunk_by(|a, b| a.garage_no == b.garage_no)
}

/// One ping per timestamp for a single time-ordered vehicle run. The output
/// key is `(time, garage_no)`, so of several copies the first one with a
/// valid position wins, falling back to the first copy.
fn collapse_duplicates(group: &[RawPing]) -> Vec<RawPing> {
    let mut out: Vec<RawPing> = Vec::with_capacity(group.len());
    for ping in group {
        match out.last_mut() {
            Some(kept) if kept.time == ping.time => {
                if !is_valid_position(kept.lat, kept.lng) && is_valid_position(ping.lat, ping.lng) {
                    *kept = ping.clone();
                }
            }
            _ => out.push(ping.clone()),
        }
    }
    out
}
