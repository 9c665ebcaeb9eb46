//! Operating modes
//!
//! `Pipeline` owns one instance of every component and drives them for the
//! CLI modes: a one-shot continuous pass (all-vehicles or parallel), the
//! cron loop around that pass, backfill over an explicit range, and a
//! retry sweep.

use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::coordinator::{ParallelCoordinator, ParallelRun};
use super::discovery::VehicleDiscovery;
use super::executor::{BatchExecutor, ExecuteError};
use super::retry::{RetryManager, RetryReport};
use super::scheduler::WindowScheduler;
use super::PipelineError;
use crate::config::ProcessorConfig;
use crate::storage::{lock_owner_id, RetryPolicy, Store};
use crate::types::{BatchResult, BatchStatus, TimeWindow};

// ============================================================================
// Summaries
// ============================================================================

/// Totals for one continuous pass (or one backfill).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    /// Pending batches re-run before new windows
    pub requeued_run: usize,
    /// New windows processed
    pub windows: usize,
    pub completed: usize,
    pub failed: usize,
    /// Lock held elsewhere
    pub skipped: usize,
    pub errors: usize,
    pub rows_processed: i64,
    pub rows_filtered: i64,
    pub cancelled: bool,
}

impl PassSummary {
    fn record(&mut self, result: Result<BatchResult, ExecuteError>) {
        match result {
            Ok(r) => {
                if r.status == BatchStatus::Completed {
                    self.completed += 1;
                } else {
                    self.failed += 1;
                }
                self.rows_processed += r.rows_processed;
                self.rows_filtered += r.rows_filtered;
            }
            Err(ExecuteError::LockHeld { .. }) => self.skipped += 1,
            Err(e) => {
                warn!(error = %e, "[Pipeline] batch aborted");
                self.errors += 1;
            }
        }
    }

    fn record_parallel(&mut self, run: &ParallelRun) {
        self.completed += run.completed();
        self.failed += run.failed();
        self.skipped += run.skipped();
        self.errors += run.errors();
        self.rows_processed += run.rows_processed();
        self.rows_filtered += run.rows_filtered();
        self.cancelled |= run.cancelled;
    }

    fn absorb(&mut self, other: &Self) {
        self.requeued_run += other.requeued_run;
        self.windows += other.windows;
        self.completed += other.completed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.errors += other.errors;
        self.rows_processed += other.rows_processed;
        self.rows_filtered += other.rows_filtered;
        self.cancelled |= other.cancelled;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillSummary {
    pub range: TimeWindow,
    pub windows_planned: usize,
    #[serde(flatten)]
    pub totals: PassSummary,
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct Pipeline {
    config: ProcessorConfig,
    executor: Arc<BatchExecutor>,
    scheduler: WindowScheduler,
    coordinator: ParallelCoordinator,
    retry: RetryManager,
}

impl Pipeline {
    /// Wire all components onto one store with a fresh lock identity.
    pub fn new(store: Arc<dyn Store>, config: ProcessorConfig) -> Self {
        Self::with_owner(store, config, lock_owner_id())
    }

    pub fn with_owner(store: Arc<dyn Store>, config: ProcessorConfig, owner: String) -> Self {
        let executor = Arc::new(BatchExecutor::new(
            Arc::clone(&store),
            config.filter.clone(),
            config.locking.clone(),
            owner,
        ));
        let scheduler = WindowScheduler::new(Arc::clone(&store), &config.scheduler);
        let coordinator = ParallelCoordinator::new(
            Arc::clone(&executor),
            VehicleDiscovery::new(Arc::clone(&store)),
            config.scheduler.max_vehicles_per_window,
        );
        let retry = RetryManager::new(
            store,
            RetryPolicy::from(&config.retry),
            config.locking.stale_after(),
        );

        Self {
            config,
            executor,
            scheduler,
            coordinator,
            retry,
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn owner(&self) -> &str {
        self.executor.owner()
    }

    /// One window, all vehicles or fanned out per vehicle.
    ///
    /// In parallel mode a window holding pings from no registered vehicle at
    /// all falls back to a single all-vehicles batch, so those pings still
    /// get filtered. A window whose registered vehicles are all completed
    /// already is left alone.
    async fn run_window(
        &self,
        window: TimeWindow,
        parallel: Option<usize>,
        cancel: &CancellationToken,
        summary: &mut PassSummary,
    ) -> Result<(), PipelineError> {
        match parallel {
            None => summary.record(self.executor.execute(window, None).await),
            Some(max_parallel) => {
                let run = self
                    .coordinator
                    .run_window_parallel(window, None, max_parallel, cancel)
                    .await?;
                if run.registered_vehicles == 0 && !run.cancelled {
                    debug!(window = %window, "[Pipeline] no registered vehicles, running all-vehicles batch");
                    summary.record(self.executor.execute(window, None).await);
                } else {
                    summary.record_parallel(&run);
                }
            }
        }
        Ok(())
    }

    /// Drain re-queued batches, then process up to `max_windows_per_run`
    /// new windows. `parallel` is the per-window fan-out, `None` for
    /// all-vehicles batches.
    pub async fn run_continuous_pass(
        &self,
        parallel: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<PassSummary, PipelineError> {
        let max_windows = self.config.scheduler.max_windows_per_run;
        let mut summary = PassSummary::default();

        for batch in self.scheduler.requeued(max_windows).await? {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                return Ok(summary);
            }
            info!(
                batch_id = batch.id,
                scope = %batch.scope_label(),
                window = %batch.window,
                attempt = batch.attempt,
                "[Pipeline] re-running re-queued batch"
            );
            summary.requeued_run += 1;
            summary.record(self.executor.execute(batch.window, batch.vehicle_id).await);
        }

        let mut previous: Option<TimeWindow> = None;
        for _ in 0..max_windows {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let Some(next) = self.scheduler.next_window().await? else {
                debug!("[Pipeline] caught up");
                break;
            };
            if previous.is_some_and(|p| next.window.start < p.end) {
                warn!(window = %next.window, "[Pipeline] high-water mark did not advance, stopping pass");
                break;
            }

            info!(
                window = %next.window,
                estimated_rows = next.estimated_rows,
                "[Pipeline] processing window"
            );
            self.run_window(next.window, parallel, cancel, &mut summary).await?;
            summary.windows += 1;
            previous = Some(next.window);
        }

        info!(
            windows = summary.windows,
            requeued = summary.requeued_run,
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            rows = summary.rows_processed,
            outliers = summary.rows_filtered,
            "[Pipeline] pass finished"
        );
        Ok(summary)
    }

    /// Repeat retry sweep + continuous pass every `cron.interval_secs`
    /// until `cancel` fires. Pass errors are logged and the loop continues.
    pub async fn run_cron(
        &self,
        parallel: Option<usize>,
        cancel: &CancellationToken,
    ) -> PassSummary {
        let mut ticker =
            tokio::time::interval(self.config.cron.interval().max(std::time::Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut totals = PassSummary::default();
        let mut passes = 0_u64;

        info!(
            interval_secs = self.config.cron.interval_secs,
            parallel = ?parallel,
            "[Cron] started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(passes, "[Cron] shutdown signal received");
                    break;
                }
                _ = ticker.tick() => {}
            }

            passes += 1;
            if let Err(e) = self.retry.run(None).await {
                warn!(error = %e, "[Cron] retry sweep failed");
            }
            match self.run_continuous_pass(parallel, cancel).await {
                Ok(summary) => totals.absorb(&summary),
                Err(e) => warn!(error = %e, pass = passes, "[Cron] pass failed"),
            }
        }

        totals
    }

    /// Process `range` in consecutive windows of `step`, pausing
    /// `backfill.pause_ms` between windows.
    pub async fn run_backfill(
        &self,
        range: TimeWindow,
        step: Duration,
        parallel: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<BackfillSummary, PipelineError> {
        let windows = range.split(step)?;
        let pause = std::time::Duration::from_millis(self.config.backfill.pause_ms);
        let mut totals = PassSummary::default();

        info!(
            range = %range,
            windows = windows.len(),
            step_hours = step.num_hours(),
            "[Backfill] starting"
        );

        for (i, window) in windows.iter().enumerate() {
            if cancel.is_cancelled() {
                totals.cancelled = true;
                break;
            }
            if i > 0 && !pause.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        totals.cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(pause) => {}
                }
            }

            info!(window = %window, n = i + 1, of = windows.len(), "[Backfill] window");
            self.run_window(*window, parallel, cancel, &mut totals).await?;
            totals.windows += 1;
        }

        Ok(BackfillSummary {
            range,
            windows_planned: windows.len(),
            totals,
        })
    }

    /// Reclaim stale locks and re-queue failed batches once.
    pub async fn run_retry(&self, max_retries: Option<i32>) -> Result<RetryReport, PipelineError> {
        Ok(self.retry.run(max_retries).await?)
    }
}
