//! Parallel Coordinator
//!
//! Fans one window out to per-vehicle batches in groups of `max_parallel`.
//! A group is awaited as a whole before the next one starts, so database
//! load stays bounded at `max_parallel` executors. Each vehicle's outcome is
//! recorded independently; a failing vehicle never cancels its siblings.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::discovery::VehicleDiscovery;
use super::executor::{BatchExecutor, ExecuteError};
use super::PipelineError;
use crate::types::{BatchResult, BatchStatus, TimeWindow};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed(BatchResult),
    Failed(BatchResult),
    /// Lock held by another worker
    Skipped { batch_id: i64 },
    Error { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct VehicleOutcome {
    pub vehicle_id: i32,
    pub outcome: RunOutcome,
}

/// Result of one parallel window run.
#[derive(Debug, Clone, Serialize)]
pub struct ParallelRun {
    pub window: TimeWindow,
    /// Registered vehicles with pings in the window, including completed
    /// ones. Zero means the window only holds unregistered garages.
    pub registered_vehicles: usize,
    /// Groups dispatched
    pub groups: usize,
    pub outcomes: Vec<VehicleOutcome>,
    /// Stopped early by cancellation
    pub cancelled: bool,
}

impl ParallelRun {
    fn count(&self, pred: impl Fn(&RunOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.outcome)).count()
    }

    pub fn completed(&self) -> usize {
        self.count(|o| matches!(o, RunOutcome::Completed(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, RunOutcome::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, RunOutcome::Skipped { .. }))
    }

    pub fn errors(&self) -> usize {
        self.count(|o| matches!(o, RunOutcome::Error { .. }))
    }

    pub fn rows_processed(&self) -> i64 {
        self.results().map(|r| r.rows_processed).sum()
    }

    pub fn rows_filtered(&self) -> i64 {
        self.results().map(|r| r.rows_filtered).sum()
    }

    fn results(&self) -> impl Iterator<Item = &BatchResult> {
        self.outcomes.iter().filter_map(|o| match &o.outcome {
            RunOutcome::Completed(r) | RunOutcome::Failed(r) => Some(r),
            _ => None,
        })
    }
}

impl From<Result<BatchResult, ExecuteError>> for RunOutcome {
    fn from(result: Result<BatchResult, ExecuteError>) -> Self {
        match result {
            Ok(r) if r.status == BatchStatus::Completed => Self::Completed(r),
            Ok(r) => Self::Failed(r),
            Err(ExecuteError::LockHeld { batch_id }) => Self::Skipped { batch_id },
            Err(e) => Self::Error {
                message: e.to_string(),
            },
        }
    }
}

pub struct ParallelCoordinator {
    executor: Arc<BatchExecutor>,
    discovery: VehicleDiscovery,
    max_vehicles_per_window: u32,
}

impl ParallelCoordinator {
    pub fn new(
        executor: Arc<BatchExecutor>,
        discovery: VehicleDiscovery,
        max_vehicles_per_window: u32,
    ) -> Self {
        Self {
            executor,
            discovery,
            max_vehicles_per_window,
        }
    }

    /// Run `window` per vehicle. Without explicit ids, discovery supplies
    /// them. Cancellation is checked between groups only.
    pub async fn run_window_parallel(
        &self,
        window: TimeWindow,
        vehicle_ids: Option<Vec<i32>>,
        max_parallel: usize,
        cancel: &CancellationToken,
    ) -> Result<ParallelRun, PipelineError> {
        let (ids, registered_vehicles) = match vehicle_ids {
            Some(ids) => {
                let n = ids.len();
                (ids, n)
            }
            None => {
                let found = self
                    .discovery
                    .vehicles_to_process(&window, self.max_vehicles_per_window)
                    .await?;
                let ids = found.vehicles.into_iter().map(|v| v.vehicle_id).collect();
                (ids, found.registered_in_window)
            }
        };

        let group_size = max_parallel.max(1);
        let mut run = ParallelRun {
            window,
            registered_vehicles,
            groups: 0,
            outcomes: Vec::with_capacity(ids.len()),
            cancelled: false,
        };

        info!(
            window = %window,
            vehicles = ids.len(),
            max_parallel = group_size,
            "[Coordinator] starting parallel window"
        );

        for group in ids.chunks(group_size) {
            if cancel.is_cancelled() {
                warn!(
                    window = %window,
                    remaining = ids.len() - run.outcomes.len(),
                    "[Coordinator] cancelled, not dispatching further groups"
                );
                run.cancelled = true;
                break;
            }

            run.groups += 1;
            let results = join_all(group.iter().map(|&vehicle_id| {
                let executor = Arc::clone(&self.executor);
                async move {
                    let result = executor.execute(window, Some(vehicle_id)).await;
                    VehicleOutcome {
                        vehicle_id,
                        outcome: RunOutcome::from(result),
                    }
                }
            }))
            .await;
            run.outcomes.extend(results);
        }

        info!(
            window = %window,
            groups = run.groups,
            completed = run.completed(),
            failed = run.failed(),
            skipped = run.skipped(),
            errors = run.errors(),
            "[Coordinator] parallel window finished"
        );
        Ok(run)
    }
}
