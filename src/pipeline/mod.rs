//! Processing Pipeline
//!
//! ```text
//! Scheduler ──► next closed window past the high-water mark
//!     │
//!     ├─ all-vehicles mode ──► Executor(window, ALL)
//!     └─ parallel mode ──► Discovery ──► Coordinator
//!                                         groups of max_parallel
//!                                         Executor(window, vehicle) × N
//! Retry ──► reclaim stale locks, failed → pending (bounded, backoff)
//! ```
//!
//! Every component takes its store as `Arc<dyn Store>`; `Pipeline` wires
//! them together and exposes the operating modes.

mod coordinator;
mod discovery;
mod executor;
mod heartbeat;
mod modes;
mod retry;
mod scheduler;

pub use coordinator::{ParallelCoordinator, ParallelRun, RunOutcome, VehicleOutcome};
pub use discovery::{Discovered, VehicleDiscovery};
pub use executor::{BatchExecutor, ExecuteError};
pub use heartbeat::Heartbeat;
pub use modes::{BackfillSummary, PassSummary, Pipeline};
pub use retry::{RetryManager, RetryReport};
pub use scheduler::{ScheduledWindow, WindowScheduler};

use crate::storage::StoreError;
use crate::types::WindowError;

/// Errors that abort a pipeline operation (as opposed to a single batch).
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Window(#[from] WindowError),
}
