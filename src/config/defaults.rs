//! System-wide default constants.
//!
//! Grouped by subsystem; every `*Config::default()` reads from here.

// ============================================================================
// Database
// ============================================================================

/// Pool size. Also the practical ceiling on per-vehicle parallelism.
pub const DB_MAX_CONNECTIONS: u32 = 10;

/// How long to wait for a pooled connection (seconds).
pub const DB_ACQUIRE_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// Plausibility Filter
// ============================================================================

/// Implied speed above which a jump is physically implausible (km/h).
///
/// City buses top out well below 100 km/h; the margin absorbs GPS jitter
/// over one-second reporting intervals.
pub const MAX_IMPLIED_SPEED_KMH: f64 = 150.0;

/// Speed-divergence check applies only when consecutive fixes are this
/// close in time (seconds). Longer gaps average out instantaneous speed.
pub const DIVERGENCE_MAX_GAP_SECS: f64 = 30.0;

/// How far back to look for the last accepted fix that seeds a window (minutes).
pub const SEED_LOOKBACK_MINUTES: i64 = 60;

// ============================================================================
// Scheduler
// ============================================================================

/// Window length (minutes). 60 = hourly batches.
pub const WINDOW_MINUTES: i64 = 60;

/// Windows processed per continuous pass before exiting.
pub const MAX_WINDOWS_PER_RUN: u32 = 10;

/// A window is only scheduled once its end is this far in the past (seconds),
/// giving late pings time to land.
pub const SETTLE_DELAY_SECS: i64 = 120;

/// Upper bound on vehicles fanned out for one window.
pub const MAX_VEHICLES_PER_WINDOW: u32 = 1_000;

/// Default group size for parallel modes.
pub const DEFAULT_MAX_PARALLEL: usize = 5;

// ============================================================================
// Locking
// ============================================================================

/// Heartbeat renewal period while a batch is processing (seconds).
pub const HEARTBEAT_INTERVAL_SECS: u64 = 15;

/// Heartbeat age that turns the health signal to WARNING (seconds).
pub const HEARTBEAT_WARNING_AFTER_SECS: i64 = 60;

/// Heartbeat age after which a lock may be reclaimed (seconds).
pub const HEARTBEAT_STALE_AFTER_SECS: i64 = 300;

// ============================================================================
// Retry
// ============================================================================

/// Attempt ceiling for failed batches.
pub const MAX_RETRIES: i32 = 3;

/// Base delay before a failed batch becomes eligible again (seconds).
///
/// `eligible_after = finished_at + RETRY_BASE_DELAY_SECS * 2^min(attempt, RETRY_MAX_BACKOFF_EXPONENT)`
pub const RETRY_BASE_DELAY_SECS: i64 = 60;

/// Maximum backoff multiplier exponent. `2^6 = 64×` base delay.
pub const RETRY_MAX_BACKOFF_EXPONENT: u32 = 6;

// ============================================================================
// Cron
// ============================================================================

/// Re-invocation period for cron modes (seconds). 900 = 15 minutes.
pub const CRON_INTERVAL_SECS: u64 = 900;

/// How long an interrupted process waits for in-flight batches (seconds).
pub const SHUTDOWN_GRACE_SECS: u64 = 30;

// ============================================================================
// Backfill
// ============================================================================

/// Window length for backfill when none is given (hours).
pub const BACKFILL_HOURS_PER_BATCH: i64 = 1;

/// Range covered by backfill when no start is given (hours before now).
pub const BACKFILL_DEFAULT_LOOKBACK_HOURS: i64 = 24;

/// Pause between backfill batches to keep load off the store (milliseconds).
pub const BACKFILL_PAUSE_MS: u64 = 1_000;

// ============================================================================
// Status
// ============================================================================

/// Window of history shown by the processing queue view (hours).
pub const STATUS_QUEUE_HOURS: i64 = 24;

/// Rows shown by the active batch view.
pub const STATUS_ACTIVE_LIMIT: u32 = 10;

/// Processing lag (in windows) that degrades the lag health check.
pub const LAG_WARNING_WINDOWS: i64 = 2;

/// Processing lag (in windows) that fails the lag health check.
pub const LAG_CRITICAL_WINDOWS: i64 = 6;
