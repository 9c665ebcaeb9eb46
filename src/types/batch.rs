//! Batch and window types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("Window start {start} is not before end {end}")]
    Empty {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("Window step must be positive, got {0}")]
    NonPositiveStep(Duration),

    #[error("Timestamp out of range while aligning window")]
    OutOfRange,
}

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, WindowError> {
        if start >= end {
            return Err(WindowError::Empty { start, end });
        }
        Ok(Self { start, end })
    }

    /// The window of length `len` (aligned to the Unix epoch) that contains `t`.
    pub fn aligned(t: DateTime<Utc>, len: Duration) -> Result<Self, WindowError> {
        let len_ms = len.num_milliseconds();
        if len_ms <= 0 {
            return Err(WindowError::NonPositiveStep(len));
        }
        let ms = t.timestamp_millis();
        let floored = ms - ms.rem_euclid(len_ms);
        let start = DateTime::from_timestamp_millis(floored).ok_or(WindowError::OutOfRange)?;
        let end = start.checked_add_signed(len).ok_or(WindowError::OutOfRange)?;
        Ok(Self { start, end })
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Contiguous, non-overlapping sub-windows of `step`; the last one is
    /// clipped to `end`.
    pub fn split(&self, step: Duration) -> Result<Vec<Self>, WindowError> {
        if step <= Duration::zero() {
            return Err(WindowError::NonPositiveStep(step));
        }
        let mut windows = Vec::new();
        let mut cursor = self.start;
        while cursor < self.end {
            let next = cursor
                .checked_add_signed(step)
                .map_or(self.end, |t| t.min(self.end));
            windows.push(Self {
                start: cursor,
                end: next,
            });
            cursor = next;
        }
        Ok(windows)
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.format("%Y-%m-%d %H:%M:%S"),
            self.end.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

/// Batch lifecycle state.
///
/// `pending → processing → {completed | failed}`; `failed → pending` only
/// through the retry manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub const ALL: [Self; 4] = [Self::Pending, Self::Processing, Self::Completed, Self::Failed];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution unit: a window, optionally narrowed to a single vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingBatch {
    pub id: i64,
    pub window: TimeWindow,
    /// `None` means all vehicles
    pub vehicle_id: Option<i32>,
    pub status: BatchStatus,
    pub rows_processed: i64,
    /// Outliers found
    pub rows_filtered: i64,
    pub error_message: Option<String>,
    pub lock_owner: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub attempt: i32,
    pub duration_seconds: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ProcessingBatch {
    /// Whether the lock on this batch is held by a live worker at `now`.
    pub fn lock_is_fresh(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.status == BatchStatus::Processing
            && self
                .heartbeat_at
                .is_some_and(|hb| now.signed_duration_since(hb) < stale_after)
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.heartbeat_at.map(|hb| now.signed_duration_since(hb))
    }

    pub fn scope_label(&self) -> String {
        scope_label(self.vehicle_id)
    }
}

/// Human-readable scope: a vehicle id or `ALL`.
pub fn scope_label(vehicle_id: Option<i32>) -> String {
    vehicle_id.map_or_else(|| "ALL".to_string(), |id| id.to_string())
}

/// Outcome of one executor run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: i64,
    pub vehicle_id: Option<i32>,
    pub window: TimeWindow,
    pub status: BatchStatus,
    pub rows_processed: i64,
    pub rows_filtered: i64,
    pub duration_seconds: f64,
    pub error_message: Option<String>,
}

impl BatchResult {
    pub fn is_success(&self) -> bool {
        self.status == BatchStatus::Completed
    }
}
