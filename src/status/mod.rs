//! Status Reporter
//!
//! Read-only view of the batch table for operators: rollup, per-window
//! queue, active batches with heartbeat freshness, and health checks with
//! recommendations.

mod health;

pub use health::{overall, HealthCheck, HealthStatus, HeartbeatHealth};

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::ProcessorConfig;
use crate::storage::{BatchSummary, QueueEntry, Store, StoreError};
use crate::types::{BatchStatus, ProcessingBatch};

/// A pending or processing batch with lock freshness.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveBatch {
    #[serde(flatten)]
    pub batch: ProcessingBatch,
    pub heartbeat_age_secs: Option<i64>,
    pub heartbeat_health: HeartbeatHealth,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub summary: BatchSummary,
    pub queue: Vec<QueueEntry>,
    pub active: Vec<ActiveBatch>,
    pub health: Vec<HealthCheck>,
    pub overall: HealthStatus,
}

pub struct StatusReporter {
    store: Arc<dyn Store>,
    config: ProcessorConfig,
}

/// Heartbeat freshness: `OK` under `warning_after`, `WARNING` under
/// `stale_after`, otherwise `STALE`. Pending rows hold no lock and are `OK`.
pub fn heartbeat_health(
    batch: &ProcessingBatch,
    now: DateTime<Utc>,
    warning_after: Duration,
    stale_after: Duration,
) -> HeartbeatHealth {
    if batch.status != BatchStatus::Processing {
        return HeartbeatHealth::Ok;
    }
    match batch.heartbeat_age(now) {
        Some(age) if age < warning_after => HeartbeatHealth::Ok,
        Some(age) if age < stale_after => HeartbeatHealth::Warning,
        _ => HeartbeatHealth::Stale,
    }
}

impl StatusReporter {
    pub fn new(store: Arc<dyn Store>, config: ProcessorConfig) -> Self {
        Self { store, config }
    }

    pub async fn summary(&self) -> Result<BatchSummary, StoreError> {
        self.store.summary(self.config.retry.max_retries).await
    }

    /// Windows started within the last `hours` (default `status.queue_hours`).
    pub async fn queue(&self, hours: Option<i64>) -> Result<Vec<QueueEntry>, StoreError> {
        let hours = hours.unwrap_or(self.config.status.queue_hours);
        let now = self.store.server_time().await?;
        self.store.queue(now - Duration::hours(hours)).await
    }

    pub async fn active(&self, limit: Option<u32>) -> Result<Vec<ActiveBatch>, StoreError> {
        let limit = limit.unwrap_or(self.config.status.active_limit);
        let now = self.store.server_time().await?;
        let warning_after = self.config.locking.warning_after();
        let stale_after = self.config.locking.stale_after();

        Ok(self
            .store
            .active_batches(limit)
            .await?
            .into_iter()
            .map(|batch| ActiveBatch {
                heartbeat_age_secs: batch.heartbeat_age(now).map(|a| a.num_seconds()),
                heartbeat_health: heartbeat_health(&batch, now, warning_after, stale_after),
                batch,
            })
            .collect())
    }

    pub async fn health_checks(&self) -> Result<Vec<HealthCheck>, StoreError> {
        let summary = self.summary().await?;
        let latest_ping = self.store.latest_ping_time().await?;
        let active = self.active(None).await?;
        Ok(self.evaluate(&summary, latest_ping, &active))
    }

    fn evaluate(
        &self,
        summary: &BatchSummary,
        latest_ping: Option<DateTime<Utc>>,
        active: &[ActiveBatch],
    ) -> Vec<HealthCheck> {
        let status = &self.config.status;
        let window_len = self.config.scheduler.window_len();
        let mut checks = Vec::with_capacity(4);

        checks.push(match (latest_ping, summary.last_processed_time) {
            (None, _) => HealthCheck::healthy("processing_lag"),
            (Some(_), None) => HealthCheck::degraded(
                "processing_lag",
                "raw data present but nothing processed yet".to_string(),
                "run `continuous` or `backfill` to start processing",
            ),
            (Some(latest), Some(processed)) => {
                let lag = latest - processed;
                let lag_windows = lag.num_seconds() / window_len.num_seconds().max(1);
                let reason = format!(
                    "processed data lags raw data by {} minutes ({} windows)",
                    lag.num_minutes(),
                    lag_windows
                );
                if lag_windows >= status.lag_critical_windows {
                    HealthCheck::unhealthy(
                        "processing_lag",
                        reason,
                        "check that cron is running; consider `parallel` with more workers",
                    )
                } else if lag_windows >= status.lag_warning_windows {
                    HealthCheck::degraded(
                        "processing_lag",
                        reason,
                        "processing is falling behind; watch the next cron runs",
                    )
                } else {
                    HealthCheck::healthy("processing_lag")
                }
            }
        });

        checks.push(if summary.exhausted > 0 {
            HealthCheck::unhealthy(
                "failed_batches",
                format!("{} batches exhausted their retries", summary.exhausted),
                "inspect error_message on failed batches, fix the cause, then re-run with `backfill`",
            )
        } else if summary.failed > 0 {
            HealthCheck::degraded(
                "failed_batches",
                format!("{} failed batches awaiting retry", summary.failed),
                "run `retry` or let cron pick them up",
            )
        } else {
            HealthCheck::healthy("failed_batches")
        });

        let stale = active
            .iter()
            .filter(|a| a.heartbeat_health == HeartbeatHealth::Stale)
            .count();
        checks.push(if stale > 0 {
            HealthCheck::degraded(
                "stale_locks",
                format!("{stale} processing batches have stale heartbeats"),
                "run `retry` to reclaim them",
            )
        } else {
            HealthCheck::healthy("stale_locks")
        });

        let backlog_limit = i64::from(self.config.scheduler.max_windows_per_run);
        checks.push(if summary.pending > backlog_limit {
            HealthCheck::degraded(
                "pending_backlog",
                format!("{} pending batches", summary.pending),
                "pending work exceeds one pass; run `continuous` until drained",
            )
        } else {
            HealthCheck::healthy("pending_backlog")
        });

        checks
    }

    /// Everything at once, for `status --json` and the text report. The
    /// per-window queue is only loaded when `with_queue` is set.
    pub async fn report(&self, with_queue: bool) -> Result<StatusReport, StoreError> {
        let generated_at = self.store.server_time().await?;
        let summary = self.summary().await?;
        let queue = if with_queue {
            self.queue(None).await?
        } else {
            Vec::new()
        };
        let active = self.active(None).await?;
        let latest_ping = self.store.latest_ping_time().await?;
        let health = self.evaluate(&summary, latest_ping, &active);
        let overall = overall(&health);

        Ok(StatusReport {
            generated_at,
            summary,
            queue,
            active,
            health,
            overall,
        })
    }
}

fn fmt_time(t: Option<DateTime<Utc>>) -> String {
    t.map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}

impl std::fmt::Display for StatusReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = &self.summary;
        writeln!(f, "GPS refinery status @ {}", fmt_time(Some(self.generated_at)))?;
        writeln!(f)?;
        writeln!(f, "Batches: {} total", s.total())?;
        writeln!(
            f,
            "  pending {:>6}  processing {:>4}  completed {:>8}  failed {:>5} (exhausted {})",
            s.pending, s.processing, s.completed, s.failed, s.exhausted
        )?;
        writeln!(
            f,
            "Rows: {} processed, {} outliers",
            s.total_rows_processed, s.total_rows_filtered
        )?;
        writeln!(f, "Last processed window end: {}", fmt_time(s.last_processed_time))?;
        if let Some(avg) = s.avg_duration_seconds {
            writeln!(f, "Average batch duration: {avg:.2}s")?;
        }

        if !self.queue.is_empty() {
            writeln!(f)?;
            writeln!(f, "Queue:")?;
            writeln!(
                f,
                "  {:<19}  {:<19}  {:>5}  {:>4}  {:>4}  {:>4}  {:>4}  {:>10}",
                "window start", "window end", "total", "pend", "proc", "done", "fail", "rows"
            )?;
            for q in &self.queue {
                writeln!(
                    f,
                    "  {:<19}  {:<19}  {:>5}  {:>4}  {:>4}  {:>4}  {:>4}  {:>10}",
                    fmt_time(Some(q.window.start)),
                    fmt_time(Some(q.window.end)),
                    q.total,
                    q.pending,
                    q.processing,
                    q.completed,
                    q.failed,
                    q.rows_processed
                )?;
            }
        }

        if !self.active.is_empty() {
            writeln!(f)?;
            writeln!(f, "Active:")?;
            for a in &self.active {
                let age = a
                    .heartbeat_age_secs
                    .map_or_else(|| "-".to_string(), |secs| format!("{secs}s"));
                writeln!(
                    f,
                    "  #{:<8} {:<6} {} {:<10} heartbeat {:>6} {}",
                    a.batch.id,
                    a.batch.scope_label(),
                    a.batch.window,
                    a.batch.status,
                    age,
                    a.heartbeat_health
                )?;
            }
        }

        writeln!(f)?;
        writeln!(f, "Health: {}", self.overall)?;
        for check in &self.health {
            match &check.recommendation {
                Some(rec) => writeln!(f, "  [{}] {} -> {rec}", check.name, check.status)?,
                None => writeln!(f, "  [{}] {}", check.name, check.status)?,
            }
        }
        Ok(())
    }
}
