//! Window Scheduler
//!
//! Picks the next closed window past the high-water mark. Windows are
//! aligned to `window_minutes` from the Unix epoch, except that a window
//! never starts before the mark, so a run after a differently-sized
//! backfill resumes exactly where the backfill stopped.

use std::sync::Arc;

use chrono::Duration;
use tracing::debug;

use super::PipelineError;
use crate::config::SchedulerConfig;
use crate::storage::{Store, StoreError};
use crate::types::{ProcessingBatch, TimeWindow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledWindow {
    pub window: TimeWindow,
    /// Raw pings in the window at scheduling time
    pub estimated_rows: i64,
}

pub struct WindowScheduler {
    store: Arc<dyn Store>,
    window_len: Duration,
    settle_delay: Duration,
}

impl WindowScheduler {
    pub fn new(store: Arc<dyn Store>, config: &SchedulerConfig) -> Self {
        Self {
            store,
            window_len: config.window_len(),
            settle_delay: config.settle_delay(),
        }
    }

    /// Next window to process, or `None` when caught up.
    pub async fn next_window(&self) -> Result<Option<ScheduledWindow>, PipelineError> {
        let mark = self.store.high_water_mark().await?;
        let Some(first) = self.store.earliest_ping_at_or_after(mark).await? else {
            debug!(high_water_mark = ?mark, "[Scheduler] no raw data past the high-water mark");
            return Ok(None);
        };

        let aligned = TimeWindow::aligned(first, self.window_len)?;
        let start = mark.map_or(aligned.start, |m| m.max(aligned.start));
        let window = TimeWindow::new(start, aligned.end)?;

        let now = self.store.server_time().await?;
        if window.end > now - self.settle_delay {
            debug!(window = %window, "[Scheduler] next window still open");
            return Ok(None);
        }

        let estimated_rows = self.store.count_pings(&window).await?;
        Ok(Some(ScheduledWindow {
            window,
            estimated_rows,
        }))
    }

    /// Batches put back to `pending` by the retry manager, oldest first.
    pub async fn requeued(&self, limit: u32) -> Result<Vec<ProcessingBatch>, StoreError> {
        self.store.pending_batches(limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BatchStore, InMemoryStore};
    use crate::types::RawPing;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 1, h, m, 0).unwrap()
    }

    fn ping(t: DateTime<Utc>) -> RawPing {
        RawPing {
            time: t,
            vehicle_id: None,
            garage_no: "P1".into(),
            lat: 44.0,
            lng: 20.0,
            speed: 0.0,
            course: 0.0,
            altitude: 0.0,
            state: 0,
            in_route: false,
            source: "test".into(),
        }
    }

    fn scheduler(store: &Arc<InMemoryStore>) -> WindowScheduler {
        WindowScheduler::new(store.clone(), &SchedulerConfig::default())
    }

    #[tokio::test]
    async fn test_empty_store_has_no_window() {
        let store = Arc::new(InMemoryStore::new());
        assert_eq!(scheduler(&store).next_window().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_first_window_aligns_to_earliest_ping() {
        let store = Arc::new(InMemoryStore::new());
        store.set_now(at(12, 0));
        store.insert_raw(vec![ping(at(9, 17)), ping(at(9, 40)), ping(at(10, 5))]);

        let next = scheduler(&store).next_window().await.unwrap().unwrap();
        assert_eq!(next.window, TimeWindow::new(at(9, 0), at(10, 0)).unwrap());
        assert_eq!(next.estimated_rows, 2);
    }

    #[tokio::test]
    async fn test_open_window_is_not_scheduled() {
        let store = Arc::new(InMemoryStore::new());
        // window [11:00, 12:00) closes at 12:00, settle delay is 2 minutes
        store.set_now(at(12, 1));
        store.insert_raw(vec![ping(at(11, 30))]);
        assert_eq!(scheduler(&store).next_window().await.unwrap(), None);

        store.set_now(at(12, 2));
        assert!(scheduler(&store).next_window().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_resumes_from_high_water_mark_and_skips_gaps() {
        let store = Arc::new(InMemoryStore::new());
        store.set_now(at(20, 0));
        store.insert_raw(vec![ping(at(9, 10)), ping(at(14, 45))]);

        let done = TimeWindow::new(at(9, 0), at(10, 0)).unwrap();
        let id = store.create_pending(&done, None).await.unwrap();
        store.try_lock(id, "w", Duration::minutes(5)).await.unwrap();
        store.complete(id, "w", 1, 0, 0.1).await.unwrap();

        let next = scheduler(&store).next_window().await.unwrap().unwrap();
        assert_eq!(next.window, TimeWindow::new(at(14, 0), at(15, 0)).unwrap());
    }

    #[tokio::test]
    async fn test_never_starts_before_unaligned_mark() {
        let store = Arc::new(InMemoryStore::new());
        store.set_now(at(20, 0));
        store.insert_raw(vec![ping(at(10, 45))]);

        let backfilled = TimeWindow::new(at(9, 0), at(10, 30)).unwrap();
        let id = store.create_pending(&backfilled, None).await.unwrap();
        store.try_lock(id, "w", Duration::minutes(5)).await.unwrap();
        store.complete(id, "w", 0, 0, 0.1).await.unwrap();

        let next = scheduler(&store).next_window().await.unwrap().unwrap();
        assert_eq!(next.window, TimeWindow::new(at(10, 30), at(11, 0)).unwrap());
    }

    #[tokio::test]
    async fn test_requeued_lists_pending_only() {
        let store = Arc::new(InMemoryStore::new());
        let w1 = TimeWindow::new(at(1, 0), at(2, 0)).unwrap();
        let w2 = TimeWindow::new(at(2, 0), at(3, 0)).unwrap();
        store.create_pending(&w2, None).await.unwrap();
        store.create_pending(&w1, Some(4)).await.unwrap();
        let id = store.create_pending(&w1, None).await.unwrap();
        store.try_lock(id, "w", Duration::minutes(5)).await.unwrap();

        let pending = scheduler(&store).requeued(10).await.unwrap();
        let windows: Vec<_> = pending.iter().map(|b| b.window).collect();
        assert_eq!(windows, vec![w1, w2]);
    }
}
