//! In-memory store
//!
//! Single mutex over all tables, so every trait call is atomic the way a
//! single SQL statement is. Not durable.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::{BatchStore, BatchSummary, PingStore, QueueEntry, RetryPolicy, StoreError};
use crate::types::{
    BatchStatus, FilteredPing, Fix, ProcessingBatch, RawPing, TimeWindow, VehicleToProcess,
};

#[derive(Default)]
struct Tables {
    /// Fixed clock for tests; `None` uses wall time
    now: Option<DateTime<Utc>>,
    raw: Vec<RawPing>,
    /// vehicle_id → garage_no
    vehicles: BTreeMap<i32, String>,
    filtered: BTreeMap<(String, DateTime<Utc>), FilteredPing>,
    batches: BTreeMap<i64, ProcessingBatch>,
    next_batch_id: i64,
    /// Garage numbers whose filtered writes are rejected
    failing_writes: HashSet<String>,
}

impl Tables {
    fn now(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    fn owned_batch(&mut self, batch_id: i64, owner: &str) -> Option<&mut ProcessingBatch> {
        self.batches.get_mut(&batch_id).filter(|b| {
            b.status == BatchStatus::Processing && b.lock_owner.as_deref() == Some(owner)
        })
    }
}

/// In-memory `PingStore` + `BatchStore`
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pin the store clock.
    pub fn set_now(&self, now: DateTime<Utc>) {
        self.lock().now = Some(now);
    }

    pub fn register_vehicle(&self, vehicle_id: i32, garage_no: &str) {
        self.lock().vehicles.insert(vehicle_id, garage_no.to_string());
    }

    pub fn insert_raw(&self, pings: impl IntoIterator<Item = RawPing>) {
        self.lock().raw.extend(pings);
    }

    /// Make every filtered write for `garage_no` fail.
    pub fn fail_writes_for(&self, garage_no: &str) {
        self.lock().failing_writes.insert(garage_no.to_string());
    }

    pub fn clear_write_failures(&self) {
        self.lock().failing_writes.clear();
    }

    /// Move a batch heartbeat into the past.
    pub fn backdate_heartbeat(&self, batch_id: i64, by: Duration) {
        if let Some(batch) = self.lock().batches.get_mut(&batch_id) {
            batch.heartbeat_at = batch.heartbeat_at.map(|hb| hb - by);
        }
    }

    /// Move a batch's finish time into the past.
    pub fn backdate_finish(&self, batch_id: i64, by: Duration) {
        if let Some(batch) = self.lock().batches.get_mut(&batch_id) {
            batch.finished_at = batch.finished_at.map(|t| t - by);
        }
    }

    /// All filtered rows, ordered by garage number then time.
    pub fn filtered(&self) -> Vec<FilteredPing> {
        self.lock().filtered.values().cloned().collect()
    }

    /// All batch rows, by id.
    pub fn batches(&self) -> Vec<ProcessingBatch> {
        self.lock().batches.values().cloned().collect()
    }
}

#[async_trait]
impl PingStore for InMemoryStore {
    async fn raw_pings(
        &self,
        window: &TimeWindow,
        garage_no: Option<&str>,
    ) -> Result<Vec<RawPing>, StoreError> {
        let tables = self.lock();
        let mut pings: Vec<RawPing> = tables
            .raw
            .iter()
            .filter(|p| window.contains(p.time))
            .filter(|p| garage_no.map_or(true, |g| p.garage_no == g))
            .cloned()
            .collect();
        pings.sort_by(|a, b| a.garage_no.cmp(&b.garage_no).then(a.time.cmp(&b.time)));
        Ok(pings)
    }

    async fn count_pings(&self, window: &TimeWindow) -> Result<i64, StoreError> {
        let count = self.lock().raw.iter().filter(|p| window.contains(p.time)).count();
        i64::try_from(count).map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn earliest_ping_at_or_after(
        &self,
        from: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .lock()
            .raw
            .iter()
            .map(|p| p.time)
            .filter(|t| from.map_or(true, |f| *t >= f))
            .min())
    }

    async fn latest_ping_time(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.lock().raw.iter().map(|p| p.time).max())
    }

    async fn garage_no_for(&self, vehicle_id: i32) -> Result<Option<String>, StoreError> {
        Ok(self.lock().vehicles.get(&vehicle_id).cloned())
    }

    async fn vehicles_in_window(
        &self,
        window: &TimeWindow,
    ) -> Result<Vec<VehicleToProcess>, StoreError> {
        let tables = self.lock();
        let mut out = Vec::new();
        for (&vehicle_id, garage_no) in &tables.vehicles {
            let rows = tables
                .raw
                .iter()
                .filter(|p| &p.garage_no == garage_no && window.contains(p.time))
                .count();
            if rows == 0 {
                continue;
            }
            let last_processed_time = tables
                .filtered
                .values()
                .filter(|f| &f.garage_no == garage_no)
                .map(|f| f.time)
                .max();
            out.push(VehicleToProcess {
                vehicle_id,
                garage_no: garage_no.clone(),
                estimated_rows: i64::try_from(rows)
                    .map_err(|e| StoreError::InvalidRow(e.to_string()))?,
                last_processed_time,
            });
        }
        Ok(out)
    }

    async fn last_accepted_before(
        &self,
        garage_no: &str,
        before: DateTime<Utc>,
        lookback: Duration,
    ) -> Result<Option<Fix>, StoreError> {
        let tables = self.lock();
        let floor = before - lookback;
        Ok(tables
            .filtered
            .range((garage_no.to_string(), floor)..(garage_no.to_string(), before))
            .map(|(_, f)| f)
            .filter(|f| !f.is_outlier)
            .next_back()
            .map(Fix::from))
    }

    async fn upsert_filtered(&self, batch_id: i64, rows: &[FilteredPing]) -> Result<u64, StoreError> {
        let mut tables = self.lock();
        if let Some(bad) = rows.iter().find(|r| tables.failing_writes.contains(&r.garage_no)) {
            return Err(StoreError::Backend(format!(
                "write rejected for vehicle {}",
                bad.garage_no
            )));
        }
        for row in rows {
            let mut row = row.clone();
            row.batch_id = Some(batch_id);
            tables.filtered.insert((row.garage_no.clone(), row.time), row);
        }
        Ok(rows.len() as u64)
    }

    fn backend_name(&self) -> &'static str {
        "InMemory"
    }
}

#[async_trait]
impl BatchStore for InMemoryStore {
    async fn server_time(&self) -> Result<DateTime<Utc>, StoreError> {
        Ok(self.lock().now())
    }

    async fn create_pending(
        &self,
        window: &TimeWindow,
        vehicle_id: Option<i32>,
    ) -> Result<i64, StoreError> {
        let mut tables = self.lock();
        if let Some(existing) = tables
            .batches
            .values()
            .find(|b| b.window == *window && b.vehicle_id == vehicle_id)
        {
            return Ok(existing.id);
        }

        tables.next_batch_id += 1;
        let id = tables.next_batch_id;
        let now = tables.now();
        tables.batches.insert(
            id,
            ProcessingBatch {
                id,
                window: *window,
                vehicle_id,
                status: BatchStatus::Pending,
                rows_processed: 0,
                rows_filtered: 0,
                error_message: None,
                lock_owner: None,
                heartbeat_at: None,
                attempt: 0,
                duration_seconds: None,
                created_at: now,
                started_at: None,
                finished_at: None,
            },
        );
        Ok(id)
    }

    async fn try_lock(
        &self,
        batch_id: i64,
        owner: &str,
        stale_after: Duration,
    ) -> Result<Option<ProcessingBatch>, StoreError> {
        let mut tables = self.lock();
        let now = tables.now();
        let batch = tables
            .batches
            .get_mut(&batch_id)
            .ok_or(StoreError::BatchNotFound(batch_id))?;

        if batch.lock_is_fresh(now, stale_after) {
            return Ok(None);
        }

        batch.status = BatchStatus::Processing;
        batch.lock_owner = Some(owner.to_string());
        batch.heartbeat_at = Some(now);
        batch.started_at = Some(now);
        batch.finished_at = None;
        batch.error_message = None;
        Ok(Some(batch.clone()))
    }

    async fn heartbeat(&self, batch_id: i64, owner: &str) -> Result<bool, StoreError> {
        let mut tables = self.lock();
        let now = tables.now();
        Ok(tables
            .owned_batch(batch_id, owner)
            .map(|b| b.heartbeat_at = Some(now))
            .is_some())
    }

    async fn complete(
        &self,
        batch_id: i64,
        owner: &str,
        rows_processed: i64,
        rows_filtered: i64,
        duration_seconds: f64,
    ) -> Result<bool, StoreError> {
        let mut tables = self.lock();
        let now = tables.now();
        Ok(tables
            .owned_batch(batch_id, owner)
            .map(|b| {
                b.status = BatchStatus::Completed;
                b.rows_processed = rows_processed;
                b.rows_filtered = rows_filtered;
                b.duration_seconds = Some(duration_seconds);
                b.error_message = None;
                b.lock_owner = None;
                b.finished_at = Some(now);
            })
            .is_some())
    }

    async fn fail(
        &self,
        batch_id: i64,
        owner: &str,
        error_message: &str,
        duration_seconds: f64,
    ) -> Result<bool, StoreError> {
        let mut tables = self.lock();
        let now = tables.now();
        Ok(tables
            .owned_batch(batch_id, owner)
            .map(|b| {
                b.status = BatchStatus::Failed;
                b.duration_seconds = Some(duration_seconds);
                b.error_message = Some(error_message.to_string());
                b.lock_owner = None;
                b.finished_at = Some(now);
            })
            .is_some())
    }

    async fn get_batch(&self, batch_id: i64) -> Result<Option<ProcessingBatch>, StoreError> {
        Ok(self.lock().batches.get(&batch_id).cloned())
    }

    async fn high_water_mark(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .lock()
            .batches
            .values()
            .filter(|b| b.status != BatchStatus::Pending)
            .map(|b| b.window.end)
            .max())
    }

    async fn pending_batches(&self, limit: u32) -> Result<Vec<ProcessingBatch>, StoreError> {
        let mut pending: Vec<ProcessingBatch> = self
            .lock()
            .batches
            .values()
            .filter(|b| b.status == BatchStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|b| (b.window.start, b.id));
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn completed_vehicle_ids(&self, window: &TimeWindow) -> Result<Vec<i32>, StoreError> {
        Ok(self
            .lock()
            .batches
            .values()
            .filter(|b| b.window == *window && b.status == BatchStatus::Completed)
            .filter_map(|b| b.vehicle_id)
            .collect())
    }

    async fn retry_failed(&self, policy: &RetryPolicy) -> Result<u64, StoreError> {
        let mut tables = self.lock();
        let now = tables.now();
        let mut requeued = 0;
        for batch in tables.batches.values_mut() {
            if batch.status == BatchStatus::Failed && policy.is_due(batch, now) {
                batch.status = BatchStatus::Pending;
                batch.attempt += 1;
                batch.lock_owner = None;
                batch.heartbeat_at = None;
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn reclaim_stale(&self, stale_after: Duration) -> Result<u64, StoreError> {
        let mut tables = self.lock();
        let now = tables.now();
        let mut reclaimed = 0;
        for batch in tables.batches.values_mut() {
            if batch.status == BatchStatus::Processing && !batch.lock_is_fresh(now, stale_after) {
                batch.status = BatchStatus::Failed;
                batch.error_message = Some("lock heartbeat expired".to_string());
                batch.lock_owner = None;
                batch.finished_at = Some(now);
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn summary(&self, max_retries: i32) -> Result<BatchSummary, StoreError> {
        let tables = self.lock();
        let mut summary = BatchSummary::default();
        let mut durations = Vec::new();
        for b in tables.batches.values() {
            match b.status {
                BatchStatus::Pending => summary.pending += 1,
                BatchStatus::Processing => summary.processing += 1,
                BatchStatus::Failed => {
                    summary.failed += 1;
                    if b.attempt >= max_retries {
                        summary.exhausted += 1;
                    }
                }
                BatchStatus::Completed => {
                    summary.completed += 1;
                    summary.last_processed_time =
                        summary.last_processed_time.max(Some(b.window.end));
                    durations.extend(b.duration_seconds);
                }
            }
            summary.total_rows_processed += b.rows_processed;
            summary.total_rows_filtered += b.rows_filtered;
        }
        if !durations.is_empty() {
            summary.avg_duration_seconds =
                Some(durations.iter().sum::<f64>() / durations.len() as f64);
        }
        Ok(summary)
    }

    async fn queue(&self, since: DateTime<Utc>) -> Result<Vec<QueueEntry>, StoreError> {
        let tables = self.lock();
        let mut by_window: BTreeMap<TimeWindow, QueueEntry> = BTreeMap::new();
        for b in tables.batches.values().filter(|b| b.window.start >= since) {
            let entry = by_window.entry(b.window).or_insert_with(|| QueueEntry {
                window: b.window,
                total: 0,
                pending: 0,
                processing: 0,
                completed: 0,
                failed: 0,
                rows_processed: 0,
            });
            entry.total += 1;
            entry.rows_processed += b.rows_processed;
            match b.status {
                BatchStatus::Pending => entry.pending += 1,
                BatchStatus::Processing => entry.processing += 1,
                BatchStatus::Completed => entry.completed += 1,
                BatchStatus::Failed => entry.failed += 1,
            }
        }
        Ok(by_window.into_values().rev().collect())
    }

    async fn active_batches(&self, limit: u32) -> Result<Vec<ProcessingBatch>, StoreError> {
        let mut active: Vec<ProcessingBatch> = self
            .lock()
            .batches
            .values()
            .filter(|b| matches!(b.status, BatchStatus::Pending | BatchStatus::Processing))
            .cloned()
            .collect();
        active.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        active.truncate(limit as usize);
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 1, h, 0, 0).unwrap()
    }

    fn window(h: u32) -> TimeWindow {
        TimeWindow::new(at(h), at(h + 1)).unwrap()
    }

    #[tokio::test]
    async fn test_create_pending_is_idempotent_per_scope() {
        let store = InMemoryStore::new();
        let a = store.create_pending(&window(1), None).await.unwrap();
        let b = store.create_pending(&window(1), None).await.unwrap();
        let c = store.create_pending(&window(1), Some(7)).await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(store.batches().len(), 2);
    }

    #[tokio::test]
    async fn test_fresh_lock_blocks_second_owner() {
        let store = InMemoryStore::new();
        store.set_now(at(5));
        let id = store.create_pending(&window(1), None).await.unwrap();
        let stale = Duration::minutes(5);

        assert!(store.try_lock(id, "a", stale).await.unwrap().is_some());
        assert!(store.try_lock(id, "b", stale).await.unwrap().is_none());

        store.backdate_heartbeat(id, Duration::minutes(10));
        let taken = store.try_lock(id, "b", stale).await.unwrap().unwrap();
        assert_eq!(taken.lock_owner.as_deref(), Some("b"));

        // Old owner can no longer finish
        assert!(!store.complete(id, "a", 1, 0, 0.1).await.unwrap());
        assert!(store.complete(id, "b", 1, 0, 0.1).await.unwrap());
    }

    #[tokio::test]
    async fn test_try_lock_unknown_batch() {
        let store = InMemoryStore::new();
        let err = store.try_lock(99, "a", Duration::minutes(5)).await.unwrap_err();
        assert!(matches!(err, StoreError::BatchNotFound(99)));
    }

    #[tokio::test]
    async fn test_retry_respects_ceiling_and_backoff() {
        let store = InMemoryStore::new();
        store.set_now(at(5));
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::seconds(60),
            max_backoff_exponent: 4,
        };
        let id = store.create_pending(&window(1), None).await.unwrap();

        for expected_attempt in 1..=2 {
            store.try_lock(id, "w", Duration::minutes(5)).await.unwrap();
            store.fail(id, "w", "boom", 0.5).await.unwrap();
            // Backoff not elapsed yet
            assert_eq!(store.retry_failed(&policy).await.unwrap(), 0);
            store.backdate_finish(id, Duration::hours(1));
            assert_eq!(store.retry_failed(&policy).await.unwrap(), 1);
            let b = store.get_batch(id).await.unwrap().unwrap();
            assert_eq!(b.status, BatchStatus::Pending);
            assert_eq!(b.attempt, expected_attempt);
        }

        store.try_lock(id, "w", Duration::minutes(5)).await.unwrap();
        store.fail(id, "w", "boom", 0.5).await.unwrap();
        store.backdate_finish(id, Duration::hours(10));
        assert_eq!(store.retry_failed(&policy).await.unwrap(), 0);
        assert_eq!(store.summary(2).await.unwrap().exhausted, 1);
    }

    #[tokio::test]
    async fn test_reclaim_stale_moves_to_failed() {
        let store = InMemoryStore::new();
        store.set_now(at(5));
        let id = store.create_pending(&window(1), None).await.unwrap();
        store.try_lock(id, "w", Duration::minutes(5)).await.unwrap();

        assert_eq!(store.reclaim_stale(Duration::minutes(5)).await.unwrap(), 0);
        store.backdate_heartbeat(id, Duration::minutes(6));
        assert_eq!(store.reclaim_stale(Duration::minutes(5)).await.unwrap(), 1);

        let b = store.get_batch(id).await.unwrap().unwrap();
        assert_eq!(b.status, BatchStatus::Failed);
        assert!(b.lock_owner.is_none());
    }

    #[tokio::test]
    async fn test_high_water_mark_ignores_pending() {
        let store = InMemoryStore::new();
        store.create_pending(&window(3), None).await.unwrap();
        assert_eq!(store.high_water_mark().await.unwrap(), None);

        let id = store.create_pending(&window(1), None).await.unwrap();
        store.try_lock(id, "w", Duration::minutes(5)).await.unwrap();
        assert_eq!(store.high_water_mark().await.unwrap(), Some(at(2)));
    }
}
