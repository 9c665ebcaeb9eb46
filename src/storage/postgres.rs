//! PostgreSQL / TimescaleDB store
//!
//! Runtime-checked `sqlx` queries. Lock acquisition, heartbeat and the
//! terminal transitions are single conditional `UPDATE` statements, so two
//! workers racing on the same batch row can never both win.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use super::{BatchStore, BatchSummary, PingStore, QueueEntry, RetryPolicy, StoreError};
use crate::types::{
    BatchStatus, FilteredPing, Fix, ProcessingBatch, RawPing, TimeWindow, VehicleToProcess,
};

const BATCH_COLUMNS: &str = "id, window_start, window_end, vehicle_id, status, rows_processed, \
     rows_filtered, error_message, lock_owner, heartbeat_at, attempt, duration_seconds, \
     created_at, started_at, finished_at";

/// Rows per UNNEST insert statement
const UPSERT_CHUNK: usize = 5_000;

fn secs_f64(d: Duration) -> f64 {
    d.num_milliseconds() as f64 / 1000.0
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn map_batch(row: &PgRow) -> Result<ProcessingBatch, StoreError> {
        let status: String = row.try_get("status")?;
        let status = BatchStatus::parse(&status)
            .ok_or_else(|| StoreError::InvalidRow(format!("unknown batch status '{status}'")))?;
        let window = TimeWindow::new(row.try_get("window_start")?, row.try_get("window_end")?)
            .map_err(|e| StoreError::InvalidRow(e.to_string()))?;

        Ok(ProcessingBatch {
            id: row.try_get("id")?,
            window,
            vehicle_id: row.try_get("vehicle_id")?,
            status,
            rows_processed: row.try_get("rows_processed")?,
            rows_filtered: row.try_get("rows_filtered")?,
            error_message: row.try_get("error_message")?,
            lock_owner: row.try_get("lock_owner")?,
            heartbeat_at: row.try_get("heartbeat_at")?,
            attempt: row.try_get("attempt")?,
            duration_seconds: row.try_get("duration_seconds")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    fn map_raw(row: &PgRow) -> Result<RawPing, sqlx::Error> {
        Ok(RawPing {
            time: row.try_get("time")?,
            vehicle_id: row.try_get("vehicle_id")?,
            garage_no: row.try_get("garage_no")?,
            lat: row.try_get("lat")?,
            lng: row.try_get("lng")?,
            speed: row.try_get("speed")?,
            course: row.try_get("course")?,
            altitude: row.try_get("altitude")?,
            state: row.try_get("state")?,
            in_route: row.try_get("in_route")?,
            source: row.try_get("source")?,
        })
    }
}

#[async_trait]
impl PingStore for PgStore {
    async fn raw_pings(
        &self,
        window: &TimeWindow,
        garage_no: Option<&str>,
    ) -> Result<Vec<RawPing>, StoreError> {
        // NULL coordinates become NaN so the filter flags them instead of
        // the row failing to decode.
        let rows = sqlx::query(
            r#"
            SELECT time,
                   vehicle_id,
                   garage_no,
                   COALESCE(lat::float8, 'NaN'::float8)   AS lat,
                   COALESCE(lng::float8, 'NaN'::float8)   AS lng,
                   COALESCE(speed, 0)::float8             AS speed,
                   COALESCE(course, 0)::float8            AS course,
                   COALESCE(alt, 0)::float8               AS altitude,
                   COALESCE(state, 0)::int4               AS state,
                   COALESCE(in_route, FALSE)              AS in_route,
                   COALESCE(data_source, '')              AS source
            FROM   gps_data
            WHERE  time >= $1 AND time < $2
              AND  ($3::text IS NULL OR garage_no = $3)
            ORDER  BY garage_no, time
            "#,
        )
        .bind(window.start)
        .bind(window.end)
        .bind(garage_no)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::map_raw).collect::<Result<_, _>>()?)
    }

    async fn count_pings(&self, window: &TimeWindow) -> Result<i64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM gps_data WHERE time >= $1 AND time < $2")
                .bind(window.start)
                .bind(window.end)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn earliest_ping_at_or_after(
        &self,
        from: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let earliest: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MIN(time) FROM gps_data WHERE ($1::timestamptz IS NULL OR time >= $1)",
        )
        .bind(from)
        .fetch_one(&self.pool)
        .await?;
        Ok(earliest)
    }

    async fn latest_ping_time(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let latest: Option<DateTime<Utc>> = sqlx::query_scalar("SELECT MAX(time) FROM gps_data")
            .fetch_one(&self.pool)
            .await?;
        Ok(latest)
    }

    async fn garage_no_for(&self, vehicle_id: i32) -> Result<Option<String>, StoreError> {
        let garage_no: Option<String> =
            sqlx::query_scalar("SELECT garage_number FROM bus_vehicles WHERE id = $1")
                .bind(vehicle_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(garage_no)
    }

    async fn vehicles_in_window(
        &self,
        window: &TimeWindow,
    ) -> Result<Vec<VehicleToProcess>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT v.id            AS vehicle_id,
                   v.garage_number AS garage_no,
                   r.row_count     AS estimated_rows,
                   (SELECT MAX(f.time)
                    FROM   gps_data_filtered f
                    WHERE  f.garage_no = v.garage_number) AS last_processed_time
            FROM  (SELECT garage_no, COUNT(*) AS row_count
                   FROM   gps_data
                   WHERE  time >= $1 AND time < $2
                   GROUP  BY garage_no) r
            JOIN   bus_vehicles v ON v.garage_number = r.garage_no
            "#,
        )
        .bind(window.start)
        .bind(window.end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<VehicleToProcess, StoreError> {
                Ok(VehicleToProcess {
                    vehicle_id: row.try_get("vehicle_id")?,
                    garage_no: row.try_get("garage_no")?,
                    estimated_rows: row.try_get("estimated_rows")?,
                    last_processed_time: row.try_get("last_processed_time")?,
                })
            })
            .collect()
    }

    async fn last_accepted_before(
        &self,
        garage_no: &str,
        before: DateTime<Utc>,
        lookback: Duration,
    ) -> Result<Option<Fix>, StoreError> {
        let row: Option<(DateTime<Utc>, f64, f64)> = sqlx::query_as(
            r#"
            SELECT time, lat, lng
            FROM   gps_data_filtered
            WHERE  garage_no = $1
              AND  NOT is_outlier
              AND  time < $2
              AND  time >= $3
            ORDER  BY time DESC
            LIMIT  1
            "#,
        )
        .bind(garage_no)
        .bind(before)
        .bind(before - lookback)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(time, lat, lng)| Fix { time, lat, lng }))
    }

    async fn upsert_filtered(&self, batch_id: i64, rows: &[FilteredPing]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;

        for chunk in rows.chunks(UPSERT_CHUNK) {
            let result = sqlx::query(
                r#"
                INSERT INTO gps_data_filtered (
                    time, vehicle_id, garage_no, lat, lng, speed, course, alt,
                    state, in_route, data_source, is_outlier, outlier_type,
                    batch_id, processed_at
                )
                SELECT u.*, $14::int8, NOW()
                FROM   UNNEST($1::timestamptz[], $2::int4[], $3::text[], $4::float8[],
                              $5::float8[], $6::float8[], $7::float8[], $8::float8[],
                              $9::int4[], $10::bool[], $11::text[], $12::bool[],
                              $13::text[]) AS u
                ON CONFLICT (time, garage_no) DO UPDATE SET
                    vehicle_id   = EXCLUDED.vehicle_id,
                    lat          = EXCLUDED.lat,
                    lng          = EXCLUDED.lng,
                    speed        = EXCLUDED.speed,
                    course       = EXCLUDED.course,
                    alt          = EXCLUDED.alt,
                    state        = EXCLUDED.state,
                    in_route     = EXCLUDED.in_route,
                    data_source  = EXCLUDED.data_source,
                    is_outlier   = EXCLUDED.is_outlier,
                    outlier_type = EXCLUDED.outlier_type,
                    batch_id     = EXCLUDED.batch_id,
                    processed_at = EXCLUDED.processed_at
                "#,
            )
            .bind(chunk.iter().map(|r| r.time).collect::<Vec<_>>())
            .bind(chunk.iter().map(|r| r.vehicle_id).collect::<Vec<_>>())
            .bind(chunk.iter().map(|r| r.garage_no.clone()).collect::<Vec<_>>())
            .bind(chunk.iter().map(|r| r.lat).collect::<Vec<_>>())
            .bind(chunk.iter().map(|r| r.lng).collect::<Vec<_>>())
            .bind(chunk.iter().map(|r| r.speed).collect::<Vec<_>>())
            .bind(chunk.iter().map(|r| r.course).collect::<Vec<_>>())
            .bind(chunk.iter().map(|r| r.altitude).collect::<Vec<_>>())
            .bind(chunk.iter().map(|r| r.state).collect::<Vec<_>>())
            .bind(chunk.iter().map(|r| r.in_route).collect::<Vec<_>>())
            .bind(chunk.iter().map(|r| r.source.clone()).collect::<Vec<_>>())
            .bind(chunk.iter().map(|r| r.is_outlier).collect::<Vec<_>>())
            .bind(
                chunk
                    .iter()
                    .map(|r| r.outlier_kind.map(|k| k.as_str().to_string()))
                    .collect::<Vec<_>>(),
            )
            .bind(batch_id)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    fn backend_name(&self) -> &'static str {
        "PostgreSQL"
    }
}

#[async_trait]
impl BatchStore for PgStore {
    async fn server_time(&self) -> Result<DateTime<Utc>, StoreError> {
        let now: DateTime<Utc> = sqlx::query_scalar("SELECT NOW()")
            .fetch_one(&self.pool)
            .await?;
        Ok(now)
    }

    async fn create_pending(
        &self,
        window: &TimeWindow,
        vehicle_id: Option<i32>,
    ) -> Result<i64, StoreError> {
        // No-op update so RETURNING yields the existing id on conflict
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO gps_processing_batches (window_start, window_end, vehicle_id)
            VALUES ($1, $2, $3)
            ON CONFLICT ON CONSTRAINT gps_processing_batches_scope_key
            DO UPDATE SET window_start = EXCLUDED.window_start
            RETURNING id
            "#,
        )
        .bind(window.start)
        .bind(window.end)
        .bind(vehicle_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn try_lock(
        &self,
        batch_id: i64,
        owner: &str,
        stale_after: Duration,
    ) -> Result<Option<ProcessingBatch>, StoreError> {
        let sql = format!(
            r#"
            UPDATE gps_processing_batches
            SET    status        = 'processing',
                   lock_owner    = $2,
                   heartbeat_at  = NOW(),
                   started_at    = NOW(),
                   finished_at   = NULL,
                   error_message = NULL
            WHERE  id = $1
              AND  (status <> 'processing'
                    OR heartbeat_at IS NULL
                    OR heartbeat_at < NOW() - make_interval(secs => $3))
            RETURNING {BATCH_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(batch_id)
            .bind(owner)
            .bind(secs_f64(stale_after))
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(Self::map_batch(&row)?)),
            None => {
                let exists: Option<i64> =
                    sqlx::query_scalar("SELECT id FROM gps_processing_batches WHERE id = $1")
                        .bind(batch_id)
                        .fetch_optional(&self.pool)
                        .await?;
                match exists {
                    Some(_) => Ok(None),
                    None => Err(StoreError::BatchNotFound(batch_id)),
                }
            }
        }
    }

    async fn heartbeat(&self, batch_id: i64, owner: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE gps_processing_batches SET heartbeat_at = NOW() \
             WHERE id = $1 AND status = 'processing' AND lock_owner = $2",
        )
        .bind(batch_id)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete(
        &self,
        batch_id: i64,
        owner: &str,
        rows_processed: i64,
        rows_filtered: i64,
        duration_seconds: f64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE gps_processing_batches
            SET    status           = 'completed',
                   rows_processed   = $3,
                   rows_filtered    = $4,
                   duration_seconds = $5,
                   error_message    = NULL,
                   lock_owner       = NULL,
                   finished_at      = NOW()
            WHERE  id = $1 AND status = 'processing' AND lock_owner = $2
            "#,
        )
        .bind(batch_id)
        .bind(owner)
        .bind(rows_processed)
        .bind(rows_filtered)
        .bind(duration_seconds)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail(
        &self,
        batch_id: i64,
        owner: &str,
        error_message: &str,
        duration_seconds: f64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE gps_processing_batches
            SET    status           = 'failed',
                   error_message    = $3,
                   duration_seconds = $4,
                   lock_owner       = NULL,
                   finished_at      = NOW()
            WHERE  id = $1 AND status = 'processing' AND lock_owner = $2
            "#,
        )
        .bind(batch_id)
        .bind(owner)
        .bind(error_message)
        .bind(duration_seconds)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_batch(&self, batch_id: i64) -> Result<Option<ProcessingBatch>, StoreError> {
        let sql = format!("SELECT {BATCH_COLUMNS} FROM gps_processing_batches WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::map_batch).transpose()
    }

    async fn high_water_mark(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let mark: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(window_end) FROM gps_processing_batches WHERE status <> 'pending'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(mark)
    }

    async fn pending_batches(&self, limit: u32) -> Result<Vec<ProcessingBatch>, StoreError> {
        let sql = format!(
            "SELECT {BATCH_COLUMNS} FROM gps_processing_batches \
             WHERE status = 'pending' ORDER BY window_start, id LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::map_batch).collect()
    }

    async fn completed_vehicle_ids(&self, window: &TimeWindow) -> Result<Vec<i32>, StoreError> {
        let ids: Vec<i32> = sqlx::query_scalar(
            r#"
            SELECT vehicle_id
            FROM   gps_processing_batches
            WHERE  window_start = $1 AND window_end = $2
              AND  vehicle_id IS NOT NULL
              AND  status = 'completed'
            "#,
        )
        .bind(window.start)
        .bind(window.end)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn retry_failed(&self, policy: &RetryPolicy) -> Result<u64, StoreError> {
        let max_exp = i32::try_from(policy.max_backoff_exponent.min(30)).unwrap_or(30);
        let result = sqlx::query(
            r#"
            UPDATE gps_processing_batches
            SET    status       = 'pending',
                   attempt      = attempt + 1,
                   lock_owner   = NULL,
                   heartbeat_at = NULL
            WHERE  status = 'failed'
              AND  attempt < $1
              AND  (finished_at IS NULL
                    OR finished_at <= NOW() - make_interval(
                           secs => $2::float8 * power(2::float8, LEAST(GREATEST(attempt, 0), $3::int4))))
            "#,
        )
        .bind(policy.max_retries)
        .bind(secs_f64(policy.base_delay))
        .bind(max_exp)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn reclaim_stale(&self, stale_after: Duration) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE gps_processing_batches
            SET    status        = 'failed',
                   error_message = 'lock heartbeat expired',
                   lock_owner    = NULL,
                   finished_at   = NOW()
            WHERE  status = 'processing'
              AND  (heartbeat_at IS NULL
                    OR heartbeat_at < NOW() - make_interval(secs => $1))
            "#,
        )
        .bind(secs_f64(stale_after))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn summary(&self, max_retries: i32) -> Result<BatchSummary, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) FILTER (WHERE status = 'pending')                      AS pending,
                   COUNT(*) FILTER (WHERE status = 'processing')                   AS processing,
                   COUNT(*) FILTER (WHERE status = 'completed')                    AS completed,
                   COUNT(*) FILTER (WHERE status = 'failed')                       AS failed,
                   COUNT(*) FILTER (WHERE status = 'failed' AND attempt >= $1)     AS exhausted,
                   COALESCE(SUM(rows_processed), 0)::int8                          AS total_rows_processed,
                   COALESCE(SUM(rows_filtered), 0)::int8                           AS total_rows_filtered,
                   MAX(window_end) FILTER (WHERE status = 'completed')             AS last_processed_time,
                   AVG(duration_seconds) FILTER (WHERE status = 'completed')       AS avg_duration_seconds
            FROM   gps_processing_batches
            "#,
        )
        .bind(max_retries)
        .fetch_one(&self.pool)
        .await?;

        Ok(BatchSummary {
            pending: row.try_get("pending")?,
            processing: row.try_get("processing")?,
            completed: row.try_get("completed")?,
            failed: row.try_get("failed")?,
            exhausted: row.try_get("exhausted")?,
            total_rows_processed: row.try_get("total_rows_processed")?,
            total_rows_filtered: row.try_get("total_rows_filtered")?,
            last_processed_time: row.try_get("last_processed_time")?,
            avg_duration_seconds: row.try_get("avg_duration_seconds")?,
        })
    }

    async fn queue(&self, since: DateTime<Utc>) -> Result<Vec<QueueEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT window_start,
                   window_end,
                   COUNT(*)                                       AS total,
                   COUNT(*) FILTER (WHERE status = 'pending')     AS pending,
                   COUNT(*) FILTER (WHERE status = 'processing')  AS processing,
                   COUNT(*) FILTER (WHERE status = 'completed')   AS completed,
                   COUNT(*) FILTER (WHERE status = 'failed')      AS failed,
                   COALESCE(SUM(rows_processed), 0)::int8         AS rows_processed
            FROM   gps_processing_batches
            WHERE  window_start >= $1
            GROUP  BY window_start, window_end
            ORDER  BY window_start DESC, window_end DESC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<QueueEntry, StoreError> {
                let window =
                    TimeWindow::new(row.try_get("window_start")?, row.try_get("window_end")?)
                        .map_err(|e| StoreError::InvalidRow(e.to_string()))?;
                Ok(QueueEntry {
                    window,
                    total: row.try_get("total")?,
                    pending: row.try_get("pending")?,
                    processing: row.try_get("processing")?,
                    completed: row.try_get("completed")?,
                    failed: row.try_get("failed")?,
                    rows_processed: row.try_get("rows_processed")?,
                })
            })
            .collect()
    }

    async fn active_batches(&self, limit: u32) -> Result<Vec<ProcessingBatch>, StoreError> {
        let sql = format!(
            "SELECT {BATCH_COLUMNS} FROM gps_processing_batches \
             WHERE status IN ('pending', 'processing') \
             ORDER BY started_at DESC NULLS LAST, id DESC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::map_batch).collect()
    }
}
