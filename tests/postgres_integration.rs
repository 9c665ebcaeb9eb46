//! PostgreSQL Integration Tests
//!
//! Runs the storage layer and the executor against a real database. Needs
//! a disposable PostgreSQL/TimescaleDB reachable through `DATABASE_URL`;
//! without it every test is skipped (not failed).
//!
//! The raw and registry tables are created if missing. Each test works in
//! its own far-future window with its own vehicle so runs never collide.

#![cfg(feature = "timescale")]

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::PgPool;

use gps_refinery::config::{DatabaseConfig, ProcessorConfig};
use gps_refinery::pipeline::BatchExecutor;
use gps_refinery::storage::{db, BatchStore, PgStore, PingStore, RetryPolicy};
use gps_refinery::types::{BatchStatus, TimeWindow};

const INGEST_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS gps_data (
    time        TIMESTAMPTZ NOT NULL,
    vehicle_id  INTEGER,
    garage_no   TEXT NOT NULL,
    lat         DOUBLE PRECISION,
    lng         DOUBLE PRECISION,
    speed       DOUBLE PRECISION,
    course      DOUBLE PRECISION,
    alt         DOUBLE PRECISION,
    state       INTEGER,
    in_route    BOOLEAN,
    data_source TEXT
);
CREATE TABLE IF NOT EXISTS bus_vehicles (
    id            INTEGER PRIMARY KEY,
    garage_number TEXT NOT NULL UNIQUE
);
"#;

/// Connect, create the ingestion tables, migrate. `None` skips the test.
async fn test_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("SKIP: DATABASE_URL not set, skipping PostgreSQL integration test");
        return None;
    };

    let pool = db::create_pool(&DatabaseConfig {
        url,
        ..DatabaseConfig::default()
    })
    .await
    .expect("connect to DATABASE_URL");
    sqlx::raw_sql(INGEST_SCHEMA)
        .execute(&pool)
        .await
        .expect("create ingestion tables");
    db::run_migrations(&pool).await.expect("run migrations");
    Some(pool)
}

/// A vehicle and window nobody else uses.
struct Fixture {
    vehicle_id: i32,
    garage_no: String,
    window: TimeWindow,
}

impl Fixture {
    async fn new(pool: &PgPool) -> Self {
        let n = uuid::Uuid::new_v4().as_u128();
        let vehicle_id = i32::try_from(n % 1_000_000_000).unwrap() + 1_000_000_000;
        let hours = i64::try_from((n >> 64) % 500_000).unwrap();
        let start = Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap() + Duration::hours(hours);
        let garage_no = format!("IT{vehicle_id}");

        sqlx::query("INSERT INTO bus_vehicles (id, garage_number) VALUES ($1, $2)")
            .bind(vehicle_id)
            .bind(&garage_no)
            .execute(pool)
            .await
            .unwrap();

        Self {
            vehicle_id,
            garage_no,
            window: TimeWindow::new(start, start + Duration::hours(1)).unwrap(),
        }
    }

    async fn insert(&self, pool: &PgPool, offset_secs: i64, lat: f64, lng: f64) {
        let t: DateTime<Utc> = self.window.start + Duration::seconds(offset_secs);
        sqlx::query(
            "INSERT INTO gps_data (time, garage_no, lat, lng, speed, course, alt, state, in_route, data_source) \
             VALUES ($1, $2, $3, $4, 20, 0, 100, 0, TRUE, 'it')",
        )
        .bind(t)
        .bind(&self.garage_no)
        .bind(lat)
        .bind(lng)
        .execute(pool)
        .await
        .unwrap();
    }

    async fn cleanup(&self, pool: &PgPool) {
        for sql in [
            "DELETE FROM gps_data WHERE garage_no = $1",
            "DELETE FROM gps_data_filtered WHERE garage_no = $1",
        ] {
            sqlx::query(sql).bind(&self.garage_no).execute(pool).await.unwrap();
        }
        sqlx::query("DELETE FROM gps_processing_batches WHERE vehicle_id = $1")
            .bind(self.vehicle_id)
            .execute(pool)
            .await
            .unwrap();
        sqlx::query("DELETE FROM bus_vehicles WHERE id = $1")
            .bind(self.vehicle_id)
            .execute(pool)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn executor_writes_filtered_rows_with_outlier_flags() {
    let Some(pool) = test_db().await else { return };
    let fx = Fixture::new(&pool).await;
    fx.insert(&pool, 0, 44.000, 20.000).await;
    fx.insert(&pool, 1, 44.020, 20.020).await;
    fx.insert(&pool, 5, 44.0001, 20.0001).await;

    let store = Arc::new(PgStore::new(pool.clone()));
    let config = ProcessorConfig::default();
    let executor = BatchExecutor::new(
        store.clone(),
        config.filter.clone(),
        config.locking.clone(),
        "it-worker".into(),
    );

    let result = executor.execute(fx.window, Some(fx.vehicle_id)).await.unwrap();
    assert!(result.is_success(), "{:?}", result.error_message);
    assert_eq!(result.rows_processed, 3);
    assert_eq!(result.rows_filtered, 1);

    let rows: Vec<(DateTime<Utc>, bool, Option<String>, Option<i32>)> = sqlx::query_as(
        "SELECT time, is_outlier, outlier_type, vehicle_id FROM gps_data_filtered \
         WHERE garage_no = $1 ORDER BY time",
    )
    .bind(&fx.garage_no)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(rows.len(), 3);
    assert!(!rows[0].1);
    assert!(rows[1].1);
    assert_eq!(rows[1].2.as_deref(), Some("implied_speed"));
    assert!(!rows[2].1);
    assert!(rows.iter().all(|r| r.3 == Some(fx.vehicle_id)));

    // Re-running rewrites the same keys
    let again = executor.execute(fx.window, Some(fx.vehicle_id)).await.unwrap();
    assert!(again.is_success());
    assert_eq!(again.batch_id, result.batch_id);

    let seed = store
        .last_accepted_before(&fx.garage_no, fx.window.end, Duration::hours(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seed.time, fx.window.start + Duration::seconds(5));

    fx.cleanup(&pool).await;
}

#[tokio::test]
async fn lock_is_exclusive_until_stale() {
    let Some(pool) = test_db().await else { return };
    let fx = Fixture::new(&pool).await;
    let store = PgStore::new(pool.clone());
    let stale_after = Duration::seconds(300);

    let id = store.create_pending(&fx.window, Some(fx.vehicle_id)).await.unwrap();
    assert_eq!(
        store.create_pending(&fx.window, Some(fx.vehicle_id)).await.unwrap(),
        id
    );

    let locked = store.try_lock(id, "a", stale_after).await.unwrap().unwrap();
    assert_eq!(locked.status, BatchStatus::Processing);
    assert!(store.try_lock(id, "b", stale_after).await.unwrap().is_none());
    assert!(store.heartbeat(id, "a").await.unwrap());
    assert!(!store.heartbeat(id, "b").await.unwrap());

    sqlx::query("UPDATE gps_processing_batches SET heartbeat_at = NOW() - INTERVAL '1 hour' WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await
        .unwrap();
    let taken = store.try_lock(id, "b", stale_after).await.unwrap().unwrap();
    assert_eq!(taken.lock_owner.as_deref(), Some("b"));

    // The old owner can no longer finish the batch
    assert!(!store.complete(id, "a", 1, 0, 0.1).await.unwrap());
    assert!(store.complete(id, "b", 1, 0, 0.1).await.unwrap());
    assert_eq!(
        store.get_batch(id).await.unwrap().unwrap().status,
        BatchStatus::Completed
    );

    fx.cleanup(&pool).await;
}

#[tokio::test]
async fn failed_batch_requeues_below_ceiling_only() {
    let Some(pool) = test_db().await else { return };
    let fx = Fixture::new(&pool).await;
    let store = PgStore::new(pool.clone());
    let policy = RetryPolicy {
        max_retries: 1,
        base_delay: Duration::zero(),
        max_backoff_exponent: 0,
    };

    let id = store.create_pending(&fx.window, Some(fx.vehicle_id)).await.unwrap();
    store.try_lock(id, "w", Duration::seconds(300)).await.unwrap().unwrap();
    assert!(store.fail(id, "w", "boom", 0.2).await.unwrap());

    store.retry_failed(&policy).await.unwrap();
    let batch = store.get_batch(id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Pending);
    assert_eq!(batch.attempt, 1);

    store.try_lock(id, "w", Duration::seconds(300)).await.unwrap().unwrap();
    assert!(store.fail(id, "w", "boom again", 0.2).await.unwrap());
    store.retry_failed(&policy).await.unwrap();
    let batch = store.get_batch(id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.error_message.as_deref(), Some("boom again"));

    fx.cleanup(&pool).await;
}
