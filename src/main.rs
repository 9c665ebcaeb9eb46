//! GPS Refinery CLI
//!
//! ## Usage
//!
//! ```bash
//! gps-refinery continuous                    # one pass, all-vehicles batches
//! gps-refinery parallel 8                    # one pass, 8 vehicles at a time
//! gps-refinery cron                          # pass every cron.interval_secs
//! gps-refinery parallel-cron 8
//! gps-refinery backfill 2025-09-01 2025-09-02 1 --parallel 4
//! gps-refinery retry 5                       # re-queue failed batches below 5 attempts
//! gps-refinery status --json
//! gps-refinery test                          # connectivity only
//! ```
//!
//! ## Environment variables
//!
//! | Variable                 | Required | Description                              |
//! |--------------------------|----------|------------------------------------------|
//! | `DATABASE_URL`           | Yes      | PostgreSQL / TimescaleDB connection URL  |
//! | `GPS_REFINERY_CONFIG`    | No       | Path to a TOML config file               |
//! | `RUST_LOG`               | No       | Log filter (default `info,gps_refinery=debug`) |

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gps_refinery::config::ProcessorConfig;
use gps_refinery::pipeline::{BackfillSummary, PassSummary, Pipeline};
use gps_refinery::status::StatusReporter;
use gps_refinery::storage::{db, BatchStore, PgStore, PingStore, Store};
use gps_refinery::types::TimeWindow;

#[derive(Parser, Debug)]
#[command(
    name = "gps-refinery",
    version,
    about = "Windowed GPS outlier filtering over TimescaleDB"
)]
struct CliArgs {
    /// Path to a TOML config file (overrides GPS_REFINERY_CONFIG)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Apply the bundled schema migrations before running
    #[arg(long, global = true)]
    migrate: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// One pass over re-queued and new windows, all vehicles per batch
    Continuous,
    /// One pass with per-vehicle batches, `max_parallel` at a time
    Parallel { max_parallel: Option<usize> },
    /// Repeat `continuous` every cron interval until interrupted
    Cron,
    /// Repeat `parallel` every cron interval until interrupted
    ParallelCron { max_parallel: Option<usize> },
    /// Reprocess an explicit range (default: the last 24 hours)
    Backfill {
        /// Range start (RFC 3339, `YYYY-MM-DD HH:MM[:SS]` or `YYYY-MM-DD`, UTC)
        start: Option<String>,
        /// Range end, exclusive
        end: Option<String>,
        /// Window length in hours
        hours: Option<i64>,
        /// Fan out per vehicle, this many at a time
        #[arg(long)]
        parallel: Option<usize>,
    },
    /// Reclaim stale locks and re-queue failed batches
    Retry { max_retries: Option<i32> },
    /// Batch rollup, active batches and health
    Status {
        #[arg(long)]
        hours: Option<i64>,
    },
    /// Status plus the per-window queue of vehicle batches
    ParallelStatus {
        #[arg(long)]
        hours: Option<i64>,
    },
    /// Check database connectivity and exit
    Test,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let args = CliArgs::parse();
    init_tracing(args.log_json);

    let config = load_config(&args)?;
    if config.database.url.is_empty() {
        anyhow::bail!("DATABASE_URL must be set via --database-url, DATABASE_URL or [database].url");
    }

    // ── Database ──────────────────────────────────────────────────────────────
    let pool = db::create_pool(&config.database)
        .await
        .context("connecting to the time-series store")?;
    let version = db::ping(&pool).await.context("database ping")?;
    info!(version = %version, "Connected to database");

    if args.migrate {
        db::run_migrations(&pool)
            .await
            .context("applying schema migrations")?;
        info!("Migrations applied");
    }

    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));

    // ── Shutdown ──────────────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));
    let grace = config.cron.shutdown_grace();

    let json = args.json;
    match args.command {
        Command::Status { hours } | Command::ParallelStatus { hours } => {
            let with_queue = matches!(args.command, Command::ParallelStatus { .. });
            let mut config = config;
            if let Some(hours) = hours {
                config.status.queue_hours = hours;
            }
            let report = StatusReporter::new(store, config)
                .report(with_queue)
                .await
                .context("building status report")?;
            if json {
                print_json(&report)?;
            } else {
                print!("{report}");
            }
        }
        Command::Retry { max_retries } => {
            let pipeline = Pipeline::new(store, config);
            let report = pipeline.run_retry(max_retries).await?;
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "Reclaimed {} stale batches, re-queued {} failed batches",
                    report.reclaimed, report.requeued
                );
            }
        }
        Command::Continuous | Command::Parallel { .. } => {
            let parallel = match args.command {
                Command::Parallel { max_parallel } => {
                    Some(max_parallel.unwrap_or(config.scheduler.default_max_parallel))
                }
                _ => None,
            };
            let pipeline = Pipeline::new(store, config);
            info!(owner = %pipeline.owner(), parallel = ?parallel, "Starting continuous pass");
            let fut = pipeline.run_continuous_pass(parallel, &cancel);
            if let Some(summary) = with_grace(fut, &cancel, grace).await {
                print_pass(&summary?, json)?;
            }
        }
        Command::Cron | Command::ParallelCron { .. } => {
            let parallel = match args.command {
                Command::ParallelCron { max_parallel } => {
                    Some(max_parallel.unwrap_or(config.scheduler.default_max_parallel))
                }
                _ => None,
            };
            let pipeline = Pipeline::new(store, config);
            info!(owner = %pipeline.owner(), parallel = ?parallel, "Starting cron");
            let fut = pipeline.run_cron(parallel, &cancel);
            if let Some(totals) = with_grace(fut, &cancel, grace).await {
                print_pass(&totals, json)?;
            }
        }
        Command::Backfill {
            start,
            end,
            hours,
            parallel,
        } => {
            let now = store.server_time().await?;
            let range = backfill_range(start.as_deref(), end.as_deref(), now, &config)?;
            let step = Duration::hours(hours.unwrap_or(config.backfill.hours_per_batch));
            let pipeline = Pipeline::new(store, config);
            let fut = pipeline.run_backfill(range, step, parallel, &cancel);
            if let Some(summary) = with_grace(fut, &cancel, grace).await {
                print_backfill(&summary?, json)?;
            }
        }
        Command::Test => run_test(store.as_ref(), &version, json).await?,
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,gps_refinery=debug"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(args: &CliArgs) -> Result<ProcessorConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let mut config = ProcessorConfig::load_from_file(path)
                .with_context(|| format!("loading config from {}", path.display()))?;
            config.apply_env_overrides();
            config
        }
        None => ProcessorConfig::load(),
    };
    if let Some(url) = args.database_url.as_ref().filter(|u| !u.is_empty()) {
        config.database.url.clone_from(url);
    }
    config.validate()?;
    Ok(config)
}

/// Drive `fut` to completion. Once `cancel` fires, give it `grace` to
/// finish in-flight work; `None` means it was abandoned.
async fn with_grace<F: Future>(
    fut: F,
    cancel: &CancellationToken,
    grace: std::time::Duration,
) -> Option<F::Output> {
    tokio::pin!(fut);
    tokio::select! {
        out = &mut fut => return Some(out),
        () = cancel.cancelled() => {}
    }

    info!(grace_secs = grace.as_secs(), "Waiting for in-flight work");
    if let Ok(out) = tokio::time::timeout(grace, fut).await {
        Some(out)
    } else {
        warn!("Grace period elapsed, abandoning in-flight batches (their locks will go stale)");
        None
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received");
            cancel.cancel();
        }
        Err(e) => warn!(error = %e, "Failed to install Ctrl+C handler"),
    }
}

async fn run_test(store: &dyn Store, version: &str, json: bool) -> Result<()> {
    let server_time = store.server_time().await?;
    let latest_ping = store.latest_ping_time().await?;
    let high_water_mark = store.high_water_mark().await?;

    if json {
        #[derive(Serialize)]
        struct Connectivity<'a> {
            backend: &'a str,
            version: &'a str,
            server_time: DateTime<Utc>,
            latest_ping: Option<DateTime<Utc>>,
            high_water_mark: Option<DateTime<Utc>>,
        }
        print_json(&Connectivity {
            backend: store.backend_name(),
            version,
            server_time,
            latest_ping,
            high_water_mark,
        })
    } else {
        println!("Connection OK ({})", store.backend_name());
        println!("  server:          {version}");
        println!("  server time:     {server_time}");
        println!("  latest raw ping: {}", fmt_opt(latest_ping));
        println!("  high-water mark: {}", fmt_opt(high_water_mark));
        Ok(())
    }
}

/// Explicit bounds, or `backfill.default_lookback_hours` ending at the
/// start of the current window.
fn backfill_range(
    start: Option<&str>,
    end: Option<&str>,
    now: DateTime<Utc>,
    config: &ProcessorConfig,
) -> Result<TimeWindow> {
    let end = match end {
        Some(s) => parse_timestamp(s)?,
        None => TimeWindow::aligned(now, config.scheduler.window_len())?.start,
    };
    let start = match start {
        Some(s) => parse_timestamp(s)?,
        None => end - Duration::hours(config.backfill.default_lookback_hours),
    };
    Ok(TimeWindow::new(start, end)?)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(t.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
        .with_context(|| format!("unrecognised timestamp '{s}'"))
}

fn fmt_opt(t: Option<DateTime<Utc>>) -> String {
    t.map_or_else(|| "-".to_string(), |t| t.to_string())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_pass(summary: &PassSummary, json: bool) -> Result<()> {
    if json {
        return print_json(summary);
    }
    println!(
        "Windows: {} new, {} re-queued batches re-run",
        summary.windows, summary.requeued_run
    );
    println!(
        "Batches: {} completed, {} failed, {} skipped (locked), {} errors",
        summary.completed, summary.failed, summary.skipped, summary.errors
    );
    println!(
        "Rows:    {} processed, {} outliers",
        summary.rows_processed, summary.rows_filtered
    );
    if summary.cancelled {
        println!("Stopped early on shutdown signal");
    }
    Ok(())
}

fn print_backfill(summary: &BackfillSummary, json: bool) -> Result<()> {
    if json {
        return print_json(summary);
    }
    println!(
        "Backfill {}: {}/{} windows",
        summary.range, summary.totals.windows, summary.windows_planned
    );
    print_pass(&summary.totals, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_timestamp_formats() {
        let want = Utc.with_ymd_and_hms(2025, 9, 1, 6, 30, 0).unwrap();
        assert_eq!(parse_timestamp("2025-09-01T06:30:00Z").unwrap(), want);
        assert_eq!(parse_timestamp("2025-09-01T08:30:00+02:00").unwrap(), want);
        assert_eq!(parse_timestamp("2025-09-01 06:30:00").unwrap(), want);
        assert_eq!(parse_timestamp("2025-09-01 06:30").unwrap(), want);
        assert_eq!(
            parse_timestamp("2025-09-01").unwrap(),
            Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).unwrap()
        );
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_default_backfill_range_is_last_day() {
        let config = ProcessorConfig::default();
        let now = Utc.with_ymd_and_hms(2025, 9, 2, 10, 17, 0).unwrap();
        let range = backfill_range(None, None, now, &config).unwrap();
        assert_eq!(range.end, Utc.with_ymd_and_hms(2025, 9, 2, 10, 0, 0).unwrap());
        assert_eq!(
            range.duration(),
            Duration::hours(config.backfill.default_lookback_hours)
        );
    }

    #[test]
    fn test_backfill_range_rejects_inverted_bounds() {
        let config = ProcessorConfig::default();
        let now = Utc::now();
        assert!(backfill_range(Some("2025-09-02"), Some("2025-09-01"), now, &config).is_err());
    }

    #[test]
    fn test_cli_parses_modes() {
        let args = CliArgs::try_parse_from([
            "gps-refinery",
            "backfill",
            "2025-09-01",
            "2025-09-02",
            "2",
            "--parallel",
            "4",
            "--json",
        ])
        .unwrap();
        assert!(args.json);
        match args.command {
            Command::Backfill {
                start,
                end,
                hours,
                parallel,
            } => {
                assert_eq!(start.as_deref(), Some("2025-09-01"));
                assert_eq!(end.as_deref(), Some("2025-09-02"));
                assert_eq!(hours, Some(2));
                assert_eq!(parallel, Some(4));
            }
            other => panic!("unexpected command {other:?}"),
        }

        let args = CliArgs::try_parse_from(["gps-refinery", "parallel-cron", "6"]).unwrap();
        assert!(matches!(
            args.command,
            Command::ParallelCron {
                max_parallel: Some(6)
            }
        ));
    }
}
