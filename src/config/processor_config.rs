//! Processor Configuration - every pipeline tunable as a TOML value
//!
//! Each section implements `Default` from `config::defaults`, so a missing
//! file or a partial file behaves identically to the built-in constants.

use super::defaults;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming a config file.
pub const CONFIG_ENV_VAR: &str = "GPS_REFINERY_CONFIG";

/// Config file picked up from the working directory.
pub const LOCAL_CONFIG_FILE: &str = "refinery.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for a refinery deployment.
///
/// Load with `ProcessorConfig::load()` which searches:
/// 1. `$GPS_REFINERY_CONFIG`
/// 2. `./refinery.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub filter: FilterConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub locking: LockingConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub cron: CronConfig,

    #[serde(default)]
    pub backfill: BackfillConfig,

    #[serde(default)]
    pub status: StatusConfig,
}

impl ProcessorConfig {
    /// Load configuration using the standard search order, then apply
    /// environment overrides. File errors fall through to the next source.
    pub fn load() -> Self {
        let mut config = Self::load_from_search_path();
        config.apply_env_overrides();
        config
    }

    fn load_from_search_path() -> Self {
        // 1. Env var
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded processor config from {}", CONFIG_ENV_VAR);
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {}, falling back", CONFIG_ENV_VAR);
                    }
                }
            } else {
                warn!(path = %path, "{} points to non-existent file, falling back", CONFIG_ENV_VAR);
            }
        }

        // 2. ./refinery.toml
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded processor config from ./{}", LOCAL_CONFIG_FILE);
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", LOCAL_CONFIG_FILE);
                }
            }
        }

        // 3. Defaults
        info!("No {} found, using built-in defaults", LOCAL_CONFIG_FILE);
        Self::default()
    }

    /// Load from a specific TOML file. Unknown keys are logged, not rejected.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;

        for w in super::validation::validate_unknown_keys(&contents) {
            warn!("{}", w);
        }

        toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    /// `DATABASE_URL` wins over `TIMESCALE_DATABASE_URL`; both win over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Some(url) = ["DATABASE_URL", "TIMESCALE_DATABASE_URL"]
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        {
            self.database.url = url;
        }
    }

    /// Serialize the current config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate ranges and cross-field consistency.
    ///
    /// Suspicious-but-legal values are logged as warnings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (errors, warnings) = super::validation::validate_ranges(self);
        for w in &warnings {
            warn!(field = %w.field, "{}", w);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

/// Time-series store connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL / TimescaleDB URL; usually supplied via `DATABASE_URL`
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: defaults::DB_MAX_CONNECTIONS,
            acquire_timeout_secs: defaults::DB_ACQUIRE_TIMEOUT_SECS,
        }
    }
}

/// Plausibility filter thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Ceiling on distance / Δt between accepted fixes (km/h)
    pub max_implied_speed_kmh: f64,
    /// Reported-vs-implied speed divergence limit (km/h); `None` disables the check
    pub max_speed_divergence_kmh: Option<f64>,
    /// Divergence is only judged across gaps up to this long (seconds)
    pub divergence_max_gap_secs: f64,
    /// Look-back for the last accepted fix that seeds a window (minutes)
    pub seed_lookback_minutes: i64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_implied_speed_kmh: defaults::MAX_IMPLIED_SPEED_KMH,
            max_speed_divergence_kmh: None,
            divergence_max_gap_secs: defaults::DIVERGENCE_MAX_GAP_SECS,
            seed_lookback_minutes: defaults::SEED_LOOKBACK_MINUTES,
        }
    }
}

impl FilterConfig {
    pub fn seed_lookback(&self) -> Duration {
        Duration::minutes(self.seed_lookback_minutes)
    }
}

/// Window scheduling and fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub window_minutes: i64,
    pub max_windows_per_run: u32,
    pub settle_delay_secs: i64,
    pub max_vehicles_per_window: u32,
    pub default_max_parallel: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            window_minutes: defaults::WINDOW_MINUTES,
            max_windows_per_run: defaults::MAX_WINDOWS_PER_RUN,
            settle_delay_secs: defaults::SETTLE_DELAY_SECS,
            max_vehicles_per_window: defaults::MAX_VEHICLES_PER_WINDOW,
            default_max_parallel: defaults::DEFAULT_MAX_PARALLEL,
        }
    }
}

impl SchedulerConfig {
    pub fn window_len(&self) -> Duration {
        Duration::minutes(self.window_minutes)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::seconds(self.settle_delay_secs)
    }
}

/// Heartbeat lock timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    pub heartbeat_interval_secs: u64,
    pub warning_after_secs: i64,
    pub stale_after_secs: i64,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: defaults::HEARTBEAT_INTERVAL_SECS,
            warning_after_secs: defaults::HEARTBEAT_WARNING_AFTER_SECS,
            stale_after_secs: defaults::HEARTBEAT_STALE_AFTER_SECS,
        }
    }
}

impl LockingConfig {
    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn warning_after(&self) -> Duration {
        Duration::seconds(self.warning_after_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::seconds(self.stale_after_secs)
    }
}

/// Retry ceiling and backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: i32,
    pub base_delay_secs: i64,
    pub max_backoff_exponent: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: defaults::MAX_RETRIES,
            base_delay_secs: defaults::RETRY_BASE_DELAY_SECS,
            max_backoff_exponent: defaults::RETRY_MAX_BACKOFF_EXPONENT,
        }
    }
}

/// Periodic re-invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    pub interval_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            interval_secs: defaults::CRON_INTERVAL_SECS,
            shutdown_grace_secs: defaults::SHUTDOWN_GRACE_SECS,
        }
    }
}

impl CronConfig {
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs)
    }

    pub fn shutdown_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Historical reprocessing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    pub hours_per_batch: i64,
    pub default_lookback_hours: i64,
    pub pause_ms: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            hours_per_batch: defaults::BACKFILL_HOURS_PER_BATCH,
            default_lookback_hours: defaults::BACKFILL_DEFAULT_LOOKBACK_HOURS,
            pause_ms: defaults::BACKFILL_PAUSE_MS,
        }
    }
}

/// Status reporter views and health thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub queue_hours: i64,
    pub active_limit: u32,
    pub lag_warning_windows: i64,
    pub lag_critical_windows: i64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            queue_hours: defaults::STATUS_QUEUE_HOURS,
            active_limit: defaults::STATUS_ACTIVE_LIMIT,
            lag_warning_windows: defaults::LAG_WARNING_WINDOWS,
            lag_critical_windows: defaults::LAG_CRITICAL_WINDOWS,
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, toml::de::Error),
    Serialize(toml::ser::Error),
    Validation(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Config I/O error ({}): {}", path.display(), e),
            ConfigError::Parse(path, e) => {
                write!(f, "Config parse error ({}): {}", path.display(), e)
            }
            ConfigError::Serialize(e) => write!(f, "Config serialization error: {}", e),
            ConfigError::Validation(errors) => {
                writeln!(f, "Config validation failed:")?;
                for e in errors {
                    writeln!(f, "  - {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}
