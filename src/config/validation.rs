//! Config validation: unknown-key detection with Levenshtein suggestions
//! and range checks.
//!
//! Two-pass parse approach: first deserialize raw TOML into `toml::Value`,
//! walk the key tree, compare against known field names, and emit warnings
//! with "did you mean?" suggestions. Then proceed with normal serde
//! deserialization. Warnings never break existing configs.

use super::ProcessorConfig;
use std::collections::HashSet;

/// A non-fatal config warning (typo, suspicious value).
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, "; did you mean '{s}'?")?;
        }
        Ok(())
    }
}

// ============================================================================
// Known Config Keys
// ============================================================================

/// Returns the complete set of valid dotted key paths for ProcessorConfig.
///
/// Maintained by hand to match the structs in processor_config.rs.
pub fn known_config_keys() -> HashSet<&'static str> {
    let keys: &[&str] = &[
        // [database]
        "database",
        "database.url",
        "database.max_connections",
        "database.acquire_timeout_secs",
        // [filter]
        "filter",
        "filter.max_implied_speed_kmh",
        "filter.max_speed_divergence_kmh",
        "filter.divergence_max_gap_secs",
        "filter.seed_lookback_minutes",
        // [scheduler]
        "scheduler",
        "scheduler.window_minutes",
        "scheduler.max_windows_per_run",
        "scheduler.settle_delay_secs",
        "scheduler.max_vehicles_per_window",
        "scheduler.default_max_parallel",
        // [locking]
        "locking",
        "locking.heartbeat_interval_secs",
        "locking.warning_after_secs",
        "locking.stale_after_secs",
        // [retry]
        "retry",
        "retry.max_retries",
        "retry.base_delay_secs",
        "retry.max_backoff_exponent",
        // [cron]
        "cron",
        "cron.interval_secs",
        "cron.shutdown_grace_secs",
        // [backfill]
        "backfill",
        "backfill.hours_per_batch",
        "backfill.default_lookback_hours",
        "backfill.pause_ms",
        // [status]
        "status",
        "status.queue_hours",
        "status.active_limit",
        "status.lag_warning_windows",
        "status.lag_critical_windows",
    ];
    keys.iter().copied().collect()
}

// ============================================================================
// TOML Key Walking
// ============================================================================

/// Recursively walks a `toml::Value` tree and collects all dotted key paths.
///
/// For example, a table `{ a = { b = 1, c = 2 } }` yields:
/// `["a", "a.b", "a.c"]`
pub fn walk_toml_keys(value: &toml::Value, prefix: &str) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(table) = value.as_table() {
        for (k, v) in table {
            let path = if prefix.is_empty() {
                k.clone()
            } else {
                format!("{prefix}.{k}")
            };
            keys.push(path.clone());
            if v.is_table() {
                keys.extend(walk_toml_keys(v, &path));
            }
        }
    }
    keys
}

// ============================================================================
// Levenshtein Distance
// ============================================================================

fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b_chars.len();
    }
    if b_chars.is_empty() {
        return a.chars().count();
    }

    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_chars.len()]
}

/// Suggest the closest known key for an unknown key, if within edit distance 3.
pub fn suggest_correction(unknown: &str, known: &HashSet<&str>) -> Option<String> {
    known
        .iter()
        .map(|k| (*k, levenshtein(unknown, k)))
        .filter(|(_, dist)| *dist <= 3)
        .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)))
        .map(|(k, _)| k.to_string())
}

// ============================================================================
// Unknown Key Validation (entry point)
// ============================================================================

/// Parse a raw TOML string and return warnings for any unknown config keys.
///
/// Does not fail on unknown keys; parse errors surface later through serde.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ValidationWarning> {
    let Ok(value) = raw_toml.parse::<toml::Value>() else {
        return Vec::new();
    };

    let known = known_config_keys();
    walk_toml_keys(&value, "")
        .into_iter()
        .filter(|key| !known.contains(key.as_str()))
        .map(|key| ValidationWarning {
            suggestion: suggest_correction(&key, &known),
            message: format!("Unknown config key '{key}'"),
            field: key,
        })
        .collect()
}

// ============================================================================
// Range Validation
// ============================================================================

/// Validate ranges on a parsed ProcessorConfig.
///
/// Returns (errors, warnings). Errors are values the pipeline cannot run
/// with; warnings are legal but likely mistakes.
pub fn validate_ranges(config: &ProcessorConfig) -> (Vec<String>, Vec<ValidationWarning>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    // Filter
    let ceiling = config.filter.max_implied_speed_kmh;
    if !ceiling.is_finite() || ceiling <= 0.0 {
        errors.push(format!(
            "filter.max_implied_speed_kmh = {ceiling} must be a positive finite number"
        ));
    } else if ceiling < 30.0 || ceiling > 1_000.0 {
        warnings.push(ValidationWarning {
            field: "filter.max_implied_speed_kmh".to_string(),
            message: format!(
                "max_implied_speed_kmh = {ceiling:.1} is outside typical range (30-1000 km/h)"
            ),
            suggestion: None,
        });
    }
    if let Some(div) = config.filter.max_speed_divergence_kmh {
        if !div.is_finite() || div <= 0.0 {
            errors.push(format!(
                "filter.max_speed_divergence_kmh = {div} must be a positive finite number"
            ));
        }
    }
    let gap = config.filter.divergence_max_gap_secs;
    if !gap.is_finite() || gap <= 0.0 {
        errors.push(format!(
            "filter.divergence_max_gap_secs = {gap} must be a positive finite number"
        ));
    }
    if config.filter.seed_lookback_minutes < 0 {
        errors.push(format!(
            "filter.seed_lookback_minutes = {} cannot be negative",
            config.filter.seed_lookback_minutes
        ));
    }

    // Scheduler
    let s = &config.scheduler;
    if s.window_minutes <= 0 {
        errors.push(format!("scheduler.window_minutes = {} must be > 0", s.window_minutes));
    } else if 1_440 % s.window_minutes != 0 {
        warnings.push(ValidationWarning {
            field: "scheduler.window_minutes".to_string(),
            message: format!(
                "window_minutes = {} does not divide a day; windows will drift across midnight",
                s.window_minutes
            ),
            suggestion: None,
        });
    }
    if s.max_windows_per_run == 0 {
        errors.push("scheduler.max_windows_per_run must be > 0".to_string());
    }
    if s.settle_delay_secs < 0 {
        errors.push(format!(
            "scheduler.settle_delay_secs = {} cannot be negative",
            s.settle_delay_secs
        ));
    }
    if s.max_vehicles_per_window == 0 {
        errors.push("scheduler.max_vehicles_per_window must be > 0".to_string());
    }
    if s.default_max_parallel == 0 {
        errors.push("scheduler.default_max_parallel must be > 0".to_string());
    }

    // Database
    if config.database.max_connections == 0 {
        errors.push("database.max_connections must be > 0".to_string());
    } else if s.default_max_parallel > config.database.max_connections as usize {
        warnings.push(ValidationWarning {
            field: "scheduler.default_max_parallel".to_string(),
            message: format!(
                "default_max_parallel = {} exceeds database.max_connections = {}; workers will queue for connections",
                s.default_max_parallel, config.database.max_connections
            ),
            suggestion: None,
        });
    }

    // Locking: heartbeat must fire several times before a lock goes stale
    let l = &config.locking;
    if l.heartbeat_interval_secs == 0 {
        errors.push("locking.heartbeat_interval_secs must be > 0".to_string());
    }
    if l.stale_after_secs <= 0 {
        errors.push(format!("locking.stale_after_secs = {} must be > 0", l.stale_after_secs));
    }
    if l.warning_after_secs > l.stale_after_secs {
        errors.push(format!(
            "locking.warning_after_secs ({}) must be <= stale_after_secs ({})",
            l.warning_after_secs, l.stale_after_secs
        ));
    }
    let hb = i64::try_from(l.heartbeat_interval_secs).unwrap_or(i64::MAX);
    if hb.saturating_mul(2) > l.stale_after_secs {
        errors.push(format!(
            "locking.heartbeat_interval_secs ({}) must be at most half of stale_after_secs ({})",
            l.heartbeat_interval_secs, l.stale_after_secs
        ));
    }

    // Retry
    if config.retry.max_retries < 0 {
        errors.push(format!(
            "retry.max_retries = {} cannot be negative",
            config.retry.max_retries
        ));
    }
    if config.retry.base_delay_secs < 0 {
        errors.push(format!(
            "retry.base_delay_secs = {} cannot be negative",
            config.retry.base_delay_secs
        ));
    }
    if config.retry.max_backoff_exponent > 20 {
        errors.push(format!(
            "retry.max_backoff_exponent = {} is too large (max 20)",
            config.retry.max_backoff_exponent
        ));
    }

    // Cron / backfill / status
    if config.cron.interval_secs == 0 {
        errors.push("cron.interval_secs must be > 0".to_string());
    }
    if config.backfill.hours_per_batch <= 0 {
        errors.push(format!(
            "backfill.hours_per_batch = {} must be > 0",
            config.backfill.hours_per_batch
        ));
    }
    if config.status.lag_critical_windows < config.status.lag_warning_windows {
        errors.push(format!(
            "status.lag_critical_windows ({}) must be >= lag_warning_windows ({})",
            config.status.lag_critical_windows, config.status.lag_warning_windows
        ));
    }

    (errors, warnings)
}

// ============================================================================
// Tests
// ============================================================================
