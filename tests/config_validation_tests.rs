//! Config Validation Tests
//!
//! Exercises the config layer from the outside: typo detection on raw
//! TOML, range validation on parsed configs, and the file/env loading
//! order.

use std::io::Write;

use gps_refinery::config::validation::{
    known_config_keys, suggest_correction, validate_ranges, validate_unknown_keys,
};
use gps_refinery::config::{ConfigError, ProcessorConfig, CONFIG_ENV_VAR};

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

// ============================================================================
// Typo Detection
// ============================================================================

#[test]
fn typo_in_locking_section_warns_with_suggestion() {
    let warnings = validate_unknown_keys(
        r#"
[locking]
stale_afer_secs = 600
"#,
    );
    assert_eq!(warnings.len(), 1, "Expected exactly 1 warning");
    assert!(warnings[0].field.contains("stale_afer_secs"));
    assert_eq!(
        warnings[0].suggestion.as_deref(),
        Some("locking.stale_after_secs"),
        "Should suggest the correct spelling"
    );
}

#[test]
fn misspelled_section_name_warns() {
    let warnings = validate_unknown_keys(
        r#"
[schedular]
window_minutes = 30
"#,
    );
    assert!(!warnings.is_empty());
    assert!(warnings.iter().any(|w| w.field == "schedular"));
    assert!(warnings
        .iter()
        .any(|w| w.suggestion.as_deref() == Some("scheduler")));
}

#[test]
fn valid_keys_produce_no_warnings() {
    let warnings = validate_unknown_keys(
        r#"
[filter]
max_implied_speed_kmh = 130.0
max_speed_divergence_kmh = 50.0

[retry]
max_retries = 5

[backfill]
pause_ms = 250
"#,
    );
    assert!(warnings.is_empty(), "unexpected: {warnings:?}");
}

#[test]
fn unrelated_key_gets_no_suggestion() {
    let known = known_config_keys();
    assert!(suggest_correction("telemetry.endpoint_url_override", &known).is_none());
}

#[test]
fn unknown_keys_do_not_break_loading() {
    let file = write_config(
        r#"
[filter]
max_implied_speed_kmh = 110.0
legacy_mode = true
"#,
    );
    let config = ProcessorConfig::load_from_file(file.path()).unwrap();
    assert!((config.filter.max_implied_speed_kmh - 110.0).abs() < f64::EPSILON);
}

// ============================================================================
// Range Validation
// ============================================================================

#[test]
fn negative_settle_delay_is_rejected() {
    let mut config = ProcessorConfig::default();
    config.scheduler.settle_delay_secs = -5;
    let (errors, _) = validate_ranges(&config);
    assert!(errors.iter().any(|e| e.contains("settle_delay_secs")));
}

#[test]
fn warning_after_must_not_exceed_stale_after() {
    let mut config = ProcessorConfig::default();
    config.locking.warning_after_secs = 900;
    config.locking.stale_after_secs = 300;
    let err = config.validate().unwrap_err();
    match err {
        ConfigError::Validation(errors) => {
            assert!(errors.iter().any(|e| e.contains("warning_after_secs")));
        }
        other => panic!("expected validation error, got {other}"),
    }
}

#[test]
fn zero_intervals_are_rejected() {
    let mut config = ProcessorConfig::default();
    config.cron.interval_secs = 0;
    config.locking.heartbeat_interval_secs = 0;
    config.scheduler.max_windows_per_run = 0;
    let (errors, _) = validate_ranges(&config);
    assert!(errors.iter().any(|e| e.contains("cron.interval_secs")));
    assert!(errors.iter().any(|e| e.contains("heartbeat_interval_secs")));
    assert!(errors.iter().any(|e| e.contains("max_windows_per_run")));
}

#[test]
fn non_finite_divergence_is_rejected() {
    let mut config = ProcessorConfig::default();
    config.filter.max_speed_divergence_kmh = Some(f64::NAN);
    let (errors, _) = validate_ranges(&config);
    assert!(errors.iter().any(|e| e.contains("max_speed_divergence_kmh")));
}

#[test]
fn odd_window_length_only_warns() {
    let mut config = ProcessorConfig::default();
    config.scheduler.window_minutes = 7;
    let (errors, warnings) = validate_ranges(&config);
    assert!(errors.is_empty(), "{errors:?}");
    assert!(warnings.iter().any(|w| w.field == "scheduler.window_minutes"));
}

#[test]
fn inverted_lag_thresholds_are_rejected() {
    let mut config = ProcessorConfig::default();
    config.status.lag_warning_windows = 10;
    config.status.lag_critical_windows = 3;
    let (errors, _) = validate_ranges(&config);
    assert!(errors.iter().any(|e| e.contains("lag_critical_windows")));
}

// ============================================================================
// Loading Order
// ============================================================================

#[test]
fn env_var_config_and_database_url_override() {
    let file = write_config(
        r#"
[database]
url = "postgres://from-file/db"

[scheduler]
window_minutes = 15
"#,
    );

    // The only test in this binary that touches the process environment
    std::env::set_var(CONFIG_ENV_VAR, file.path());
    std::env::remove_var("DATABASE_URL");
    std::env::remove_var("TIMESCALE_DATABASE_URL");

    let config = ProcessorConfig::load();
    assert_eq!(config.scheduler.window_minutes, 15);
    assert_eq!(config.database.url, "postgres://from-file/db");

    std::env::set_var("TIMESCALE_DATABASE_URL", "postgres://timescale/db");
    assert_eq!(ProcessorConfig::load().database.url, "postgres://timescale/db");

    std::env::set_var("DATABASE_URL", "postgres://primary/db");
    assert_eq!(ProcessorConfig::load().database.url, "postgres://primary/db");

    std::env::set_var(CONFIG_ENV_VAR, "/nonexistent/refinery.toml");
    let fallback = ProcessorConfig::load();
    assert_eq!(fallback.scheduler.window_minutes, 60);

    std::env::remove_var(CONFIG_ENV_VAR);
    std::env::remove_var("DATABASE_URL");
    std::env::remove_var("TIMESCALE_DATABASE_URL");
}
