//! Processor Configuration Module
//!
//! Per-deployment configuration loaded from TOML, with every pipeline
//! threshold operator-tunable.
//!
//! ## Loading Order
//!
//! 1. `GPS_REFINERY_CONFIG` environment variable (path to TOML file)
//! 2. `refinery.toml` in the current working directory
//! 3. Built-in defaults (`config::defaults`)
//!
//! `DATABASE_URL` / `TIMESCALE_DATABASE_URL` override `database.url`.
//!
//! The loaded config is passed by value into component constructors;
//! nothing here is process-global.

mod processor_config;
pub mod defaults;
pub mod validation;

pub use processor_config::*;
